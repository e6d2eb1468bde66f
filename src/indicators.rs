//! Rolling ATR over short historical bars.
//!
//! True range per bar: `max(high − low, |high − prev_close|, |low −
//! prev_close|)`; ATR is the mean of the trailing `period` true ranges and
//! stays `None` until that many bars exist. Bars come from the broker's
//! historical-bars endpoint and are refreshed on a schedule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Bar, BrokerClient};
use crate::engine::bus::EventBus;
use crate::engine::events::{Event, EventPayload, IndicatorUpdate};

// ─────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AtrConfig {
    /// Number of true ranges averaged.
    pub period: usize,
    /// Bar size in seconds.
    pub bar_secs: u64,
    /// How often the refresh task re-fetches bars.
    pub refresh_interval: Duration,
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self {
            period: 14,
            bar_secs: 10,
            refresh_interval: Duration::from_secs(30),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────

pub struct AtrService {
    cfg: AtrConfig,
    broker: Arc<dyn BrokerClient>,
    bus: Arc<EventBus>,
    bars: Mutex<HashMap<String, Vec<Bar>>>,
}

impl AtrService {
    pub fn new(cfg: AtrConfig, broker: Arc<dyn BrokerClient>, bus: Arc<EventBus>) -> Self {
        Self {
            cfg,
            broker,
            bus,
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Current ATR for a symbol, or `None` until enough bars are cached.
    pub fn atr(&self, symbol: &str) -> Option<f64> {
        let bars = self.bars.lock().expect("bar cache lock poisoned");
        bars.get(symbol).and_then(|b| atr_from_bars(b, self.cfg.period))
    }

    /// Generic indicator lookup used by market conditions.
    pub fn value(&self, symbol: &str, name: &str) -> Option<f64> {
        match name {
            "ATR" => self.atr(symbol),
            _ => None,
        }
    }

    /// Replace the cached bars for a symbol.
    pub fn update_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.bars
            .lock()
            .expect("bar cache lock poisoned")
            .insert(symbol.to_string(), bars);
    }

    /// Re-fetch bars for every symbol once. Emits an indicator event per
    /// symbol whose ATR is computable.
    pub async fn refresh(&self, symbols: &[String]) {
        // Enough history for period+1 bars (TR needs the previous close).
        let duration_secs = self.cfg.bar_secs * (self.cfg.period as u64 + 2);
        for symbol in symbols {
            match self
                .broker
                .request_historical_bars(symbol, duration_secs, self.cfg.bar_secs)
                .await
            {
                Ok(bars) => {
                    debug!("atr: {} refreshed with {} bars", symbol, bars.len());
                    self.update_bars(symbol, bars);
                    if let Some(atr) = self.atr(symbol) {
                        self.bus
                            .emit(Event::new(
                                "indicators",
                                EventPayload::Indicator(IndicatorUpdate {
                                    symbol: symbol.clone(),
                                    name: "ATR".into(),
                                    value: atr,
                                }),
                            ))
                            .await;
                    }
                }
                Err(err) => {
                    warn!("atr: bar fetch for {} failed: {}", symbol, err);
                }
            }
        }
    }

    /// Long-running refresh loop. Abort the handle to stop.
    pub fn spawn_refresh(self: &Arc<Self>, symbols: Vec<String>) -> JoinHandle<()> {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                "atr refresh started | period={} bar={}s every {:?} for {} symbols",
                svc.cfg.period,
                svc.cfg.bar_secs,
                svc.cfg.refresh_interval,
                symbols.len(),
            );
            let mut ticker = tokio::time::interval(svc.cfg.refresh_interval);
            loop {
                ticker.tick().await;
                svc.refresh(&symbols).await;
            }
        })
    }
}

/// Mean of the trailing `period` true ranges, or `None` with fewer bars.
fn atr_from_bars(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let mut ranges = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        let tr = if i == 0 {
            bar.high - bar.low
        } else {
            let prev_close = bars[i - 1].close;
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        };
        ranges.push(tr);
    }

    let tail = &ranges[ranges.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}
