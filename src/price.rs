//! Last-price lookup.
//!
//! `last_price` answers from the tick the broker stream most recently pushed
//! when it is fresh enough, and otherwise requests snapshot market data and
//! waits for the first matching tick with a bounded timeout. Nothing is
//! cached beyond what the stream itself provides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::BrokerClient;
use crate::engine::bus::{handler, EventBus};
use crate::engine::events::{EventKind, EventPayload};
use crate::errors::BrokerError;

#[derive(Debug, Clone)]
pub struct PriceConfig {
    /// How long `last_price` waits for a snapshot tick.
    pub timeout: Duration,
    /// Stream ticks younger than this answer without a snapshot request.
    pub staleness: Duration,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            staleness: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LastTick {
    pub price: f64,
    pub volume: u64,
    pub at: Instant,
}

pub struct PriceService {
    cfg: PriceConfig,
    broker: Arc<dyn BrokerClient>,
    ticks: Mutex<HashMap<String, LastTick>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<f64>>>>,
}

impl PriceService {
    pub fn new(cfg: PriceConfig, broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            cfg,
            broker,
            ticks: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the price stream on `bus`. Must be called once during
    /// wiring, before any `last_price` call.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let svc = Arc::clone(self);
        bus.subscribe(
            EventKind::Price,
            "price-service",
            handler(move |evt| {
                let svc = svc.clone();
                async move {
                    if let EventPayload::Price(tick) = evt.payload {
                        svc.on_tick(&tick.symbol, tick.price, tick.volume);
                    }
                    Ok(())
                }
            }),
        );
    }

    fn on_tick(&self, symbol: &str, price: f64, volume: u64) {
        if price <= 0.0 {
            return;
        }
        self.ticks.lock().expect("tick cache lock poisoned").insert(
            symbol.to_string(),
            LastTick {
                price,
                volume,
                at: Instant::now(),
            },
        );
        if let Some(waiting) = self
            .waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(symbol)
        {
            for tx in waiting {
                let _ = tx.send(price);
            }
        }
    }

    /// Most recent stream tick regardless of age (for rule predicates).
    pub fn last_tick(&self, symbol: &str) -> Option<LastTick> {
        self.ticks
            .lock()
            .expect("tick cache lock poisoned")
            .get(symbol)
            .copied()
    }

    /// Best-effort quote. Fresh stream ticks answer immediately; otherwise a
    /// snapshot subscription is opened and the first tick within the timeout
    /// wins. Duplicate-subscription reports from the broker are tolerated.
    pub async fn last_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        if let Some(tick) = self.last_tick(symbol) {
            if tick.at.elapsed() < self.cfg.staleness {
                return Ok(tick.price);
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
            let entry = waiters.entry(symbol.to_string()).or_default();
            entry.retain(|w| !w.is_closed());
            entry.push(tx);
        }

        let req_id = match self.broker.subscribe_market_data(symbol).await {
            Ok(id) => Some(id),
            Err(BrokerError::Duplicate(msg)) => {
                // Someone is already streaming this symbol; just wait.
                debug!("price: duplicate subscription tolerated: {}", msg);
                None
            }
            Err(err) => {
                warn!("price: market data request for {} failed: {}", symbol, err);
                return Err(err);
            }
        };

        let outcome = tokio::time::timeout(self.cfg.timeout, rx).await;

        if let Some(req_id) = req_id {
            if let Err(err) = self.broker.unsubscribe_market_data(req_id).await {
                debug!("price: unsubscribe {} failed: {}", req_id, err);
            }
        }

        match outcome {
            Ok(Ok(price)) => Ok(price),
            Ok(Err(_)) => Err(BrokerError::Other("price waiter dropped".into())),
            Err(_) => Err(BrokerError::Timeout(self.cfg.timeout)),
        }
    }
}
