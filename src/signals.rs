//! Prediction signal poller.
//!
//! Polls the external prediction API for the configured basket, converts
//! records into [`PredictionSignal`] events and publishes them on the bus.
//! A TTL dedup cache keeps replayed records (API returns a trailing window)
//! from firing rules twice. Transport errors are logged and retried on the
//! next poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::bus::EventBus;
use crate::engine::events::{Event, EventPayload, PredictionSignal, SignalKind};

// ─────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SignalApiConfig {
    /// e.g. https://api.example.com/v1
    pub base_url: String,
    pub api_key: SecretString,
    pub poll_interval: Duration,
    pub tickers: Vec<String>,
}

// ─────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct WireSignal {
    pub ticker: String,
    pub signal: String,
    pub confidence: f64,
    #[serde(rename = "stockPrice")]
    pub stock_price: f64,
    /// Model timestamp, unix seconds.
    pub ts: i64,
}

// ─────────────────────────────────────────────────────────
// Dedup cache (bounded, TTL)
// ─────────────────────────────────────────────────────────

/// Keyed cache that remembers what it has seen for a bounded time, so a
/// record replayed across polls is only acted on once.
#[derive(Debug)]
struct DedupCache {
    seen_at: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen_at: HashMap::with_capacity(max_entries.min(4096)),
            ttl,
            max_entries,
        }
    }

    /// Returns true the first time a key is seen within the TTL.
    fn remember(&mut self, key: String) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.ttl).unwrap_or(now);
        self.seen_at.retain(|_, ts| *ts >= cutoff);

        if self.seen_at.contains_key(&key) {
            return false;
        }
        self.seen_at.insert(key, now);

        while self.seen_at.len() > self.max_entries {
            let oldest = self
                .seen_at
                .iter()
                .min_by_key(|(_, ts)| *ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.seen_at.remove(&key);
                }
                None => break,
            }
        }
        true
    }
}

// ─────────────────────────────────────────────────────────
// Poller
// ─────────────────────────────────────────────────────────

pub struct SignalPoller {
    cfg: SignalApiConfig,
    bus: Arc<EventBus>,
    client: reqwest::Client,
}

impl SignalPoller {
    pub fn new(cfg: SignalApiConfig, bus: Arc<EventBus>) -> Self {
        Self {
            cfg,
            bus,
            client: reqwest::Client::new(),
        }
    }

    /// Long-running poll loop. Abort the handle to stop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "signal poller started | {} every {:?} for {} tickers",
                self.cfg.base_url,
                self.cfg.poll_interval,
                self.cfg.tickers.len(),
            );
            // 15 min TTL comfortably covers the API's replay window.
            let mut dedup = DedupCache::new(Duration::from_secs(15 * 60), 50_000);
            let mut ticker = tokio::time::interval(self.cfg.poll_interval);
            loop {
                ticker.tick().await;
                match self.fetch().await {
                    Ok(records) => {
                        let emitted = self.publish(records, &mut dedup).await;
                        if emitted > 0 {
                            debug!("signal poller: {} new signal(s)", emitted);
                        }
                    }
                    Err(err) => {
                        warn!("signal poll failed: {:#}", err);
                    }
                }
            }
        })
    }

    async fn fetch(&self) -> anyhow::Result<Vec<WireSignal>> {
        use anyhow::Context;

        let url = format!(
            "{}/signals?tickers={}",
            self.cfg.base_url,
            self.cfg.tickers.join(","),
        );
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", self.cfg.api_key.expose_secret())
            .send()
            .await
            .context("signal API request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("signal API returned status {}", resp.status());
        }
        resp.json().await.context("signal API response not parseable")
    }

    /// Convert, dedup and emit. Returns how many events went out.
    async fn publish(&self, records: Vec<WireSignal>, dedup: &mut DedupCache) -> usize {
        let mut emitted = 0;
        for record in records {
            let Some(signal) = convert(&record) else {
                warn!(
                    "signal: dropping malformed record for {} ({} conf {:.2})",
                    record.ticker, record.signal, record.confidence
                );
                continue;
            };
            if !self.cfg.tickers.iter().any(|t| *t == signal.symbol) {
                debug!("signal: {} not in basket, skipping", signal.symbol);
                continue;
            }
            let key = format!("{}:{}:{}", signal.symbol, record.signal, record.ts);
            if !dedup.remember(key) {
                continue;
            }

            info!(
                "signal: {} {:?} conf={:.2} ref={:.2}",
                signal.symbol, signal.signal, signal.confidence, signal.reference_price,
            );
            self.bus
                .emit(Event::new("signals", EventPayload::Signal(signal)))
                .await;
            emitted += 1;
        }
        emitted
    }
}

/// Wire record → internal signal. Returns `None` for unknown signal kinds,
/// out-of-range confidence or an unusable timestamp.
fn convert(record: &WireSignal) -> Option<PredictionSignal> {
    let kind = SignalKind::parse(&record.signal)?;
    if !(0.0..=1.0).contains(&record.confidence) {
        return None;
    }
    let model_ts: DateTime<Utc> = DateTime::from_timestamp(record.ts, 0)?;
    Some(PredictionSignal {
        symbol: record.ticker.clone(),
        signal: kind,
        confidence: record.confidence,
        reference_price: record.stock_price,
        model_ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::EventKind;
    use std::sync::Mutex;

    fn record(ticker: &str, signal: &str, confidence: f64, ts: i64) -> WireSignal {
        WireSignal {
            ticker: ticker.into(),
            signal: signal.into(),
            confidence,
            stock_price: 100.0,
            ts,
        }
    }

    fn poller(tickers: &[&str]) -> (Arc<EventBus>, SignalPoller) {
        let bus = Arc::new(EventBus::new());
        let cfg = SignalApiConfig {
            base_url: "https://signals.example".into(),
            api_key: SecretString::from("test-key".to_string()),
            poll_interval: Duration::from_secs(5),
            tickers: tickers.iter().map(|s| s.to_string()).collect(),
        };
        (bus.clone(), SignalPoller::new(cfg, bus))
    }

    #[test]
    fn test_convert_parses_wire_record() {
        let s = convert(&record("AAPL", "SHORT", 0.85, 1_700_000_000)).unwrap();
        assert_eq!(s.symbol, "AAPL");
        assert_eq!(s.signal, SignalKind::Short);
        assert!((s.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_convert_rejects_garbage() {
        assert!(convert(&record("AAPL", "HOLD", 0.9, 0)).is_none());
        assert!(convert(&record("AAPL", "BUY", 1.3, 0)).is_none());
        assert!(convert(&record("AAPL", "BUY", -0.1, 0)).is_none());
    }

    #[test]
    fn test_wire_format_field_names() {
        let json = r#"{"ticker":"TQQQ","signal":"BUY","confidence":0.91,"stockPrice":62.4,"ts":1700000000}"#;
        let w: WireSignal = serde_json::from_str(json).unwrap();
        assert_eq!(w.ticker, "TQQQ");
        assert!((w.stock_price - 62.4).abs() < 1e-9);
    }

    #[test]
    fn test_dedup_cache_ttl_and_bound() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 2);
        assert!(cache.remember("a".into()));
        assert!(!cache.remember("a".into()));
        assert!(cache.remember("b".into()));
        // Capacity 2: inserting a third evicts the oldest.
        assert!(cache.remember("c".into()));
        assert!(cache.seen_at.len() <= 2);
    }

    #[tokio::test]
    async fn test_publish_dedups_and_filters_basket() {
        let (bus, poller) = poller(&["AAPL", "TQQQ"]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            EventKind::Signal,
            "test",
            crate::engine::bus::handler(move |evt| {
                let sink = sink.clone();
                async move {
                    if let EventPayload::Signal(s) = evt.payload {
                        sink.lock().unwrap().push(s.symbol);
                    }
                    Ok(())
                }
            }),
        );

        let mut dedup = DedupCache::new(Duration::from_secs(60), 128);
        let batch = vec![
            record("AAPL", "BUY", 0.9, 1_700_000_000),
            record("MSFT", "BUY", 0.9, 1_700_000_000), // not in basket
            record("AAPL", "BUY", 0.9, 1_700_000_000), // duplicate in batch
        ];
        assert_eq!(poller.publish(batch, &mut dedup).await, 1);

        // Replay in the next poll window: nothing new.
        let replay = vec![record("AAPL", "BUY", 0.9, 1_700_000_000)];
        assert_eq!(poller.publish(replay, &mut dedup).await, 0);

        // A fresh model timestamp is a new signal.
        let fresh = vec![record("AAPL", "BUY", 0.9, 1_700_000_060)];
        assert_eq!(poller.publish(fresh, &mut dedup).await, 1);

        assert_eq!(*seen.lock().unwrap(), vec!["AAPL", "AAPL"]);
    }
}
