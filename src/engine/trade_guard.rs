//! Trade tracker — the race-free duplicate-entry guard.
//!
//! Rule context is copied per evaluation, so the entry actions need one
//! process-wide place to ask "is there already a trade on this symbol".
//! The position tracker carries the same information but is reserved for
//! position state; this map exists solely for the duplicate/reversal check.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

use super::order::OrderSide;

#[derive(Debug, Clone, Copy)]
pub struct ActiveTrade {
    pub side: OrderSide,
    pub started_at: Instant,
}

#[derive(Default)]
pub struct TradeTracker {
    inner: Mutex<HashMap<String, ActiveTrade>>,
}

impl TradeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, symbol: &str) -> Option<ActiveTrade> {
        self.inner
            .lock()
            .expect("trade tracker lock poisoned")
            .get(symbol)
            .copied()
    }

    /// Claim the symbol. Returns false (and leaves the existing record)
    /// when a trade is already active.
    pub fn start(&self, symbol: &str, side: OrderSide) -> bool {
        let mut inner = self.inner.lock().expect("trade tracker lock poisoned");
        if inner.contains_key(symbol) {
            return false;
        }
        debug!("trade guard: {} {} started", symbol, side.as_str());
        inner.insert(
            symbol.to_string(),
            ActiveTrade {
                side,
                started_at: Instant::now(),
            },
        );
        true
    }

    /// Release the symbol (called when its position closes).
    pub fn clear(&self, symbol: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .expect("trade tracker lock poisoned")
            .remove(symbol)
            .is_some();
        if removed {
            debug!("trade guard: {} cleared", symbol);
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("trade tracker lock poisoned").len()
    }
}
