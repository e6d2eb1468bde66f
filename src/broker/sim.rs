//! Simulated broker — backs dry-run mode and the test suite.
//!
//! Market orders fill immediately at the last known price; limit and stop
//! orders rest and trigger on price updates. Fill, status and error traffic
//! is pushed through the same [`BrokerPush`] stream a live adapter would use,
//! so everything downstream of the reader task behaves identically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::events::PriceTick;
use crate::engine::order::{OrderSide, OrderType};
use crate::errors::BrokerError;

use super::{Bar, BrokerClient, BrokerPush, OrderTicket};

// ─────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RestingOrder {
    ticket: OrderTicket,
    filled: u32,
}

struct SimInner {
    next_order_id: i64,
    next_req_id: i64,
    prices: HashMap<String, f64>,
    bars: HashMap<String, Vec<Bar>>,
    resting: HashMap<i64, RestingOrder>,
    subscriptions: HashMap<i64, String>,
    fail_submits: u32,
    fail_cancels: u32,
    exec_seq: u64,
    submitted: Vec<OrderTicket>,
}

pub struct SimBroker {
    push_tx: mpsc::UnboundedSender<BrokerPush>,
    inner: Mutex<SimInner>,
}

impl SimBroker {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerPush>) {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let sim = Arc::new(Self {
            push_tx,
            inner: Mutex::new(SimInner {
                next_order_id: 10_000,
                next_req_id: 1,
                prices: HashMap::new(),
                bars: HashMap::new(),
                resting: HashMap::new(),
                subscriptions: HashMap::new(),
                fail_submits: 0,
                fail_cancels: 0,
                exec_seq: 0,
                submitted: Vec::new(),
            }),
        });
        (sim, push_rx)
    }

    // ─────────────────────────────────────────────────
    // Test / wiring hooks
    // ─────────────────────────────────────────────────

    /// Update the last price, publish a tick, and trigger resting orders.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let triggered = {
            let mut inner = self.inner.lock().expect("sim lock poisoned");
            inner.prices.insert(symbol.to_string(), price);

            let subscribed = inner.subscriptions.values().any(|s| s == symbol);
            if subscribed {
                let _ = self.push_tx.send(BrokerPush::Tick(PriceTick {
                    symbol: symbol.to_string(),
                    price,
                    bid: price - 0.01,
                    ask: price + 0.01,
                    volume: 1_000,
                }));
            }

            let ids: Vec<i64> = inner
                .resting
                .iter()
                .filter(|(_, r)| r.ticket.symbol == symbol && triggers(&r.ticket, price))
                .map(|(id, _)| *id)
                .collect();
            ids
        };

        for id in triggered {
            self.fill_remaining(id, price);
        }
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.inner
            .lock()
            .expect("sim lock poisoned")
            .bars
            .insert(symbol.to_string(), bars);
    }

    /// Fail the next `n` submit calls with a transient error.
    pub fn fail_next_submits(&self, n: u32) {
        self.inner.lock().expect("sim lock poisoned").fail_submits = n;
    }

    /// Fail the next `n` cancel calls with a transient error.
    pub fn fail_next_cancels(&self, n: u32) {
        self.inner.lock().expect("sim lock poisoned").fail_cancels = n;
    }

    /// Partially fill a resting order (test hook for protective partials).
    pub fn fill_partial(&self, order_id: i64, shares: u32, price: f64) {
        let push = {
            let mut inner = self.inner.lock().expect("sim lock poisoned");
            let Some(resting) = inner.resting.get_mut(&order_id) else {
                warn!("sim: fill_partial on unknown order {}", order_id);
                return;
            };
            let shares = shares.min(resting.ticket.qty - resting.filled);
            resting.filled += shares;
            let cum = resting.filled;
            let qty = resting.ticket.qty;
            let done = cum == qty;
            if done {
                inner.resting.remove(&order_id);
            }
            inner.exec_seq += 1;
            let exec_id = format!("sim-{}", inner.exec_seq);
            (exec_id, shares, cum, qty, done)
        };

        let (exec_id, shares, cum, qty, done) = push;
        let _ = self.push_tx.send(BrokerPush::Execution {
            order_id,
            exec_id,
            shares,
            price,
            cum_qty: cum,
            commission: Some(commission_for(shares)),
        });
        let status = if done { "Filled" } else { "PartiallyFilled" };
        let _ = self.push_tx.send(BrokerPush::Status {
            order_id,
            status: status.into(),
            filled: cum,
            remaining: qty - cum,
            avg_fill_price: price,
        });
    }

    /// Fully fill whatever remains of a resting order at `price`.
    pub fn fill_remaining(&self, order_id: i64, price: f64) {
        let remaining = {
            let inner = self.inner.lock().expect("sim lock poisoned");
            inner
                .resting
                .get(&order_id)
                .map(|r| r.ticket.qty - r.filled)
        };
        if let Some(remaining) = remaining {
            if remaining > 0 {
                self.fill_partial(order_id, remaining, price);
            }
        }
    }

    pub fn push_connected(&self) {
        let _ = self.push_tx.send(BrokerPush::Connected);
    }

    pub fn push_disconnected(&self) {
        let _ = self.push_tx.send(BrokerPush::Disconnected);
    }

    pub fn push_error(&self, code: i32, msg: &str) {
        let _ = self.push_tx.send(BrokerPush::Error {
            code,
            msg: msg.to_string(),
        });
    }

    pub fn submitted_tickets(&self) -> Vec<OrderTicket> {
        self.inner.lock().expect("sim lock poisoned").submitted.clone()
    }

    pub fn resting_order_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .inner
            .lock()
            .expect("sim lock poisoned")
            .resting
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn commission_for(shares: u32) -> f64 {
    (0.005 * shares as f64).max(1.0)
}

/// Whether a resting order triggers at `price`.
fn triggers(ticket: &OrderTicket, price: f64) -> bool {
    match (ticket.order_type, ticket.side) {
        (OrderType::Market, _) => true,
        (OrderType::Limit, OrderSide::Buy) => {
            ticket.limit_price.map(|l| price <= l).unwrap_or(false)
        }
        (OrderType::Limit, OrderSide::Sell) => {
            ticket.limit_price.map(|l| price >= l).unwrap_or(false)
        }
        (OrderType::Stop | OrderType::StopLimit, OrderSide::Buy) => {
            ticket.stop_price.map(|s| price >= s).unwrap_or(false)
        }
        (OrderType::Stop | OrderType::StopLimit, OrderSide::Sell) => {
            ticket.stop_price.map(|s| price <= s).unwrap_or(false)
        }
        (OrderType::Trail, _) => false,
    }
}

// ─────────────────────────────────────────────────────────
// BrokerClient
// ─────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl BrokerClient for SimBroker {
    async fn submit_order(&self, ticket: OrderTicket) -> Result<i64, BrokerError> {
        let (order_id, qty, fill_now) = {
            let mut inner = self.inner.lock().expect("sim lock poisoned");
            if inner.fail_submits > 0 {
                inner.fail_submits -= 1;
                return Err(BrokerError::Transient {
                    code: 1100,
                    message: "connectivity between IB and TWS has been lost".into(),
                });
            }

            let order_id = if ticket.order_id > 0 {
                if inner.resting.contains_key(&ticket.order_id) {
                    return Err(BrokerError::Duplicate(format!(
                        "order id {} already in use",
                        ticket.order_id
                    )));
                }
                ticket.order_id
            } else {
                inner.next_order_id += 1;
                inner.next_order_id
            };

            let mut ticket = ticket;
            ticket.order_id = order_id;
            inner.submitted.push(ticket.clone());

            let price = inner.prices.get(&ticket.symbol).copied();
            let fill_now = price.filter(|p| triggers(&ticket, *p));
            let qty = ticket.qty;
            inner.resting.insert(
                order_id,
                RestingOrder { ticket, filled: 0 },
            );
            (order_id, qty, fill_now)
        };

        let _ = self.push_tx.send(BrokerPush::Status {
            order_id,
            status: "Submitted".into(),
            filled: 0,
            remaining: qty,
            avg_fill_price: 0.0,
        });

        if let Some(price) = fill_now {
            self.fill_remaining(order_id, price);
        } else {
            debug!("sim: order {} resting", order_id);
        }

        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: i64) -> Result<(), BrokerError> {
        let removed = {
            let mut inner = self.inner.lock().expect("sim lock poisoned");
            if inner.fail_cancels > 0 {
                inner.fail_cancels -= 1;
                return Err(BrokerError::Transient {
                    code: 1100,
                    message: "connectivity between IB and TWS has been lost".into(),
                });
            }
            inner.resting.remove(&order_id)
        };

        match removed {
            Some(r) => {
                let _ = self.push_tx.send(BrokerPush::Status {
                    order_id,
                    status: "ApiCancelled".into(),
                    filled: r.filled,
                    remaining: r.ticket.qty - r.filled,
                    avg_fill_price: 0.0,
                });
            }
            None => {
                // Idempotent: the order is already done or unknown.
                let _ = self.push_tx.send(BrokerPush::Error {
                    code: 10147,
                    msg: format!("order {} to cancel is not found", order_id),
                });
            }
        }
        Ok(())
    }

    async fn subscribe_market_data(&self, symbol: &str) -> Result<i64, BrokerError> {
        let (req_id, tick) = {
            let mut inner = self.inner.lock().expect("sim lock poisoned");
            if inner.subscriptions.values().any(|s| s == symbol) {
                return Err(BrokerError::Duplicate(format!(
                    "duplicate market data subscription for {symbol}"
                )));
            }
            let req_id = inner.next_req_id;
            inner.next_req_id += 1;
            inner.subscriptions.insert(req_id, symbol.to_string());
            (req_id, inner.prices.get(symbol).copied())
        };

        // Snapshot behavior: push the last known price right away.
        if let Some(price) = tick {
            let _ = self.push_tx.send(BrokerPush::Tick(PriceTick {
                symbol: symbol.to_string(),
                price,
                bid: price - 0.01,
                ask: price + 0.01,
                volume: 1_000,
            }));
        }
        Ok(req_id)
    }

    async fn unsubscribe_market_data(&self, req_id: i64) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .expect("sim lock poisoned")
            .subscriptions
            .remove(&req_id);
        Ok(())
    }

    async fn request_historical_bars(
        &self,
        symbol: &str,
        duration_secs: u64,
        bar_secs: u64,
    ) -> Result<Vec<Bar>, BrokerError> {
        let inner = self.inner.lock().expect("sim lock poisoned");
        let bars = inner.bars.get(symbol).cloned().unwrap_or_default();
        let max_bars = (duration_secs / bar_secs.max(1)) as usize;
        let start = bars.len().saturating_sub(max_bars.max(1));
        Ok(bars[start..].to_vec())
    }
}
