//! Position tracker — the single source of truth for per-symbol positions.
//!
//! One mutex over the position map and symbol index; bus events are emitted
//! after the lock is released. At most one active (non-closed) position per
//! symbol. Entry prices blend by VWAP as fills accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::bus::EventBus;
use super::events::{Event, EventPayload, PositionClosed, PositionOpened, PositionUpdated};
use super::order::OrderSide;
use super::order_manager::OrderManager;
use super::position::{OrderRole, Position, PositionStatus};
use super::trade_guard::TradeTracker;

struct Inner {
    by_id: HashMap<Uuid, Position>,
    by_symbol: HashMap<String, Uuid>,
}

pub struct PositionTracker {
    bus: Arc<EventBus>,
    orders: Arc<OrderManager>,
    trades: Arc<TradeTracker>,
    inner: Mutex<Inner>,
}

impl PositionTracker {
    pub fn new(bus: Arc<EventBus>, orders: Arc<OrderManager>, trades: Arc<TradeTracker>) -> Self {
        Self {
            bus,
            orders,
            trades,
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                by_symbol: HashMap::new(),
            }),
        }
    }

    // ─────────────────────────────────────────────────
    // Creation & lookup
    // ─────────────────────────────────────────────────

    /// Register a planned position for `symbol`. Fails while another active
    /// position occupies the symbol's slot.
    pub fn plan(
        &self,
        symbol: &str,
        side: OrderSide,
        target_qty: u32,
        atr_stop_multiplier: f64,
        atr_target_multiplier: f64,
    ) -> anyhow::Result<Position> {
        let mut inner = self.inner.lock().expect("position lock poisoned");
        if let Some(existing) = inner.by_symbol.get(symbol) {
            anyhow::bail!("active position {} already exists for {}", existing, symbol);
        }
        let pos = Position::new(
            symbol,
            side,
            target_qty,
            atr_stop_multiplier,
            atr_target_multiplier,
        );
        inner.by_symbol.insert(symbol.to_string(), pos.position_id);
        inner.by_id.insert(pos.position_id, pos.clone());
        Ok(pos)
    }

    /// Active position for a symbol, if any.
    pub fn get_by_symbol(&self, symbol: &str) -> Option<Position> {
        let inner = self.inner.lock().expect("position lock poisoned");
        inner
            .by_symbol
            .get(symbol)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Any position by id, including closed ones.
    pub fn get_by_id(&self, position_id: Uuid) -> Option<Position> {
        self.inner
            .lock()
            .expect("position lock poisoned")
            .by_id
            .get(&position_id)
            .cloned()
    }

    /// Snapshot of all active positions.
    pub fn summary(&self) -> Vec<Position> {
        let inner = self.inner.lock().expect("position lock poisoned");
        inner
            .by_symbol
            .values()
            .filter_map(|id| inner.by_id.get(id))
            .cloned()
            .collect()
    }

    // ─────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────

    pub fn set_status(&self, position_id: Uuid, status: PositionStatus) {
        let mut inner = self.inner.lock().expect("position lock poisoned");
        if let Some(pos) = inner.by_id.get_mut(&position_id) {
            if pos.status != PositionStatus::Closed {
                pos.status = status;
            }
        }
    }

    pub fn attach_order(&self, position_id: Uuid, role: OrderRole, order_id: i64) {
        let mut inner = self.inner.lock().expect("position lock poisoned");
        if let Some(pos) = inner.by_id.get_mut(&position_id) {
            pos.attach(role, order_id);
        } else {
            warn!("attach_order: unknown position {}", position_id);
        }
    }

    pub fn detach_order(&self, position_id: Uuid, order_id: i64) {
        let mut inner = self.inner.lock().expect("position lock poisoned");
        if let Some(pos) = inner.by_id.get_mut(&position_id) {
            pos.detach(order_id);
        }
    }

    /// Merge an opening-direction fill (main / scale / double-down) into the
    /// symbol's position, creating one when none exists. First fill moves the
    /// position to `Open` and emits [`PositionOpened`]; later fills blend the
    /// entry price by VWAP and emit [`PositionUpdated`].
    pub async fn open_or_update(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: u32,
        fill_price: f64,
        order_id: i64,
    ) {
        let event = {
            let mut inner = self.inner.lock().expect("position lock poisoned");
            let pos_id = inner.by_symbol.get(symbol).copied();
            let pos = match pos_id {
                Some(id) => inner.by_id.get_mut(&id).expect("index out of sync"),
                None => {
                    let mut pos = Position::new(symbol, side, qty, 0.0, 0.0);
                    pos.status = PositionStatus::Opening;
                    pos.attach(OrderRole::Main, order_id);
                    let id = pos.position_id;
                    inner.by_symbol.insert(symbol.to_string(), id);
                    inner.by_id.insert(id, pos);
                    inner.by_id.get_mut(&id).expect("just inserted")
                }
            };

            if pos.side != side {
                warn!(
                    "open_or_update: {} fill side {} against {} position, ignoring",
                    symbol,
                    side.as_str(),
                    pos.side.as_str()
                );
                return;
            }

            let first_fill = pos.current_qty == 0;
            if first_fill {
                pos.entry_price = fill_price;
                pos.current_qty = qty;
            } else {
                let old_q = pos.current_qty as f64;
                pos.current_qty += qty;
                pos.entry_price = (old_q * pos.entry_price + qty as f64 * fill_price)
                    / pos.current_qty as f64;
            }
            pos.status = PositionStatus::Open;
            pos.unrealized_pnl =
                pos.side.sign() as f64 * (fill_price - pos.entry_price) * pos.current_qty as f64;

            if first_fill {
                info!(
                    "position open: {} {} {}@{:.2}",
                    symbol,
                    pos.side.as_str(),
                    pos.current_qty,
                    pos.entry_price
                );
                Event::new(
                    "positions",
                    EventPayload::PositionOpened(PositionOpened {
                        position_id: pos.position_id,
                        symbol: symbol.to_string(),
                        side: pos.side,
                        qty: pos.current_qty,
                        entry_price: pos.entry_price,
                    }),
                )
            } else {
                info!(
                    "position update: {} {} → {}@{:.2}",
                    symbol,
                    pos.side.as_str(),
                    pos.current_qty,
                    pos.entry_price
                );
                Event::new(
                    "positions",
                    EventPayload::PositionUpdated(PositionUpdated {
                        position_id: pos.position_id,
                        symbol: symbol.to_string(),
                        side: pos.side,
                        qty: pos.current_qty,
                        entry_price: pos.entry_price,
                    }),
                )
            }
        };

        self.bus.emit(event).await;
    }

    /// Apply a position-reducing fill from a protective (or manual close)
    /// order. Realized PnL accrues against the blended entry price. When the
    /// quantity reaches zero the position is marked `Closing`; the fill
    /// manager drives the actual close.
    pub async fn record_protective_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: u32,
        fill_price: f64,
    ) {
        let event = {
            let mut inner = self.inner.lock().expect("position lock poisoned");
            let Some(&pos_id) = inner.by_symbol.get(symbol) else {
                warn!("protective fill for {} with no active position", symbol);
                return;
            };
            let pos = inner.by_id.get_mut(&pos_id).expect("index out of sync");

            if side != pos.side.opposite() {
                warn!(
                    "protective fill side {} does not oppose {} position on {}",
                    side.as_str(),
                    pos.side.as_str(),
                    symbol
                );
                return;
            }

            let qty = qty.min(pos.current_qty);
            pos.current_qty -= qty;
            pos.realized_pnl +=
                pos.side.sign() as f64 * (fill_price - pos.entry_price) * qty as f64;
            pos.unrealized_pnl =
                pos.side.sign() as f64 * (fill_price - pos.entry_price) * pos.current_qty as f64;
            if pos.current_qty == 0 {
                pos.status = PositionStatus::Closing;
            }

            info!(
                "position reduce: {} −{} → {} (realized {:.2})",
                symbol, qty, pos.current_qty, pos.realized_pnl
            );

            Event::new(
                "positions",
                EventPayload::PositionUpdated(PositionUpdated {
                    position_id: pos.position_id,
                    symbol: symbol.to_string(),
                    side: pos.side,
                    qty: pos.current_qty,
                    entry_price: pos.entry_price,
                }),
            )
        };

        self.bus.emit(event).await;
    }

    /// Record that a close is in flight and why. The reason is consumed by
    /// the fill manager when the closing fill completes.
    pub fn mark_closing(&self, position_id: Uuid, reason: &str) {
        let mut inner = self.inner.lock().expect("position lock poisoned");
        if let Some(pos) = inner.by_id.get_mut(&position_id) {
            if pos.status != PositionStatus::Closed {
                pos.status = PositionStatus::Closing;
                pos.reason = Some(reason.to_string());
            }
        }
    }

    /// Update risk multipliers on an open position.
    pub fn update_risk(
        &self,
        position_id: Uuid,
        atr_stop_multiplier: Option<f64>,
        atr_target_multiplier: Option<f64>,
    ) {
        let mut inner = self.inner.lock().expect("position lock poisoned");
        if let Some(pos) = inner.by_id.get_mut(&position_id) {
            if let Some(stop) = atr_stop_multiplier {
                pos.atr_stop_multiplier = stop;
            }
            if let Some(target) = atr_target_multiplier {
                pos.atr_target_multiplier = target;
            }
            if pos.status == PositionStatus::Open {
                pos.status = PositionStatus::Adjusting;
            }
        }
    }

    /// Force the tracker's quantity to the authoritative value recomputed
    /// from order fill totals. Returns whether a correction was applied.
    pub fn reconcile(&self, position_id: Uuid, authoritative_net: i64) -> bool {
        let mut inner = self.inner.lock().expect("position lock poisoned");
        let Some(pos) = inner.by_id.get_mut(&position_id) else {
            return false;
        };
        let expected = authoritative_net.unsigned_abs() as u32;
        if pos.current_qty != expected {
            warn!(
                "reconcile: {} tracker qty {} != fills {} — correcting",
                pos.symbol, pos.current_qty, expected
            );
            pos.current_qty = expected;
            return true;
        }
        false
    }

    /// Close the position: cancel every still-working linked order, emit
    /// [`PositionClosed`], release the symbol slot and the trade guard.
    /// Idempotent on already-closed positions.
    pub async fn close(&self, position_id: Uuid, reason: &str) {
        let closed = {
            let mut inner = self.inner.lock().expect("position lock poisoned");
            let Some(pos) = inner.by_id.get_mut(&position_id) else {
                warn!("close: unknown position {}", position_id);
                return;
            };
            if pos.status == PositionStatus::Closed {
                return;
            }
            pos.status = PositionStatus::Closed;
            pos.closed_at = Some(Utc::now());
            pos.reason = Some(reason.to_string());
            let snapshot = pos.clone();
            if inner.by_symbol.get(&snapshot.symbol) == Some(&position_id) {
                inner.by_symbol.remove(&snapshot.symbol);
            }
            snapshot
        };

        for order_id in closed.all_order_ids() {
            if let Some(order) = self.orders.get_order(order_id) {
                if order.status.is_working() {
                    if let Err(err) = self.orders.cancel(order_id, "position closed").await {
                        warn!("close: cancel of {} failed: {}", order_id, err);
                    }
                }
            }
        }

        self.trades.clear(&closed.symbol);

        info!(
            "position closed: {} ({}) realized {:.2}",
            closed.symbol, reason, closed.realized_pnl
        );
        self.bus
            .emit(Event::new(
                "positions",
                EventPayload::PositionClosed(PositionClosed {
                    position_id,
                    symbol: closed.symbol.clone(),
                    reason: reason.to_string(),
                    realized_pnl: closed.realized_pnl,
                }),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::sim::SimBroker;
    use crate::engine::events::EventKind;
    use crate::engine::order::OrderSpec;

    fn setup() -> (
        Arc<EventBus>,
        Arc<SimBroker>,
        Arc<OrderManager>,
        Arc<TradeTracker>,
        PositionTracker,
    ) {
        let bus = Arc::new(EventBus::new());
        let (sim, _rx) = SimBroker::new();
        let orders = Arc::new(OrderManager::new(bus.clone(), sim.clone(), None));
        let trades = Arc::new(TradeTracker::new());
        let tracker = PositionTracker::new(bus.clone(), orders.clone(), trades.clone());
        (bus, sim, orders, trades, tracker)
    }

    #[tokio::test]
    async fn test_one_active_position_per_symbol() {
        let (_bus, _sim, _orders, _trades, tracker) = setup();
        tracker.plan("AAPL", OrderSide::Buy, 100, 6.0, 3.0).unwrap();
        assert!(tracker.plan("AAPL", OrderSide::Sell, 50, 6.0, 3.0).is_err());
        assert!(tracker.plan("TQQQ", OrderSide::Buy, 50, 6.0, 3.0).is_ok());
    }

    #[tokio::test]
    async fn test_open_then_vwap_merge() {
        let (_bus, _sim, _orders, _trades, tracker) = setup();
        let pos = tracker.plan("AAPL", OrderSide::Buy, 200, 6.0, 3.0).unwrap();

        tracker.open_or_update("AAPL", OrderSide::Buy, 100, 150.0, 1).await;
        let p = tracker.get_by_id(pos.position_id).unwrap();
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.current_qty, 100);
        assert!((p.entry_price - 150.0).abs() < 1e-9);

        tracker.open_or_update("AAPL", OrderSide::Buy, 100, 152.0, 2).await;
        let p = tracker.get_by_id(pos.position_id).unwrap();
        assert_eq!(p.current_qty, 200);
        // VWAP: (100*150 + 100*152) / 200 = 151
        assert!((p.entry_price - 151.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_open_or_update_creates_when_absent() {
        let (_bus, _sim, _orders, _trades, tracker) = setup();
        tracker.open_or_update("NVDA", OrderSide::Sell, 30, 500.0, 9).await;
        let p = tracker.get_by_symbol("NVDA").unwrap();
        assert_eq!(p.side, OrderSide::Sell);
        assert_eq!(p.current_qty, 30);
        assert_eq!(p.role_of(9), Some(OrderRole::Main));
    }

    #[tokio::test]
    async fn test_protective_fill_reduces_and_realizes() {
        let (_bus, _sim, _orders, _trades, tracker) = setup();
        tracker.plan("AAPL", OrderSide::Buy, 100, 6.0, 3.0).unwrap();
        tracker.open_or_update("AAPL", OrderSide::Buy, 100, 100.0, 1).await;

        tracker.record_protective_fill("AAPL", OrderSide::Sell, 40, 110.0).await;
        let p = tracker.get_by_symbol("AAPL").unwrap();
        assert_eq!(p.current_qty, 60);
        assert!((p.realized_pnl - 400.0).abs() < 1e-9);

        tracker.record_protective_fill("AAPL", OrderSide::Sell, 60, 110.0).await;
        let p = tracker.get_by_symbol("AAPL").unwrap();
        assert_eq!(p.current_qty, 0);
        assert_eq!(p.status, PositionStatus::Closing);
        assert!((p.realized_pnl - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_cancels_linked_orders_and_clears_guard() {
        let (bus, sim, orders, trades, tracker) = setup();
        sim.set_price("AAPL", 100.0);

        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = closes.clone();
        bus.subscribe(
            EventKind::PositionClose,
            "test",
            crate::engine::bus::handler(move |evt| {
                let sink = sink.clone();
                async move {
                    if let EventPayload::PositionClosed(p) = evt.payload {
                        sink.lock().unwrap().push((p.symbol, p.reason));
                    }
                    Ok(())
                }
            }),
        );

        trades.start("AAPL", OrderSide::Buy);
        let pos = tracker.plan("AAPL", OrderSide::Buy, 100, 6.0, 3.0).unwrap();

        // A resting protective order that must be cancelled on close.
        let stop = orders.create_order(OrderSpec::stop("AAPL", OrderSide::Sell, 100, 95.0));
        orders.submit(stop.order_id).await.unwrap();
        tracker.attach_order(pos.position_id, OrderRole::Stop, stop.order_id);

        tracker.close(pos.position_id, "manual").await;

        assert!(tracker.get_by_symbol("AAPL").is_none());
        assert!(trades.active("AAPL").is_none());
        assert_eq!(
            orders.get_order(stop.order_id).unwrap().status,
            crate::engine::order::OrderStatus::PendingCancel
        );
        assert_eq!(
            *closes.lock().unwrap(),
            vec![("AAPL".to_string(), "manual".to_string())]
        );

        // Idempotent: a second close is a no-op.
        tracker.close(pos.position_id, "again").await;
        assert_eq!(closes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_corrects_drift() {
        let (_bus, _sim, _orders, _trades, tracker) = setup();
        let pos = tracker.plan("AAPL", OrderSide::Buy, 100, 6.0, 3.0).unwrap();
        tracker.open_or_update("AAPL", OrderSide::Buy, 100, 100.0, 1).await;

        assert!(tracker.reconcile(pos.position_id, 80));
        assert_eq!(tracker.get_by_symbol("AAPL").unwrap().current_qty, 80);
        assert!(!tracker.reconcile(pos.position_id, 80));
    }
}
