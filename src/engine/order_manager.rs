//! Order manager — sole owner of order records, sole mutator of order status.
//!
//! All mutations happen under a single mutex over the order map; bus events
//! are emitted only after the lock is released. Broker callbacks arrive via
//! the reader task (`broker::spawn_reader`) and are the only source of fills.
//!
//! Group policies enforced here:
//!   Bracket — entry terminal without a single fill → cancel stop and target.
//!   OCO     — any member filled → cancel every other member.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::broker::{map_broker_status, BrokerClient, OrderTicket};
use crate::errors::BrokerError;

use super::bus::EventBus;
use super::events::{
    Event, EventPayload, Fill, OrderCancelled, OrderRejected, OrderStatusUpdate,
};
use super::order::{FillOutcome, Order, OrderSpec, OrderStatus};

// ─────────────────────────────────────────────────────────
// Groups
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum OrderGroup {
    Bracket {
        entry: i64,
        stop: i64,
        target: Option<i64>,
    },
    Oco {
        members: Vec<i64>,
    },
}

impl OrderGroup {
    fn contains(&self, order_id: i64) -> bool {
        match self {
            OrderGroup::Bracket { entry, stop, target } => {
                *entry == order_id || *stop == order_id || *target == Some(order_id)
            }
            OrderGroup::Oco { members } => members.contains(&order_id),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

struct Inner {
    orders: HashMap<i64, Order>,
    groups: Vec<OrderGroup>,
    /// exec_id → order_id, for late commission reports.
    executions: HashMap<String, i64>,
    next_id: i64,
}

pub struct OrderManager {
    bus: Arc<EventBus>,
    broker: Arc<dyn BrokerClient>,
    account: Option<String>,
    inner: Mutex<Inner>,
}

impl OrderManager {
    pub fn new(bus: Arc<EventBus>, broker: Arc<dyn BrokerClient>, account: Option<String>) -> Self {
        Self {
            bus,
            broker,
            account,
            inner: Mutex::new(Inner {
                orders: HashMap::new(),
                groups: Vec::new(),
                executions: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    // ─────────────────────────────────────────────────
    // Creation & lookup
    // ─────────────────────────────────────────────────

    /// Allocate an id and register the order in `Created`.
    pub fn create_order(&self, spec: OrderSpec) -> Order {
        let mut inner = self.inner.lock().expect("order map lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        let order = Order::new(id, spec);
        inner.orders.insert(id, order.clone());
        order
    }

    pub fn get_order(&self, order_id: i64) -> Option<Order> {
        self.inner
            .lock()
            .expect("order map lock poisoned")
            .orders
            .get(&order_id)
            .cloned()
    }

    pub fn orders_for_symbol(&self, symbol: &str) -> Vec<Order> {
        self.inner
            .lock()
            .expect("order map lock poisoned")
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Orders for `symbol` that are (or may be) live at the broker.
    pub fn working_orders_for_symbol(&self, symbol: &str) -> Vec<Order> {
        self.orders_for_symbol(symbol)
            .into_iter()
            .filter(|o| o.status.is_working())
            .collect()
    }

    pub fn register_bracket(&self, entry: i64, stop: i64, target: Option<i64>) {
        let mut inner = self.inner.lock().expect("order map lock poisoned");
        inner.groups.push(OrderGroup::Bracket { entry, stop, target });
    }

    pub fn register_oco(&self, members: Vec<i64>) {
        let mut inner = self.inner.lock().expect("order map lock poisoned");
        inner.groups.push(OrderGroup::Oco { members });
    }

    // ─────────────────────────────────────────────────
    // Submit / cancel
    // ─────────────────────────────────────────────────

    /// Hand the order to the broker. A synchronous broker error marks the
    /// order `Rejected` and emits the reject before returning the error.
    pub async fn submit(&self, order_id: i64) -> Result<(), BrokerError> {
        let ticket = {
            let mut inner = self.inner.lock().expect("order map lock poisoned");
            let order = match inner.orders.get_mut(&order_id) {
                Some(o) => o,
                None => {
                    warn!("submit: unknown order {}", order_id);
                    return Err(BrokerError::Other(format!("unknown order {order_id}")));
                }
            };
            if order.status != OrderStatus::Created {
                warn!("submit: order {} already {:?}", order_id, order.status);
                return Err(BrokerError::Other(format!(
                    "order {order_id} not submittable"
                )));
            }
            order.status = OrderStatus::PendingSubmit;
            order.updated_at = Utc::now();
            OrderTicket::from_order(order, self.account.clone())
        };

        self.emit_status(order_id).await;

        match self.broker.submit_order(ticket).await {
            Ok(assigned) => {
                if assigned != order_id {
                    self.rekey(order_id, assigned);
                }
                Ok(())
            }
            Err(err) => {
                let symbol = {
                    let mut inner = self.inner.lock().expect("order map lock poisoned");
                    if let Some(order) = inner.orders.get_mut(&order_id) {
                        order.status = OrderStatus::Rejected;
                        order.reject_reason = Some(err.to_string());
                        order.updated_at = Utc::now();
                        order.symbol.clone()
                    } else {
                        String::new()
                    }
                };
                warn!("submit: order {} rejected by broker: {}", order_id, err);
                self.bus
                    .emit(Event::new(
                        "orders",
                        EventPayload::Rejected(OrderRejected {
                            order_id,
                            symbol,
                            reason: err.to_string(),
                        }),
                    ))
                    .await;
                self.emit_status(order_id).await;
                self.apply_group_policies(order_id).await;
                Err(err)
            }
        }
    }

    /// Request a cancel. No-op when the order is already terminal. A cancel
    /// already in flight is re-sent to the broker (broker cancels are
    /// idempotent by order id), which is what retry loops rely on.
    pub async fn cancel(&self, order_id: i64, reason: &str) -> Result<(), BrokerError> {
        let already_pending = {
            let mut inner = self.inner.lock().expect("order map lock poisoned");
            let order = match inner.orders.get_mut(&order_id) {
                Some(o) => o,
                None => return Ok(()),
            };
            if order.is_terminal() {
                debug!(
                    "cancel: order {} already {:?}, skipping ({})",
                    order_id, order.status, reason
                );
                return Ok(());
            }
            let pending = order.status == OrderStatus::PendingCancel;
            order.status = OrderStatus::PendingCancel;
            order.updated_at = Utc::now();
            pending
        };

        debug!("cancel order {} ({})", order_id, reason);
        if !already_pending {
            self.emit_status(order_id).await;
        }

        if let Err(err) = self.broker.cancel_order(order_id).await {
            // Keep PendingCancel: the order may still be live at the broker
            // and a blind local Cancelled would desync us.
            warn!("cancel: broker refused cancel of {}: {}", order_id, err);
            return Err(err);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────
    // Broker callbacks
    // ─────────────────────────────────────────────────

    /// Broker order-status push.
    pub async fn on_status(
        &self,
        order_id: i64,
        raw: &str,
        filled: u32,
        remaining: u32,
        avg_fill_price: f64,
    ) {
        let Some(status) = map_broker_status(raw) else {
            warn!("status: unknown broker status '{}' for order {}", raw, order_id);
            return;
        };

        let mut cancelled_symbol = None;
        let mut changed = false;
        {
            let mut inner = self.inner.lock().expect("order map lock poisoned");
            let order = match inner.orders.get_mut(&order_id) {
                Some(o) => o,
                None => {
                    warn!("status: unknown order {} ({})", order_id, raw);
                    return;
                }
            };

            if order.is_terminal() {
                if order.status != status {
                    warn!(
                        "status: ignoring {:?} for terminal order {} ({:?})",
                        status, order_id, order.status
                    );
                }
                return;
            }

            if status == OrderStatus::Filled && order.remaining > 0 {
                // Executions are the source of truth for fill accounting; a
                // Filled status racing ahead of its executions is ignored.
                warn!(
                    "status: Filled for order {} ahead of executions ({}/{} filled)",
                    order_id, order.cumulative_filled, order.qty
                );
                return;
            }

            if order.status != status {
                debug!(
                    "order {} status {:?} → {:?} (filled={} remaining={})",
                    order_id, order.status, status, filled, remaining
                );
                order.status = status;
                order.updated_at = Utc::now();
                if avg_fill_price > 0.0 {
                    order.avg_fill_price = avg_fill_price;
                }
                changed = true;
                if status == OrderStatus::Cancelled {
                    cancelled_symbol = Some(order.symbol.clone());
                }
            }
        }

        if changed {
            self.emit_status(order_id).await;
            if let Some(symbol) = cancelled_symbol {
                self.bus
                    .emit(Event::new(
                        "orders",
                        EventPayload::Cancelled(OrderCancelled { order_id, symbol }),
                    ))
                    .await;
            }
            self.apply_group_policies(order_id).await;
        }
    }

    /// Broker execution push. Duplicate executions (cumulative quantity not
    /// ahead of our accounting) are logged and dropped.
    pub async fn on_execution(
        &self,
        order_id: i64,
        exec_id: &str,
        shares: u32,
        price: f64,
        cum_qty: u32,
        commission: Option<f64>,
    ) {
        let fill = {
            let mut inner = self.inner.lock().expect("order map lock poisoned");
            let order = match inner.orders.get_mut(&order_id) {
                Some(o) => o,
                None => {
                    warn!("execution: unknown order {} (exec {})", order_id, exec_id);
                    return;
                }
            };

            let (outcome, applied) = order.apply_execution(cum_qty, price);
            if outcome == FillOutcome::Duplicate {
                warn!(
                    "execution: duplicate exec {} for order {} (cum {} ≤ {}), ignoring",
                    exec_id, order_id, cum_qty, order.cumulative_filled
                );
                return;
            }
            if applied != shares {
                debug!(
                    "execution: order {} reported {} shares, applied {} from cum qty",
                    order_id, shares, applied
                );
            }
            if let Some(c) = commission {
                order.commission_paid += c;
            }

            let fill = Fill {
                order_id,
                symbol: order.symbol.clone(),
                side: order.side,
                shares: applied,
                price,
                commission,
                cumulative_filled: order.cumulative_filled,
                remaining: order.remaining,
                ts: Utc::now(),
            };
            inner.executions.insert(exec_id.to_string(), order_id);
            fill
        };

        info!(
            "fill: order {} {} {}@{:.2} ({}/{})",
            order_id,
            fill.side.as_str(),
            fill.shares,
            fill.price,
            fill.cumulative_filled,
            fill.cumulative_filled + fill.remaining,
        );

        let complete = fill.remaining == 0;
        self.bus
            .emit(Event::new("orders", EventPayload::Fill(fill)))
            .await;
        if complete {
            self.emit_status(order_id).await;
            self.apply_group_policies(order_id).await;
        }
    }

    /// Late commission report, joined on exec id. Accumulates onto the order
    /// record; no second fill event is emitted.
    pub fn on_commission(&self, exec_id: &str, commission: f64) {
        let mut inner = self.inner.lock().expect("order map lock poisoned");
        let Some(&order_id) = inner.executions.get(exec_id) else {
            debug!("commission: unknown exec {}", exec_id);
            return;
        };
        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.commission_paid += commission;
            debug!(
                "commission: order {} +{:.2} (total {:.2})",
                order_id, commission, order.commission_paid
            );
        }
    }

    // ─────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────

    async fn emit_status(&self, order_id: i64) {
        let update = {
            let inner = self.inner.lock().expect("order map lock poisoned");
            inner.orders.get(&order_id).map(|o| OrderStatusUpdate {
                order_id,
                status: o.status,
                filled: o.cumulative_filled,
                remaining: o.remaining,
                avg_fill_price: o.avg_fill_price,
                ts: o.updated_at,
            })
        };
        if let Some(update) = update {
            self.bus
                .emit(Event::new("orders", EventPayload::OrderStatus(update)))
                .await;
        }
    }

    /// Re-key an order to the broker-assigned id.
    fn rekey(&self, old_id: i64, new_id: i64) {
        let mut inner = self.inner.lock().expect("order map lock poisoned");
        if let Some(mut order) = inner.orders.remove(&old_id) {
            info!("order {} re-keyed to broker id {}", old_id, new_id);
            order.order_id = new_id;
            inner.orders.insert(new_id, order);
        }
        for group in inner.groups.iter_mut() {
            match group {
                OrderGroup::Bracket { entry, stop, target } => {
                    if *entry == old_id {
                        *entry = new_id;
                    }
                    if *stop == old_id {
                        *stop = new_id;
                    }
                    if *target == Some(old_id) {
                        *target = Some(new_id);
                    }
                }
                OrderGroup::Oco { members } => {
                    for m in members.iter_mut() {
                        if *m == old_id {
                            *m = new_id;
                        }
                    }
                }
            }
        }
    }

    /// After a terminal transition, apply bracket/OCO consequences.
    async fn apply_group_policies(&self, order_id: i64) {
        let to_cancel: Vec<(i64, &'static str)> = {
            let inner = self.inner.lock().expect("order map lock poisoned");
            let order = match inner.orders.get(&order_id) {
                Some(o) if o.is_terminal() => o.clone(),
                _ => return,
            };

            let mut out = Vec::new();
            for group in inner.groups.iter().filter(|g| g.contains(order_id)) {
                match group {
                    OrderGroup::Bracket { entry, stop, target } => {
                        // Entry dead without a single fill → protectives go.
                        if *entry == order_id
                            && order.status != OrderStatus::Filled
                            && order.cumulative_filled == 0
                        {
                            out.push((*stop, "bracket entry dead"));
                            if let Some(t) = target {
                                out.push((*t, "bracket entry dead"));
                            }
                        }
                    }
                    OrderGroup::Oco { members } => {
                        if order.status == OrderStatus::Filled {
                            for m in members.iter().filter(|m| **m != order_id) {
                                out.push((*m, "oco sibling filled"));
                            }
                        }
                    }
                }
            }
            out
        };

        for (id, reason) in to_cancel {
            if let Err(err) = self.cancel(id, reason).await {
                warn!("group policy: cancel of {} failed: {}", id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Bar;
    use crate::engine::events::EventKind;
    use crate::engine::order::OrderSide;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal broker double: accepts everything, counts calls, can reject.
    #[derive(Default)]
    struct StubBroker {
        submits: AtomicUsize,
        cancels: AtomicUsize,
        reject_submits: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl BrokerClient for StubBroker {
        async fn submit_order(&self, ticket: OrderTicket) -> Result<i64, BrokerError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if self.reject_submits.load(Ordering::SeqCst) {
                return Err(BrokerError::Rejected {
                    code: 201,
                    message: "no trading permissions".into(),
                });
            }
            assert!(!ticket.exchange_only);
            Ok(ticket.order_id)
        }

        async fn cancel_order(&self, _order_id: i64) -> Result<(), BrokerError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn subscribe_market_data(&self, _symbol: &str) -> Result<i64, BrokerError> {
            Ok(1)
        }

        async fn unsubscribe_market_data(&self, _req_id: i64) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn request_historical_bars(
            &self,
            _symbol: &str,
            _duration_secs: u64,
            _bar_secs: u64,
        ) -> Result<Vec<Bar>, BrokerError> {
            Ok(vec![])
        }
    }

    fn setup() -> (Arc<EventBus>, Arc<StubBroker>, Arc<OrderManager>) {
        let bus = Arc::new(EventBus::new());
        let broker = Arc::new(StubBroker::default());
        let mgr = Arc::new(OrderManager::new(bus.clone(), broker.clone(), None));
        (bus, broker, mgr)
    }

    #[tokio::test]
    async fn test_submit_happy_path() {
        let (_bus, broker, mgr) = setup();
        let order = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 100));
        assert_eq!(order.status, OrderStatus::Created);

        mgr.submit(order.order_id).await.unwrap();
        assert_eq!(broker.submits.load(Ordering::SeqCst), 1);
        assert_eq!(
            mgr.get_order(order.order_id).unwrap().status,
            OrderStatus::PendingSubmit
        );

        mgr.on_status(order.order_id, "Submitted", 0, 100, 0.0).await;
        assert_eq!(
            mgr.get_order(order.order_id).unwrap().status,
            OrderStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_synchronous_reject() {
        let (bus, broker, mgr) = setup();
        broker.reject_submits.store(true, Ordering::SeqCst);

        let rejected = Arc::new(Mutex::new(Vec::new()));
        let sink = rejected.clone();
        bus.subscribe(
            EventKind::Reject,
            "test",
            crate::engine::bus::handler(move |evt| {
                let sink = sink.clone();
                async move {
                    if let EventPayload::Rejected(r) = evt.payload {
                        sink.lock().unwrap().push(r.order_id);
                    }
                    Ok(())
                }
            }),
        );

        let order = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 100));
        assert!(mgr.submit(order.order_id).await.is_err());

        let o = mgr.get_order(order.order_id).unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        assert!(o.reject_reason.is_some());
        assert_eq!(*rejected.lock().unwrap(), vec![order.order_id]);
    }

    #[tokio::test]
    async fn test_cancel_is_noop_on_terminal() {
        let (_bus, broker, mgr) = setup();
        let order = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 10));
        mgr.submit(order.order_id).await.unwrap();
        mgr.on_status(order.order_id, "Submitted", 0, 10, 0.0).await;
        mgr.on_execution(order.order_id, "e1", 10, 100.0, 10, None).await;
        assert_eq!(
            mgr.get_order(order.order_id).unwrap().status,
            OrderStatus::Filled
        );

        mgr.cancel(order.order_id, "test").await.unwrap();
        assert_eq!(broker.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fill_events_and_duplicate_suppression() {
        let (bus, _broker, mgr) = setup();
        let fills = Arc::new(Mutex::new(Vec::new()));
        let sink = fills.clone();
        bus.subscribe(
            EventKind::Fill,
            "test",
            crate::engine::bus::handler(move |evt| {
                let sink = sink.clone();
                async move {
                    if let EventPayload::Fill(f) = evt.payload {
                        sink.lock().unwrap().push((f.shares, f.cumulative_filled));
                    }
                    Ok(())
                }
            }),
        );

        let order = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 100));
        mgr.submit(order.order_id).await.unwrap();

        mgr.on_execution(order.order_id, "e1", 40, 10.0, 40, None).await;
        // Duplicate broker message: same cumulative quantity.
        mgr.on_execution(order.order_id, "e1", 40, 10.0, 40, None).await;
        mgr.on_execution(order.order_id, "e2", 60, 10.5, 100, None).await;

        assert_eq!(*fills.lock().unwrap(), vec![(40, 40), (60, 100)]);
        let o = mgr.get_order(order.order_id).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.cumulative_filled + o.remaining, o.qty);
    }

    #[tokio::test]
    async fn test_bracket_entry_reject_cancels_protectives() {
        let (_bus, broker, mgr) = setup();
        let entry = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 100));
        let stop = mgr.create_order(OrderSpec::stop("AAPL", OrderSide::Sell, 100, 95.0));
        let target = mgr.create_order(OrderSpec::limit("AAPL", OrderSide::Sell, 100, 110.0));
        mgr.register_bracket(entry.order_id, stop.order_id, Some(target.order_id));

        for id in [entry.order_id, stop.order_id, target.order_id] {
            mgr.submit(id).await.unwrap();
        }

        // Entry dies without a fill.
        mgr.on_status(entry.order_id, "Cancelled", 0, 100, 0.0).await;

        assert_eq!(broker.cancels.load(Ordering::SeqCst), 2);
        assert_eq!(
            mgr.get_order(stop.order_id).unwrap().status,
            OrderStatus::PendingCancel
        );
        assert_eq!(
            mgr.get_order(target.order_id).unwrap().status,
            OrderStatus::PendingCancel
        );
    }

    #[tokio::test]
    async fn test_oco_fill_cancels_siblings() {
        let (_bus, broker, mgr) = setup();
        let a = mgr.create_order(OrderSpec::limit("AAPL", OrderSide::Sell, 50, 110.0));
        let b = mgr.create_order(OrderSpec::stop("AAPL", OrderSide::Sell, 50, 95.0));
        mgr.register_oco(vec![a.order_id, b.order_id]);
        mgr.submit(a.order_id).await.unwrap();
        mgr.submit(b.order_id).await.unwrap();

        mgr.on_execution(a.order_id, "e1", 50, 110.0, 50, None).await;

        assert_eq!(broker.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(
            mgr.get_order(b.order_id).unwrap().status,
            OrderStatus::PendingCancel
        );
    }

    #[tokio::test]
    async fn test_filled_status_ahead_of_executions_is_ignored() {
        let (_bus, _broker, mgr) = setup();
        let order = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 100));
        mgr.submit(order.order_id).await.unwrap();

        mgr.on_status(order.order_id, "Filled", 100, 0, 100.0).await;
        // Accounting unchanged: executions never arrived.
        let o = mgr.get_order(order.order_id).unwrap();
        assert_ne!(o.status, OrderStatus::Filled);
        assert_eq!(o.cumulative_filled, 0);
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let (_bus, _broker, mgr) = setup();
        let order = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 10));
        mgr.submit(order.order_id).await.unwrap();
        mgr.on_status(order.order_id, "Cancelled", 0, 10, 0.0).await;

        mgr.on_status(order.order_id, "Submitted", 0, 10, 0.0).await;
        assert_eq!(
            mgr.get_order(order.order_id).unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_commission_joined_on_exec_id() {
        let (_bus, _broker, mgr) = setup();
        let order = mgr.create_order(OrderSpec::market("AAPL", OrderSide::Buy, 10));
        mgr.submit(order.order_id).await.unwrap();
        mgr.on_execution(order.order_id, "e1", 10, 100.0, 10, None).await;
        mgr.on_commission("e1", 1.25);
        mgr.on_commission("unknown", 9.0);

        let o = mgr.get_order(order.order_id).unwrap();
        assert!((o.commission_paid - 1.25).abs() < 1e-9);
    }
}
