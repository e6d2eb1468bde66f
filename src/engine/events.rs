//! Event model — sealed variant hierarchy routed by a static parent chain.
//!
//! Every event carries an id, a wall-clock timestamp, a source tag and
//! free-form metadata. Subscribers register against an [`EventKind`]; a
//! handler subscribed to a parent kind (`Market`, `Order`, `Position`,
//! `System`, or the root `Any`) receives all child kinds. Routing walks
//! [`EventKind::ancestors`], a static table, never runtime type inspection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::order::{OrderSide, OrderStatus};

// ─────────────────────────────────────────────────────────
// Kind hierarchy
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Any,
    Market,
    Price,
    Volume,
    Indicator,
    Signal,
    Order,
    OrderStatus,
    Fill,
    Cancel,
    Reject,
    Position,
    PositionOpen,
    PositionUpdate,
    PositionClose,
    System,
    Connect,
    Disconnect,
    Error,
}

impl EventKind {
    /// The kind itself followed by every supertype, ending at `Any`.
    pub fn ancestors(self) -> &'static [EventKind] {
        use EventKind::*;
        match self {
            Any => &[Any],
            Market => &[Market, Any],
            Price => &[Price, Market, Any],
            Volume => &[Volume, Market, Any],
            Indicator => &[Indicator, Market, Any],
            Signal => &[Signal, Any],
            Order => &[Order, Any],
            OrderStatus => &[OrderStatus, Order, Any],
            Fill => &[Fill, Order, Any],
            Cancel => &[Cancel, Order, Any],
            Reject => &[Reject, Order, Any],
            Position => &[Position, Any],
            PositionOpen => &[PositionOpen, Position, Any],
            PositionUpdate => &[PositionUpdate, Position, Any],
            PositionClose => &[PositionClose, Position, Any],
            System => &[System, Any],
            Connect => &[Connect, System, Any],
            Disconnect => &[Disconnect, System, Any],
            Error => &[Error, System, Any],
        }
    }
}

// ─────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Buy,
    Sell,
    Short,
}

impl SignalKind {
    /// Wire mapping: SHORT enters on the sell side.
    pub fn side(self) -> OrderSide {
        match self {
            SignalKind::Buy => OrderSide::Buy,
            SignalKind::Sell | SignalKind::Short => OrderSide::Sell,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" => Some(SignalKind::Buy),
            "SELL" => Some(SignalKind::Sell),
            "SHORT" => Some(SignalKind::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: u64,
}

#[derive(Debug, Clone)]
pub struct VolumeTick {
    pub symbol: String,
    pub volume: u64,
}

#[derive(Debug, Clone)]
pub struct IndicatorUpdate {
    pub symbol: String,
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct PredictionSignal {
    pub symbol: String,
    pub signal: SignalKind,
    pub confidence: f64,
    pub reference_price: f64,
    pub model_ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderStatusUpdate {
    pub order_id: i64,
    pub status: OrderStatus,
    pub filled: u32,
    pub remaining: u32,
    pub avg_fill_price: f64,
    pub ts: DateTime<Utc>,
}

/// One execution against one order. The single source of truth for
/// position changes downstream.
#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub shares: u32,
    pub price: f64,
    pub commission: Option<f64>,
    pub cumulative_filled: u32,
    pub remaining: u32,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderCancelled {
    pub order_id: i64,
    pub symbol: String,
}

#[derive(Debug, Clone)]
pub struct OrderRejected {
    pub order_id: i64,
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PositionOpened {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub entry_price: f64,
}

#[derive(Debug, Clone)]
pub struct PositionUpdated {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub entry_price: f64,
}

#[derive(Debug, Clone)]
pub struct PositionClosed {
    pub position_id: Uuid,
    pub symbol: String,
    pub reason: String,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone)]
pub struct SystemError {
    pub code: i32,
    pub msg: String,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Price(PriceTick),
    Volume(VolumeTick),
    Indicator(IndicatorUpdate),
    Signal(PredictionSignal),
    OrderStatus(OrderStatusUpdate),
    Fill(Fill),
    Cancelled(OrderCancelled),
    Rejected(OrderRejected),
    PositionOpened(PositionOpened),
    PositionUpdated(PositionUpdated),
    PositionClosed(PositionClosed),
    Connected,
    Disconnected,
    Error(SystemError),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Price(_) => EventKind::Price,
            EventPayload::Volume(_) => EventKind::Volume,
            EventPayload::Indicator(_) => EventKind::Indicator,
            EventPayload::Signal(_) => EventKind::Signal,
            EventPayload::OrderStatus(_) => EventKind::OrderStatus,
            EventPayload::Fill(_) => EventKind::Fill,
            EventPayload::Cancelled(_) => EventKind::Cancel,
            EventPayload::Rejected(_) => EventKind::Reject,
            EventPayload::PositionOpened(_) => EventKind::PositionOpen,
            EventPayload::PositionUpdated(_) => EventKind::PositionUpdate,
            EventPayload::PositionClosed(_) => EventKind::PositionClose,
            EventPayload::Connected => EventKind::Connect,
            EventPayload::Disconnected => EventKind::Disconnect,
            EventPayload::Error(_) => EventKind::Error,
        }
    }

    /// Named-field access for rule predicates. Only fields that rules
    /// actually match on are exposed; unknown names return `None`.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        match (self, name) {
            (EventPayload::Price(p), "symbol") => Some(FieldValue::Str(p.symbol.clone())),
            (EventPayload::Price(p), "price") => Some(FieldValue::Num(p.price)),
            (EventPayload::Price(p), "volume") => Some(FieldValue::Num(p.volume as f64)),
            (EventPayload::Signal(s), "symbol") => Some(FieldValue::Str(s.symbol.clone())),
            (EventPayload::Signal(s), "signal") => Some(FieldValue::Str(
                match s.signal {
                    SignalKind::Buy => "BUY",
                    SignalKind::Sell => "SELL",
                    SignalKind::Short => "SHORT",
                }
                .to_string(),
            )),
            (EventPayload::Signal(s), "confidence") => Some(FieldValue::Num(s.confidence)),
            (EventPayload::Signal(s), "reference_price") => {
                Some(FieldValue::Num(s.reference_price))
            }
            (EventPayload::Fill(f), "symbol") => Some(FieldValue::Str(f.symbol.clone())),
            (EventPayload::Fill(f), "side") => {
                Some(FieldValue::Str(f.side.as_str().to_string()))
            }
            (EventPayload::Fill(f), "shares") => Some(FieldValue::Num(f.shares as f64)),
            (EventPayload::Fill(f), "price") => Some(FieldValue::Num(f.price)),
            (EventPayload::Indicator(i), "symbol") => Some(FieldValue::Str(i.symbol.clone())),
            (EventPayload::Indicator(i), "name") => Some(FieldValue::Str(i.name.clone())),
            (EventPayload::Indicator(i), "value") => Some(FieldValue::Num(i.value)),
            (EventPayload::PositionClosed(p), "symbol") => {
                Some(FieldValue::Str(p.symbol.clone()))
            }
            (EventPayload::PositionClosed(p), "reason") => {
                Some(FieldValue::Str(p.reason.clone()))
            }
            _ => None,
        }
    }
}

/// A scalar extracted from an event for predicate matching.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Num(f64),
}

// ─────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: Uuid,
    pub ts: DateTime<Utc>,
    pub source: &'static str,
    pub metadata: HashMap<String, String>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: &'static str, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            ts: Utc::now(),
            source,
            metadata: HashMap::new(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestors_walk_to_root() {
        assert_eq!(
            EventKind::Fill.ancestors(),
            &[EventKind::Fill, EventKind::Order, EventKind::Any]
        );
        assert_eq!(
            EventKind::Price.ancestors(),
            &[EventKind::Price, EventKind::Market, EventKind::Any]
        );
        assert_eq!(EventKind::Any.ancestors(), &[EventKind::Any]);
    }

    #[test]
    fn test_every_kind_reaches_any() {
        use EventKind::*;
        for kind in [
            Any, Market, Price, Volume, Indicator, Signal, Order, OrderStatus, Fill, Cancel,
            Reject, Position, PositionOpen, PositionUpdate, PositionClose, System, Connect,
            Disconnect, Error,
        ] {
            assert_eq!(*kind.ancestors().last().unwrap(), Any);
            assert_eq!(kind.ancestors()[0], kind);
        }
    }

    #[test]
    fn test_short_signal_maps_to_sell_side() {
        assert_eq!(SignalKind::Short.side(), OrderSide::Sell);
        assert_eq!(SignalKind::Sell.side(), OrderSide::Sell);
        assert_eq!(SignalKind::Buy.side(), OrderSide::Buy);
    }

    #[test]
    fn test_signal_parse() {
        assert_eq!(SignalKind::parse("short"), Some(SignalKind::Short));
        assert_eq!(SignalKind::parse("BUY"), Some(SignalKind::Buy));
        assert_eq!(SignalKind::parse("hold"), None);
    }

    #[test]
    fn test_field_lookup() {
        let evt = EventPayload::Signal(PredictionSignal {
            symbol: "AAPL".into(),
            signal: SignalKind::Buy,
            confidence: 0.91,
            reference_price: 150.0,
            model_ts: Utc::now(),
        });
        assert_eq!(evt.field("symbol"), Some(FieldValue::Str("AAPL".into())));
        assert_eq!(evt.field("confidence"), Some(FieldValue::Num(0.91)));
        assert_eq!(evt.field("nope"), None);
    }
}
