//! Order records and the order status machine.
//!
//! `CREATED → PENDING_SUBMIT → (ACCEPTED | REJECTED) → SUBMITTED →
//! (PARTIALLY_FILLED* → FILLED | PENDING_CANCEL → CANCELLED | INACTIVE)`
//!
//! Invariant maintained by every mutation: `cumulative_filled + remaining ==
//! qty`, and `status == Filled` exactly when `remaining == 0`.

use chrono::{DateTime, Utc};

// ─────────────────────────────────────────────────────────
// Enums
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for Buy, −1 for Sell. Used for signed fill arithmetic.
    pub fn sign(self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    Trail,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tif {
    Day,
    Gtc,
    Ioc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Created,
    PendingSubmit,
    Accepted,
    Rejected,
    Submitted,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Cancelled,
    Inactive,
}

impl OrderStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Inactive
        )
    }

    /// Whether the order is (or may be) live at the broker.
    pub fn is_working(self) -> bool {
        matches!(
            self,
            OrderStatus::PendingSubmit
                | OrderStatus::Accepted
                | OrderStatus::Submitted
                | OrderStatus::PartiallyFilled
                | OrderStatus::PendingCancel
        )
    }
}

// ─────────────────────────────────────────────────────────
// Order spec & record
// ─────────────────────────────────────────────────────────

/// What the caller asks for. The manager turns this into an [`Order`].
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tif: Tif,
    pub parent_order_id: Option<i64>,
}

impl OrderSpec {
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: u32) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            tif: Tif::Day,
            parent_order_id: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, qty: u32, limit: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            order_type: OrderType::Limit,
            limit_price: Some(limit),
            stop_price: None,
            tif: Tif::Gtc,
            parent_order_id: None,
        }
    }

    pub fn stop(symbol: impl Into<String>, side: OrderSide, qty: u32, stop: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            order_type: OrderType::Stop,
            limit_price: None,
            stop_price: Some(stop),
            tif: Tif::Gtc,
            parent_order_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tif: Tif,
    pub parent_order_id: Option<i64>,
    pub status: OrderStatus,
    pub cumulative_filled: u32,
    pub remaining: u32,
    pub avg_fill_price: f64,
    /// Commission accumulated from broker commission reports.
    pub commission_paid: f64,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of applying one execution to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The execution was new and left the order partially filled.
    Partial,
    /// The execution was new and completed the order.
    Complete,
    /// The execution's cumulative quantity was already reflected
    /// (duplicate broker message). State unchanged.
    Duplicate,
}

impl Order {
    pub fn new(order_id: i64, spec: OrderSpec) -> Self {
        let now = Utc::now();
        Self {
            order_id,
            symbol: spec.symbol,
            side: spec.side,
            qty: spec.qty,
            order_type: spec.order_type,
            limit_price: spec.limit_price,
            stop_price: spec.stop_price,
            tif: spec.tif,
            parent_order_id: spec.parent_order_id,
            status: OrderStatus::Created,
            cumulative_filled: 0,
            remaining: spec.qty,
            avg_fill_price: 0.0,
            commission_paid: 0.0,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Signed filled quantity: +filled for Buy, −filled for Sell.
    pub fn signed_filled(&self) -> i64 {
        self.side.sign() * self.cumulative_filled as i64
    }

    /// Apply an execution carrying the broker's cumulative filled quantity.
    ///
    /// Duplicate messages (cum_qty not ahead of what we already hold) are
    /// reported as [`FillOutcome::Duplicate`] and leave the order untouched.
    /// The incremental shares are derived from `cum_qty` rather than trusted
    /// from the message, so replays and overlaps cannot double-count.
    pub fn apply_execution(&mut self, cum_qty: u32, price: f64) -> (FillOutcome, u32) {
        if cum_qty <= self.cumulative_filled {
            return (FillOutcome::Duplicate, 0);
        }
        let shares = (cum_qty - self.cumulative_filled).min(self.remaining);
        if shares == 0 {
            return (FillOutcome::Duplicate, 0);
        }

        let old = self.cumulative_filled as f64;
        self.avg_fill_price =
            (old * self.avg_fill_price + shares as f64 * price) / (old + shares as f64);
        self.cumulative_filled += shares;
        self.remaining -= shares;
        self.updated_at = Utc::now();

        if self.remaining == 0 {
            self.status = OrderStatus::Filled;
            (FillOutcome::Complete, shares)
        } else {
            self.status = OrderStatus::PartiallyFilled;
            (FillOutcome::Partial, shares)
        }
    }
}
