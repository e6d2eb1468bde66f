//! Position records.
//!
//! A position owns order ids only (grouped by role); orders are resolved
//! through the order manager with the symbol as the join key. Lifecycle:
//! `Planned → Opening → Open → (Adjusting)* → Closing → Closed`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::order::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Planned,
    Opening,
    Open,
    Adjusting,
    Closing,
    Closed,
}

impl PositionStatus {
    /// Active positions occupy the per-symbol slot.
    pub fn is_active(self) -> bool {
        self != PositionStatus::Closed
    }
}

/// How an order relates to its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRole {
    Main,
    Stop,
    Target,
    Doubledown,
    Scale,
}

impl OrderRole {
    pub fn is_protective(self) -> bool {
        matches!(self, OrderRole::Stop | OrderRole::Target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderRole::Main => "main",
            OrderRole::Stop => "stop",
            OrderRole::Target => "target",
            OrderRole::Doubledown => "doubledown",
            OrderRole::Scale => "scale",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub target_qty: u32,
    /// Tracker's view of the unsigned net quantity. The fill manager
    /// recomputes the authoritative value from order fill totals.
    pub current_qty: u32,
    pub main_order_ids: Vec<i64>,
    pub stop_order_ids: Vec<i64>,
    pub target_order_ids: Vec<i64>,
    pub doubledown_order_ids: Vec<i64>,
    pub scale_order_ids: Vec<i64>,
    pub atr_stop_multiplier: f64,
    pub atr_target_multiplier: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Position {
    pub fn new(
        symbol: impl Into<String>,
        side: OrderSide,
        target_qty: u32,
        atr_stop_multiplier: f64,
        atr_target_multiplier: f64,
    ) -> Self {
        Self {
            position_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            status: PositionStatus::Planned,
            entry_price: 0.0,
            target_qty,
            current_qty: 0,
            main_order_ids: Vec::new(),
            stop_order_ids: Vec::new(),
            target_order_ids: Vec::new(),
            doubledown_order_ids: Vec::new(),
            scale_order_ids: Vec::new(),
            atr_stop_multiplier,
            atr_target_multiplier,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            opened_at: Utc::now(),
            closed_at: None,
            reason: None,
        }
    }

    pub fn attach(&mut self, role: OrderRole, order_id: i64) {
        let list = self.ids_mut(role);
        if !list.contains(&order_id) {
            list.push(order_id);
        }
    }

    pub fn detach(&mut self, order_id: i64) -> bool {
        let mut removed = false;
        for role in [
            OrderRole::Main,
            OrderRole::Stop,
            OrderRole::Target,
            OrderRole::Doubledown,
            OrderRole::Scale,
        ] {
            let list = self.ids_mut(role);
            let before = list.len();
            list.retain(|id| *id != order_id);
            removed |= list.len() < before;
        }
        removed
    }

    pub fn role_of(&self, order_id: i64) -> Option<OrderRole> {
        if self.main_order_ids.contains(&order_id) {
            Some(OrderRole::Main)
        } else if self.stop_order_ids.contains(&order_id) {
            Some(OrderRole::Stop)
        } else if self.target_order_ids.contains(&order_id) {
            Some(OrderRole::Target)
        } else if self.doubledown_order_ids.contains(&order_id) {
            Some(OrderRole::Doubledown)
        } else if self.scale_order_ids.contains(&order_id) {
            Some(OrderRole::Scale)
        } else {
            None
        }
    }

    pub fn ids_for(&self, role: OrderRole) -> &[i64] {
        match role {
            OrderRole::Main => &self.main_order_ids,
            OrderRole::Stop => &self.stop_order_ids,
            OrderRole::Target => &self.target_order_ids,
            OrderRole::Doubledown => &self.doubledown_order_ids,
            OrderRole::Scale => &self.scale_order_ids,
        }
    }

    fn ids_mut(&mut self, role: OrderRole) -> &mut Vec<i64> {
        match role {
            OrderRole::Main => &mut self.main_order_ids,
            OrderRole::Stop => &mut self.stop_order_ids,
            OrderRole::Target => &mut self.target_order_ids,
            OrderRole::Doubledown => &mut self.doubledown_order_ids,
            OrderRole::Scale => &mut self.scale_order_ids,
        }
    }

    pub fn all_order_ids(&self) -> Vec<i64> {
        let mut ids = Vec::with_capacity(
            self.main_order_ids.len()
                + self.stop_order_ids.len()
                + self.target_order_ids.len()
                + self.doubledown_order_ids.len()
                + self.scale_order_ids.len(),
        );
        ids.extend(&self.main_order_ids);
        ids.extend(&self.stop_order_ids);
        ids.extend(&self.target_order_ids);
        ids.extend(&self.doubledown_order_ids);
        ids.extend(&self.scale_order_ids);
        ids
    }

    pub fn protective_order_ids(&self) -> Vec<i64> {
        let mut ids = self.stop_order_ids.clone();
        ids.extend(&self.target_order_ids);
        ids
    }

    /// Signed quantity from the tracker's view: + long, − short.
    pub fn signed_qty(&self) -> i64 {
        self.side.sign() * self.current_qty as i64
    }

    /// Unrealized PnL percentage against a reference price.
    pub fn unrealized_pnl_pct(&self, last_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() as f64 * (last_price - self.entry_price) / self.entry_price * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach_roles() {
        let mut p = Position::new("AAPL", OrderSide::Buy, 100, 6.0, 3.0);
        p.attach(OrderRole::Main, 1);
        p.attach(OrderRole::Stop, 2);
        p.attach(OrderRole::Target, 3);
        p.attach(OrderRole::Stop, 2); // idempotent

        assert_eq!(p.role_of(1), Some(OrderRole::Main));
        assert_eq!(p.role_of(2), Some(OrderRole::Stop));
        assert_eq!(p.stop_order_ids, vec![2]);
        assert_eq!(p.protective_order_ids(), vec![2, 3]);

        assert!(p.detach(2));
        assert!(!p.detach(2));
        assert_eq!(p.role_of(2), None);
    }

    #[test]
    fn test_unrealized_pnl_pct_polarity() {
        let mut long = Position::new("AAPL", OrderSide::Buy, 100, 6.0, 3.0);
        long.entry_price = 100.0;
        assert!((long.unrealized_pnl_pct(105.0) - 5.0).abs() < 1e-9);
        assert!((long.unrealized_pnl_pct(95.0) + 5.0).abs() < 1e-9);

        let mut short = Position::new("AAPL", OrderSide::Sell, 100, 6.0, 3.0);
        short.entry_price = 100.0;
        assert!((short.unrealized_pnl_pct(95.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_signed_qty() {
        let mut p = Position::new("TQQQ", OrderSide::Sell, 50, 6.0, 3.0);
        p.current_qty = 50;
        assert_eq!(p.signed_qty(), -50);
    }
}
