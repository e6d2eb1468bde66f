//! Trading engine core.
//!
//! Data flow:
//!   signals/broker ──→ EventBus ──→ RuleEngine ──→ linked actions ──→ broker
//!   broker fills ──→ OrderManager ──→ EventBus ──→ UnifiedFillManager
//!                ──→ PositionTracker ──→ EventBus (position events)
//!
//! Ownership is strict: the order manager is the only mutator of orders, the
//! position tracker the only mutator of positions, and the fill manager the
//! only component that resizes protective orders or closes positions off
//! fills.

pub mod actions;
pub mod bus;
pub mod events;
pub mod fill_manager;
pub mod order;
pub mod order_manager;
pub mod position;
pub mod rule_engine;
pub mod rules;
pub mod sizing;
pub mod tracker;
pub mod trade_guard;
