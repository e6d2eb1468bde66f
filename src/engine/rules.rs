//! Declarative rule DSL: conditions, actions, and the typed evaluation
//! context handed to both.
//!
//! Conditions and actions are closed enums evaluated recursively; combinators
//! (`And`/`Or`/`Not`, `Sequential`/`Conditional`) nest arbitrarily. The
//! context is copied per evaluation; rules reach shared state only through
//! the owner components carried in [`Services`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc, Weekday};
use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::indicators::AtrService;
use crate::price::PriceService;

use super::actions::{
    linked_close_all, linked_entry, linked_scale_in, LinkedEntryParams, ScaleInParams,
};
use super::events::{Event, EventKind, FieldValue};
use super::order::{OrderSide, OrderSpec};
use super::order_manager::OrderManager;
use super::position::PositionStatus;
use super::sizing::PositionSizer;
use super::tracker::PositionTracker;
use super::trade_guard::TradeTracker;

// ─────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────

/// Component handles available to every rule.
#[derive(Clone)]
pub struct Services {
    pub orders: Arc<OrderManager>,
    pub positions: Arc<PositionTracker>,
    pub price: Arc<PriceService>,
    pub indicators: Arc<AtrService>,
    pub trades: Arc<TradeTracker>,
    pub sizer: PositionSizer,
}

/// A scoped or global context value.
#[derive(Debug, Clone, PartialEq)]
pub enum CtxValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl CtxValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CtxValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            CtxValue::Num(n) => Some(*n),
            _ => None,
        }
    }
}

/// Per-evaluation context: the triggering event (absent on scheduled
/// passes), the service handles, and the layered variables (global context
/// overlaid with the rule's scoped context).
#[derive(Clone)]
pub struct RuleContext {
    pub event: Option<Event>,
    pub services: Services,
    pub vars: HashMap<String, CtxValue>,
}

impl RuleContext {
    pub fn var_str(&self, key: &str) -> Option<&str> {
        self.vars.get(key).and_then(|v| v.as_str())
    }

    pub fn var_num(&self, key: &str) -> Option<f64> {
        self.vars.get(key).and_then(|v| v.as_num())
    }
}

// ─────────────────────────────────────────────────────────
// Conditions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum FieldPredicate {
    Eq(FieldValue),
    Gte(f64),
    Lte(f64),
    OneOf(Vec<String>),
}

impl FieldPredicate {
    fn matches(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldPredicate::Eq(expect), v) => expect == v,
            (FieldPredicate::Gte(min), FieldValue::Num(n)) => n >= min,
            (FieldPredicate::Lte(max), FieldValue::Num(n)) => n <= max,
            (FieldPredicate::OneOf(options), FieldValue::Str(s)) => {
                options.iter().any(|o| o == s)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventCondition {
    pub kind: EventKind,
    pub fields: Vec<(String, FieldPredicate)>,
}

#[derive(Debug, Clone, Default)]
pub struct PositionCondition {
    /// Falls back to the rule's scoped `symbol` variable when absent.
    pub symbol: Option<String>,
    pub min_unrealized_pnl_pct: Option<f64>,
    pub max_unrealized_pnl_pct: Option<f64>,
    pub min_duration: Option<Duration>,
    pub status: Option<PositionStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct TimeCondition {
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub days_of_week: Option<Vec<Weekday>>,
    pub market_hours_only: bool,
}

/// US regular session expressed in UTC. DST shifts are a deployment concern.
pub const MARKET_OPEN_UTC: (u32, u32) = (14, 30);
pub const MARKET_CLOSE_UTC: (u32, u32) = (21, 0);

#[derive(Debug, Clone)]
pub struct MarketCondition {
    pub symbol: String,
    pub price_bounds: Option<(f64, f64)>,
    pub min_volume: Option<u64>,
    /// Upper bound on ATR.
    pub max_volatility: Option<f64>,
    /// (indicator name, min, max); all must hold.
    pub indicator_bounds: Vec<(String, f64, f64)>,
}

#[derive(Debug, Clone)]
pub enum Condition {
    Event(EventCondition),
    Position(PositionCondition),
    Time(TimeCondition),
    Market(MarketCondition),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn evaluate<'a>(&'a self, ctx: &'a RuleContext) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self {
                Condition::Event(c) => eval_event(c, ctx),
                Condition::Position(c) => eval_position(c, ctx),
                Condition::Time(c) => eval_time(c),
                Condition::Market(c) => eval_market(c, ctx),
                Condition::And(parts) => {
                    for p in parts {
                        if !p.evaluate(ctx).await {
                            return false;
                        }
                    }
                    true
                }
                Condition::Or(parts) => {
                    for p in parts {
                        if p.evaluate(ctx).await {
                            return true;
                        }
                    }
                    false
                }
                Condition::Not(inner) => !inner.evaluate(ctx).await,
            }
        })
    }
}

fn eval_event(cond: &EventCondition, ctx: &RuleContext) -> bool {
    let Some(event) = &ctx.event else {
        // Scheduled passes carry no event; event conditions are false.
        return false;
    };
    if !event.kind().ancestors().contains(&cond.kind) {
        return false;
    }
    cond.fields.iter().all(|(name, pred)| {
        event
            .payload
            .field(name)
            .map(|v| pred.matches(&v))
            .unwrap_or(false)
    })
}

fn eval_position(cond: &PositionCondition, ctx: &RuleContext) -> bool {
    let symbol = cond
        .symbol
        .as_deref()
        .or_else(|| ctx.var_str("symbol"));
    let Some(symbol) = symbol else {
        return false;
    };
    let Some(pos) = ctx.services.positions.get_by_symbol(symbol) else {
        return false;
    };

    if let Some(expect) = cond.status {
        if pos.status != expect {
            return false;
        }
    }
    if let Some(min_dur) = cond.min_duration {
        let held = Utc::now().signed_duration_since(pos.opened_at);
        if held.num_milliseconds() < min_dur.as_millis() as i64 {
            return false;
        }
    }
    if cond.min_unrealized_pnl_pct.is_some() || cond.max_unrealized_pnl_pct.is_some() {
        let Some(tick) = ctx.services.price.last_tick(symbol) else {
            return false;
        };
        let pct = pos.unrealized_pnl_pct(tick.price);
        if let Some(min) = cond.min_unrealized_pnl_pct {
            if pct < min {
                return false;
            }
        }
        if let Some(max) = cond.max_unrealized_pnl_pct {
            if pct > max {
                return false;
            }
        }
    }
    true
}

fn eval_time(cond: &TimeCondition) -> bool {
    let now = Utc::now();
    let time = now.time();

    if let Some(days) = &cond.days_of_week {
        use chrono::Datelike;
        if !days.contains(&now.weekday()) {
            return false;
        }
    }
    if cond.market_hours_only {
        let open = NaiveTime::from_hms_opt(MARKET_OPEN_UTC.0, MARKET_OPEN_UTC.1, 0)
            .expect("valid open time");
        let close = NaiveTime::from_hms_opt(MARKET_CLOSE_UTC.0, MARKET_CLOSE_UTC.1, 0)
            .expect("valid close time");
        if time < open || time > close {
            return false;
        }
    }
    match (cond.start, cond.end) {
        (Some(start), Some(end)) if start <= end => time >= start && time <= end,
        // Overnight window wraps midnight.
        (Some(start), Some(end)) => time >= start || time <= end,
        (Some(start), None) => time >= start,
        (None, Some(end)) => time <= end,
        (None, None) => true,
    }
}

fn eval_market(cond: &MarketCondition, ctx: &RuleContext) -> bool {
    let tick = ctx.services.price.last_tick(&cond.symbol);

    if let Some((lo, hi)) = cond.price_bounds {
        let Some(t) = tick else { return false };
        if t.price < lo || t.price > hi {
            return false;
        }
    }
    if let Some(min_vol) = cond.min_volume {
        let Some(t) = tick else { return false };
        if t.volume < min_vol {
            return false;
        }
    }
    if let Some(max_atr) = cond.max_volatility {
        match ctx.services.indicators.atr(&cond.symbol) {
            Some(atr) if atr <= max_atr => {}
            _ => return false,
        }
    }
    for (name, lo, hi) in &cond.indicator_bounds {
        match ctx.services.indicators.value(&cond.symbol, name) {
            Some(v) if v >= *lo && v <= *hi => {}
            _ => return false,
        }
    }
    true
}

// ─────────────────────────────────────────────────────────
// Actions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BracketParams {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub stop_price: f64,
    pub target_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Action {
    /// Create and submit a standalone order.
    CreateOrder { spec: OrderSpec },
    /// Cancel one order, or every working order for a symbol.
    CancelOrder {
        order_id: Option<i64>,
        symbol: Option<String>,
    },
    /// Market entry plus protective stop / optional target, grouped.
    CreateBracket(BracketParams),
    ClosePosition { symbol: String, reason: String },
    /// Update a position's risk multipliers.
    AdjustPosition {
        symbol: String,
        atr_stop_multiplier: Option<f64>,
        atr_target_multiplier: Option<f64>,
    },
    /// Register a planned position without submitting orders.
    CreatePosition {
        symbol: String,
        side: OrderSide,
        qty: u32,
        atr_stop_multiplier: f64,
        atr_target_multiplier: f64,
    },
    Log { message: String },
    LinkedEntry(LinkedEntryParams),
    LinkedScaleIn(ScaleInParams),
    LinkedCloseAll { symbol: String, reason: String },
    Sequential(Vec<Action>),
    Conditional {
        condition: Box<Condition>,
        action: Box<Action>,
    },
}

impl Action {
    /// Execute, returning a success flag. Failures are logged here; the
    /// engine never retries. The rule simply re-fires when its condition
    /// holds again.
    pub fn execute<'a>(&'a self, ctx: &'a RuleContext) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self {
                Action::CreateOrder { spec } => {
                    let order = ctx.services.orders.create_order(spec.clone());
                    match ctx.services.orders.submit(order.order_id).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!("create order {} failed: {}", order.order_id, err);
                            false
                        }
                    }
                }
                Action::CancelOrder { order_id, symbol } => {
                    let ids: Vec<i64> = match (order_id, symbol) {
                        (Some(id), _) => vec![*id],
                        (None, Some(sym)) => ctx
                            .services
                            .orders
                            .working_orders_for_symbol(sym)
                            .iter()
                            .map(|o| o.order_id)
                            .collect(),
                        (None, None) => {
                            warn!("cancel action without order id or symbol");
                            return false;
                        }
                    };
                    let mut ok = true;
                    for id in ids {
                        if let Err(err) = ctx.services.orders.cancel(id, "rule action").await {
                            warn!("cancel of {} failed: {}", id, err);
                            ok = false;
                        }
                    }
                    ok
                }
                Action::CreateBracket(p) => execute_bracket(ctx, p).await,
                Action::ClosePosition { symbol, reason } => {
                    linked_close_all(&ctx.services, symbol, reason).await
                }
                Action::AdjustPosition {
                    symbol,
                    atr_stop_multiplier,
                    atr_target_multiplier,
                } => {
                    let Some(pos) = ctx.services.positions.get_by_symbol(symbol) else {
                        return false;
                    };
                    ctx.services.positions.update_risk(
                        pos.position_id,
                        *atr_stop_multiplier,
                        *atr_target_multiplier,
                    );
                    true
                }
                Action::CreatePosition {
                    symbol,
                    side,
                    qty,
                    atr_stop_multiplier,
                    atr_target_multiplier,
                } => match ctx.services.positions.plan(
                    symbol,
                    *side,
                    *qty,
                    *atr_stop_multiplier,
                    *atr_target_multiplier,
                ) {
                    Ok(_) => true,
                    Err(err) => {
                        warn!("create position failed: {:#}", err);
                        false
                    }
                },
                Action::Log { message } => {
                    info!("rule: {}", message);
                    true
                }
                Action::LinkedEntry(p) => linked_entry(ctx, p).await,
                Action::LinkedScaleIn(p) => linked_scale_in(&ctx.services, p).await,
                Action::LinkedCloseAll { symbol, reason } => {
                    linked_close_all(&ctx.services, symbol, reason).await
                }
                Action::Sequential(steps) => {
                    for step in steps {
                        if !step.execute(ctx).await {
                            return false;
                        }
                    }
                    true
                }
                Action::Conditional { condition, action } => {
                    if condition.evaluate(ctx).await {
                        action.execute(ctx).await
                    } else {
                        true
                    }
                }
            }
        })
    }
}

async fn execute_bracket(ctx: &RuleContext, p: &BracketParams) -> bool {
    let orders = &ctx.services.orders;
    let entry = orders.create_order(OrderSpec::market(&p.symbol, p.side, p.qty));
    let stop = orders.create_order(OrderSpec::stop(
        &p.symbol,
        p.side.opposite(),
        p.qty,
        p.stop_price,
    ));
    let target = p.target_price.map(|px| {
        orders.create_order(OrderSpec::limit(&p.symbol, p.side.opposite(), p.qty, px))
    });

    orders.register_bracket(
        entry.order_id,
        stop.order_id,
        target.as_ref().map(|t| t.order_id),
    );

    let mut ids = vec![entry.order_id, stop.order_id];
    ids.extend(target.as_ref().map(|t| t.order_id));
    for id in ids {
        if let Err(err) = orders.submit(id).await {
            warn!("bracket leg {} failed: {}", id, err);
            return false;
        }
    }
    true
}

// ─────────────────────────────────────────────────────────
// Rule
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Rule {
    pub rule_id: String,
    pub name: String,
    pub enabled: bool,
    /// Higher runs first within a pass.
    pub priority: i32,
    pub cooldown: Option<Duration>,
    pub max_per_day: Option<u32>,
    pub condition: Condition,
    pub action: Action,
    pub scoped_context: HashMap<String, CtxValue>,
}

impl Rule {
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        condition: Condition,
        action: Action,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            enabled: true,
            priority: 0,
            cooldown: None,
            max_per_day: None,
            condition,
            action,
            scoped_context: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn with_max_per_day(mut self, max: u32) -> Self {
        self.max_per_day = Some(max);
        self
    }

    pub fn with_scoped(mut self, key: impl Into<String>, value: CtxValue) -> Self {
        self.scoped_context.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::broker::sim::SimBroker;
    use crate::broker::{spawn_reader, BrokerPush};
    use crate::engine::bus::EventBus;
    use crate::indicators::AtrConfig;
    use crate::price::PriceConfig;
    use tokio::sync::mpsc;

    pub struct Harness {
        pub bus: Arc<EventBus>,
        pub sim: Arc<SimBroker>,
        pub services: Services,
        pub fills: Arc<crate::engine::fill_manager::UnifiedFillManager>,
    }

    /// Wire a full service set over the simulated broker, with the reader
    /// task pumping pushes into the order manager and bus.
    pub fn harness() -> Harness {
        let bus = Arc::new(EventBus::new());
        let (sim, rx) = SimBroker::new();
        harness_with(bus, sim, rx)
    }

    pub fn harness_with(
        bus: Arc<EventBus>,
        sim: Arc<SimBroker>,
        rx: mpsc::UnboundedReceiver<BrokerPush>,
    ) -> Harness {
        let orders = Arc::new(OrderManager::new(bus.clone(), sim.clone(), None));
        spawn_reader(rx, orders.clone(), bus.clone());
        let trades = Arc::new(TradeTracker::new());
        let positions = Arc::new(PositionTracker::new(
            bus.clone(),
            orders.clone(),
            trades.clone(),
        ));
        // Zero staleness: every lookup snapshots, so tests that move the
        // simulated price observe it immediately.
        let price = Arc::new(PriceService::new(
            PriceConfig {
                timeout: Duration::from_millis(250),
                staleness: Duration::ZERO,
            },
            sim.clone(),
        ));
        price.attach(&bus);
        let indicators = Arc::new(AtrService::new(
            AtrConfig::default(),
            sim.clone(),
            bus.clone(),
        ));
        let services = Services {
            orders: orders.clone(),
            positions: positions.clone(),
            price,
            indicators,
            trades,
            sizer: PositionSizer::default(),
        };
        let fills = Arc::new(crate::engine::fill_manager::UnifiedFillManager::new(
            crate::engine::fill_manager::FillManagerConfig::default(),
            bus.clone(),
            orders,
            positions,
        ));
        fills.attach();
        Harness {
            bus,
            sim,
            services,
            fills,
        }
    }

    pub fn ctx(services: &Services, event: Option<Event>) -> RuleContext {
        RuleContext {
            event,
            services: services.clone(),
            vars: HashMap::new(),
        }
    }
}
