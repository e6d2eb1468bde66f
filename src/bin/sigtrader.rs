//! sigtrader — signal-driven equity trading engine.
//!
//! Wiring:
//!   SignalPoller ──→ EventBus ──→ RuleEngine ──→ linked actions ──→ broker
//!   broker pushes ──reader──→ OrderManager/EventBus ──→ UnifiedFillManager
//!
//! The TWS wire adapter is an external component; this binary runs the
//! engine against the in-memory simulated broker (paper mode). Signal
//! reference prices are mirrored into the simulated book so sizing and
//! protective pricing stay self-consistent.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sigtrader::broker::sim::SimBroker;
use sigtrader::broker::spawn_reader;
use sigtrader::config::{basket_from_json, default_basket, Settings, TickerConfig};
use sigtrader::engine::actions::{CooldownResetManager, LinkedEntryParams};
use sigtrader::engine::bus::{handler, EventBus};
use sigtrader::engine::events::{EventKind, EventPayload, FieldValue};
use sigtrader::engine::fill_manager::{FillManagerConfig, UnifiedFillManager};
use sigtrader::engine::order_manager::OrderManager;
use sigtrader::engine::rule_engine::{RuleEngine, RuleEngineConfig};
use sigtrader::engine::rules::{
    Action, Condition, CtxValue, EventCondition, FieldPredicate, PositionCondition, Rule,
    Services,
};
use sigtrader::engine::sizing::PositionSizer;
use sigtrader::engine::tracker::PositionTracker;
use sigtrader::engine::trade_guard::TradeTracker;
use sigtrader::indicators::{AtrConfig, AtrService};
use sigtrader::price::{PriceConfig, PriceService};
use sigtrader::signals::{SignalApiConfig, SignalPoller};

/// The two rules a ticker gets: entries on BUY/SHORT, reversals on SELL
/// against a live position. SELL with no position is deliberately inert.
fn rules_for(ticker: &TickerConfig) -> Vec<Rule> {
    let cooldown = Duration::from_secs(ticker.cooldown_minutes * 60);
    let entry_params = LinkedEntryParams {
        symbol: ticker.symbol.clone(),
        qty_or_allocation: ticker.allocation,
        side: None, // follow the signal
        auto_protective: true,
        atr_stop_mult: ticker.atr_stop_multiplier,
        atr_target_mult: ticker.atr_target_multiplier,
        stop_loss_pct: Some(1.5),
        take_profit_pct: Some(3.0),
    };

    let signal_cond = |kinds: &[&str]| {
        Condition::Event(EventCondition {
            kind: EventKind::Signal,
            fields: vec![
                (
                    "symbol".into(),
                    FieldPredicate::Eq(FieldValue::Str(ticker.symbol.clone())),
                ),
                (
                    "signal".into(),
                    FieldPredicate::OneOf(kinds.iter().map(|s| s.to_string()).collect()),
                ),
                (
                    "confidence".into(),
                    FieldPredicate::Gte(ticker.confidence_threshold),
                ),
            ],
        })
    };

    vec![
        Rule::new(
            format!("{}-entry", ticker.symbol),
            format!("{} entry on BUY/SHORT", ticker.symbol),
            signal_cond(&["BUY", "SHORT"]),
            Action::LinkedEntry(entry_params.clone()),
        )
        .with_cooldown(cooldown)
        .with_scoped("symbol", CtxValue::Str(ticker.symbol.clone())),
        Rule::new(
            format!("{}-reversal", ticker.symbol),
            format!("{} reversal on SELL", ticker.symbol),
            Condition::And(vec![
                signal_cond(&["SELL"]),
                Condition::Position(PositionCondition {
                    symbol: Some(ticker.symbol.clone()),
                    ..Default::default()
                }),
            ]),
            Action::LinkedEntry(LinkedEntryParams {
                side: Some(sigtrader::engine::order::OrderSide::Sell),
                ..entry_params
            }),
        )
        .with_priority(10)
        .with_cooldown(cooldown)
        .with_scoped("symbol", CtxValue::Str(ticker.symbol.clone())),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("═══════════════════════════════════════════════════");
    info!("  sigtrader — signal-driven equity trading engine");
    info!("═══════════════════════════════════════════════════");

    let settings = Settings::from_env()?;
    let basket = match std::env::var("SIGTRADER_BASKET") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|err| anyhow::anyhow!("cannot read basket file {path}: {err}"))?;
            basket_from_json(&raw)?
        }
        Err(_) => default_basket(),
    };
    let symbols: Vec<String> = basket.iter().map(|t| t.symbol.clone()).collect();

    info!(
        "📊 basket: {} | broker {}:{} client {}",
        symbols.join(","),
        settings.tws_host,
        settings.tws_port,
        settings.tws_client_id,
    );

    // ═══ Core wiring ═══
    let bus = Arc::new(EventBus::new());
    let (sim, push_rx) = SimBroker::new();
    info!("📝 paper mode: simulated broker (wire adapter not linked)");

    let orders = Arc::new(OrderManager::new(
        bus.clone(),
        sim.clone(),
        settings.tws_account.clone(),
    ));
    let trades = Arc::new(TradeTracker::new());
    let tracker = Arc::new(PositionTracker::new(
        bus.clone(),
        orders.clone(),
        trades.clone(),
    ));
    let price = Arc::new(PriceService::new(PriceConfig::default(), sim.clone()));
    price.attach(&bus);
    let indicators = Arc::new(AtrService::new(
        AtrConfig::default(),
        sim.clone(),
        bus.clone(),
    ));

    let services = Services {
        orders: orders.clone(),
        positions: tracker.clone(),
        price: price.clone(),
        indicators: indicators.clone(),
        trades: trades.clone(),
        sizer: PositionSizer::default(),
    };

    let fills = Arc::new(UnifiedFillManager::new(
        FillManagerConfig::default(),
        bus.clone(),
        orders.clone(),
        tracker.clone(),
    ));
    fills.attach();

    let engine = Arc::new(RuleEngine::new(
        RuleEngineConfig {
            eval_interval: settings.eval_interval,
        },
        bus.clone(),
        services,
    ));
    fills.set_cooldown_manager(Arc::new(CooldownResetManager::new(engine.clone())));

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.push(spawn_reader(push_rx, orders.clone(), bus.clone()));
    handles.push(indicators.spawn_refresh(symbols.clone()));

    // Paper feed: mirror each signal's reference price into the simulated
    // book so the price service and protective pricing have a quote.
    {
        let sim = sim.clone();
        bus.subscribe(
            EventKind::Signal,
            "paper-feed",
            handler(move |evt| {
                let sim = sim.clone();
                async move {
                    if let EventPayload::Signal(s) = evt.payload {
                        if s.reference_price > 0.0 {
                            sim.set_price(&s.symbol, s.reference_price);
                        }
                    }
                    Ok(())
                }
            }),
        );
    }

    for ticker in &basket {
        for rule in rules_for(ticker) {
            engine.register_rule(rule);
        }
    }
    engine.start();
    sim.push_connected();

    match settings.signal_feed() {
        Some((base_url, api_key)) => {
            let poller = SignalPoller::new(
                SignalApiConfig {
                    base_url: base_url.to_string(),
                    api_key: api_key.clone(),
                    poll_interval: settings.signal_poll_interval,
                    tickers: symbols.clone(),
                },
                bus.clone(),
            );
            handles.push(poller.spawn());
        }
        None => {
            warn!("SIGNAL_API_BASE_URL / SIGNAL_API_KEY not set — no signal feed, engine idles");
        }
    }

    info!("🚀 engine running — ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    // ═══ Shutdown ═══
    info!("🧹 shutting down");
    bus.disable();
    engine.stop();
    for handle in handles {
        handle.abort();
        let _ = handle.await;
    }

    let open = tracker.summary();
    if !open.is_empty() {
        warn!(
            "open positions at shutdown: {}",
            open.iter()
                .map(|p| format!("{} {}x{}", p.symbol, p.side.as_str(), p.current_qty))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
    Ok(())
}
