//! Linked-order actions: entry with automatic protective orders, scale-in,
//! close-all, and the cooldown reset policy.
//!
//! Entry flow:
//!   guard check → (reverse if opposite) → size → MARKET entry →
//!   STOP + LIMIT protectives at ATR distances (percentage fallback).
//!
//! The trade guard is claimed before the entry order goes out and released
//! only when the position closes, so a second same-side signal between
//! submit and fill is an idempotent no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{info, warn};

use super::events::EventPayload;
use super::order::{OrderSide, OrderSpec};
use super::position::{OrderRole, PositionStatus};
use super::rule_engine::RuleEngine;
use super::rules::{RuleContext, Services};

/// How long a reversal waits for the previous position to finish closing.
const REVERSAL_WAIT: Duration = Duration::from_secs(5);
const REVERSAL_POLL: Duration = Duration::from_millis(25);

// ─────────────────────────────────────────────────────────
// Parameters
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LinkedEntryParams {
    pub symbol: String,
    /// Above the sizer's threshold this is a dollar allocation, otherwise an
    /// explicit share count.
    pub qty_or_allocation: f64,
    /// `None` follows the side of the triggering prediction signal.
    pub side: Option<OrderSide>,
    pub auto_protective: bool,
    pub atr_stop_mult: f64,
    pub atr_target_mult: f64,
    /// Percentage fallbacks used when ATR is unavailable (e.g. 1.5 = 1.5%).
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ScaleInParams {
    pub symbol: String,
    pub scale_qty: u32,
    /// Minimum unrealized PnL% before adding to the position.
    pub trigger_profit_pct: f64,
}

// ─────────────────────────────────────────────────────────
// Entry
// ─────────────────────────────────────────────────────────

pub async fn linked_entry(ctx: &RuleContext, p: &LinkedEntryParams) -> bool {
    let svc = &ctx.services;
    let side = p.side.or_else(|| match ctx.event.as_ref().map(|e| &e.payload) {
        Some(EventPayload::Signal(s)) => Some(s.signal.side()),
        _ => None,
    });
    let Some(side) = side else {
        warn!("entry {}: no side given and no signal in context", p.symbol);
        return false;
    };

    // Duplicate guard / reversal. The guard map is the race-free check.
    if let Some(active) = svc.trades.active(&p.symbol) {
        if active.side == side {
            info!(
                "entry {}: ignored duplicate side {} (trade active since {:?})",
                p.symbol,
                side.as_str(),
                active.started_at.elapsed(),
            );
            return true;
        }
        info!(
            "entry {}: opposite signal against live {} trade — reversing",
            p.symbol,
            active.side.as_str(),
        );
        if !linked_close_all(svc, &p.symbol, "reversal").await {
            return false;
        }
        if !wait_for_flat(svc, &p.symbol, REVERSAL_WAIT).await {
            warn!("entry {}: reversal close did not complete in time", p.symbol);
            return false;
        }
    }

    // Sizing. The allocation path needs a price; protective pricing reuses it.
    let last_price = match svc.price.last_price(&p.symbol).await {
        Ok(px) => Some(px),
        Err(err) => {
            warn!("entry {}: no price available ({})", p.symbol, err);
            None
        }
    };
    let shares = match svc.sizer.shares_for(p.qty_or_allocation, last_price) {
        Ok(s) => s,
        Err(err) => {
            warn!("entry {}: sizing aborted: {}", p.symbol, err);
            return false;
        }
    };

    // Position + entry order. The main order is attached before submission
    // so its fill classifies correctly however quickly it comes back.
    let pos = match svc.positions.plan(
        &p.symbol,
        side,
        shares,
        p.atr_stop_mult,
        p.atr_target_mult,
    ) {
        Ok(pos) => pos,
        Err(err) => {
            warn!("entry {}: {:#}", p.symbol, err);
            return false;
        }
    };
    svc.positions.set_status(pos.position_id, PositionStatus::Opening);

    let entry = svc
        .orders
        .create_order(OrderSpec::market(&p.symbol, side, shares));
    svc.positions
        .attach_order(pos.position_id, OrderRole::Main, entry.order_id);
    if !svc.trades.start(&p.symbol, side) {
        warn!("entry {}: trade guard already claimed", p.symbol);
    }

    info!(
        "entry {}: MARKET {} {} (order {})",
        p.symbol,
        side.as_str(),
        shares,
        entry.order_id,
    );
    if let Err(err) = svc.orders.submit(entry.order_id).await {
        warn!("entry {}: submit failed: {}", p.symbol, err);
        svc.positions.close(pos.position_id, "entry submit failed").await;
        return false;
    }

    if p.auto_protective {
        place_protectives(svc, p, pos.position_id, entry.order_id, side, shares, last_price)
            .await;
    }
    true
}

/// Submit STOP + LIMIT protective orders sized to the entry quantity.
/// Prices come from ATR distances; percentage fallbacks apply when ATR is
/// cold; with neither the position is left unprotected and logged.
#[allow(clippy::too_many_arguments)]
async fn place_protectives(
    svc: &Services,
    p: &LinkedEntryParams,
    position_id: uuid::Uuid,
    entry_order_id: i64,
    side: OrderSide,
    shares: u32,
    last_price: Option<f64>,
) {
    let Some(entry_ref) = last_price else {
        warn!(
            "entry {}: no reference price — position left without protective orders",
            p.symbol
        );
        return;
    };

    let (stop_px, target_px) = match svc.indicators.atr(&p.symbol) {
        Some(atr) => {
            let stop = entry_ref - side.sign() as f64 * p.atr_stop_mult * atr;
            let target = entry_ref + side.sign() as f64 * p.atr_target_mult * atr;
            (Some(round_cents(stop)), Some(round_cents(target)))
        }
        None => {
            let stop = p
                .stop_loss_pct
                .map(|pct| round_cents(entry_ref * (1.0 - side.sign() as f64 * pct / 100.0)));
            let target = p
                .take_profit_pct
                .map(|pct| round_cents(entry_ref * (1.0 + side.sign() as f64 * pct / 100.0)));
            if stop.is_none() && target.is_none() {
                warn!(
                    "entry {}: ATR unavailable and no percentage fallback — position unprotected",
                    p.symbol
                );
            }
            (stop, target)
        }
    };

    let stop_order = stop_px.map(|px| {
        let o = svc
            .orders
            .create_order(OrderSpec::stop(&p.symbol, side.opposite(), shares, px));
        svc.positions
            .attach_order(position_id, OrderRole::Stop, o.order_id);
        info!(
            "entry {}: STOP {} {} @ {:.2} (order {})",
            p.symbol,
            side.opposite().as_str(),
            shares,
            px,
            o.order_id,
        );
        o
    });
    let target_order = target_px.map(|px| {
        let o = svc
            .orders
            .create_order(OrderSpec::limit(&p.symbol, side.opposite(), shares, px));
        svc.positions
            .attach_order(position_id, OrderRole::Target, o.order_id);
        info!(
            "entry {}: LIMIT {} {} @ {:.2} (order {})",
            p.symbol,
            side.opposite().as_str(),
            shares,
            px,
            o.order_id,
        );
        o
    });

    if let Some(stop) = &stop_order {
        svc.orders.register_bracket(
            entry_order_id,
            stop.order_id,
            target_order.as_ref().map(|t| t.order_id),
        );
    }

    for order in stop_order.iter().chain(target_order.iter()) {
        if let Err(err) = svc.orders.submit(order.order_id).await {
            warn!(
                "entry {}: protective {} submit failed: {}",
                p.symbol, order.order_id, err
            );
        }
    }
}

fn round_cents(px: f64) -> f64 {
    (px * 100.0).round() / 100.0
}

// ─────────────────────────────────────────────────────────
// Scale-in
// ─────────────────────────────────────────────────────────

pub async fn linked_scale_in(svc: &Services, p: &ScaleInParams) -> bool {
    let Some(pos) = svc.positions.get_by_symbol(&p.symbol) else {
        return true; // nothing to scale
    };
    if pos.status != PositionStatus::Open {
        return true;
    }

    let last_price = match svc.price.last_price(&p.symbol).await {
        Ok(px) => px,
        Err(err) => {
            warn!("scale-in {}: no price ({})", p.symbol, err);
            return false;
        }
    };
    let pnl_pct = pos.unrealized_pnl_pct(last_price);
    if pnl_pct < p.trigger_profit_pct {
        info!(
            "scale-in {}: pnl {:.2}% below trigger {:.2}%, skipping",
            p.symbol, pnl_pct, p.trigger_profit_pct,
        );
        return true;
    }

    let order = svc
        .orders
        .create_order(OrderSpec::market(&p.symbol, pos.side, p.scale_qty));
    svc.positions
        .attach_order(pos.position_id, OrderRole::Scale, order.order_id);
    svc.positions
        .set_status(pos.position_id, PositionStatus::Adjusting);

    info!(
        "scale-in {}: MARKET {} {} at +{:.2}% (order {})",
        p.symbol,
        pos.side.as_str(),
        p.scale_qty,
        pnl_pct,
        order.order_id,
    );
    match svc.orders.submit(order.order_id).await {
        Ok(()) => true,
        Err(err) => {
            warn!("scale-in {}: submit failed: {}", p.symbol, err);
            svc.positions.detach_order(pos.position_id, order.order_id);
            svc.positions.set_status(pos.position_id, PositionStatus::Open);
            false
        }
    }
}

// ─────────────────────────────────────────────────────────
// Close-all
// ─────────────────────────────────────────────────────────

/// Cancel every working linked order and flatten the position with an
/// opposite market order. The closing fill drives the actual close through
/// the fill manager.
pub async fn linked_close_all(svc: &Services, symbol: &str, reason: &str) -> bool {
    let Some(pos) = svc.positions.get_by_symbol(symbol) else {
        return true;
    };
    svc.positions.mark_closing(pos.position_id, reason);

    for id in pos.all_order_ids() {
        if let Some(order) = svc.orders.get_order(id) {
            if order.status.is_working() {
                if let Err(err) = svc.orders.cancel(id, reason).await {
                    warn!("close {}: cancel of {} failed: {}", symbol, id, err);
                }
            }
        }
    }

    let net = pos.current_qty;
    if net == 0 {
        // Nothing filled yet; no flattening order needed.
        svc.positions.close(pos.position_id, reason).await;
        return true;
    }

    let close = svc
        .orders
        .create_order(OrderSpec::market(symbol, pos.side.opposite(), net));
    // The flattening order classifies as protective so its fill reduces the
    // net and completes the close.
    svc.positions
        .attach_order(pos.position_id, OrderRole::Target, close.order_id);

    info!(
        "close {}: MARKET {} {} ({}) (order {})",
        symbol,
        pos.side.opposite().as_str(),
        net,
        reason,
        close.order_id,
    );
    match svc.orders.submit(close.order_id).await {
        Ok(()) => true,
        Err(err) => {
            warn!("close {}: submit failed: {}", symbol, err);
            false
        }
    }
}

async fn wait_for_flat(svc: &Services, symbol: &str, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if svc.trades.active(symbol).is_none() && svc.positions.get_by_symbol(symbol).is_none() {
            return true;
        }
        sleep(REVERSAL_POLL).await;
    }
    false
}

// ─────────────────────────────────────────────────────────
// Cooldown reset
// ─────────────────────────────────────────────────────────

/// Stop-outs release the symbol's rules for immediate re-entry; target hits
/// keep the cooldown running. Invoked by the fill manager on full stop
/// fills.
pub struct CooldownResetManager {
    engine: Arc<RuleEngine>,
}

impl CooldownResetManager {
    pub fn new(engine: Arc<RuleEngine>) -> Self {
        Self { engine }
    }

    pub fn reset_symbol(&self, symbol: &str) {
        let reset = self.engine.reset_cooldown_for_symbol(symbol);
        if reset > 0 {
            info!("cooldown reset for {} ({} rule(s)) after stop-out", symbol, reset);
        }
    }
}
