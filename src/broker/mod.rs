//! Broker-facing interface.
//!
//! The wire protocol (TWS/Gateway TCP framing) lives outside this crate; the
//! core consumes [`BrokerClient`] for outbound operations and a stream of
//! [`BrokerPush`] messages for everything the broker pushes back. A reader
//! task ([`spawn_reader`]) translates pushes into order-manager callbacks and
//! bus events, playing the role of the background reader thread that
//! deserializes inbound traffic.

pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::bus::EventBus;
use crate::engine::events::{Event, EventPayload, PriceTick, SystemError};
use crate::engine::order::{Order, OrderSide, OrderStatus, OrderType, Tif};
use crate::engine::order_manager::OrderManager;
use crate::errors::BrokerError;

// ─────────────────────────────────────────────────────────
// Outbound types
// ─────────────────────────────────────────────────────────

/// One order as handed to the broker.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    /// Non-positive means the broker assigns the id.
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tif: Tif,
    pub parent_order_id: Option<i64>,
    pub account: Option<String>,
    /// TWS rejects orders with this left at its default via a poorly
    /// documented error; it must be sent as an explicit false.
    pub exchange_only: bool,
}

impl OrderTicket {
    pub fn from_order(order: &Order, account: Option<String>) -> Self {
        Self {
            order_id: order.order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            order_type: order.order_type,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            tif: order.tif,
            parent_order_id: order.parent_order_id,
            account,
            exchange_only: false,
        }
    }
}

/// One historical bar (OHLCV).
#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

// ─────────────────────────────────────────────────────────
// Client trait
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit an order. Returns the definitive order id (the caller's, or a
    /// broker-assigned one when the ticket carried a non-positive id).
    async fn submit_order(&self, ticket: OrderTicket) -> Result<i64, BrokerError>;

    async fn cancel_order(&self, order_id: i64) -> Result<(), BrokerError>;

    /// Start streaming ticks for a symbol. Returns the request id used to
    /// stop the stream again.
    async fn subscribe_market_data(&self, symbol: &str) -> Result<i64, BrokerError>;

    async fn unsubscribe_market_data(&self, req_id: i64) -> Result<(), BrokerError>;

    /// Fetch the trailing `duration_secs` of history in `bar_secs` bars.
    async fn request_historical_bars(
        &self,
        symbol: &str,
        duration_secs: u64,
        bar_secs: u64,
    ) -> Result<Vec<Bar>, BrokerError>;
}

// ─────────────────────────────────────────────────────────
// Status mapping
// ─────────────────────────────────────────────────────────

/// Broker status vocabulary → internal status. Unknown strings map to `None`
/// and are ignored upstream (protocol-violation policy).
pub fn map_broker_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "PendingSubmit" => Some(OrderStatus::PendingSubmit),
        "PreSubmitted" | "ApiPending" => Some(OrderStatus::Accepted),
        "Submitted" => Some(OrderStatus::Submitted),
        "Filled" => Some(OrderStatus::Filled),
        "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
        "ApiCancelled" | "Cancelled" => Some(OrderStatus::Cancelled),
        "PendingCancel" => Some(OrderStatus::PendingCancel),
        "Inactive" => Some(OrderStatus::Inactive),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────
// Push stream
// ─────────────────────────────────────────────────────────

/// Everything the broker pushes at us, already deserialized.
#[derive(Debug, Clone)]
pub enum BrokerPush {
    Status {
        order_id: i64,
        status: String,
        filled: u32,
        remaining: u32,
        avg_fill_price: f64,
    },
    Execution {
        order_id: i64,
        exec_id: String,
        shares: u32,
        price: f64,
        cum_qty: u32,
        commission: Option<f64>,
    },
    Commission {
        exec_id: String,
        commission: f64,
    },
    Tick(PriceTick),
    /// Accounts this session manages (sent once after connect).
    ManagedAccounts(Vec<String>),
    Connected,
    Disconnected,
    Error {
        code: i32,
        msg: String,
    },
}

/// Drain the broker push stream: order callbacks go to the [`OrderManager`],
/// everything else becomes a bus event. Runs until the channel closes.
pub fn spawn_reader(
    mut rx: mpsc::UnboundedReceiver<BrokerPush>,
    orders: Arc<OrderManager>,
    bus: Arc<EventBus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("broker reader started");
        while let Some(push) = rx.recv().await {
            match push {
                BrokerPush::Status {
                    order_id,
                    status,
                    filled,
                    remaining,
                    avg_fill_price,
                } => {
                    orders
                        .on_status(order_id, &status, filled, remaining, avg_fill_price)
                        .await;
                }
                BrokerPush::Execution {
                    order_id,
                    exec_id,
                    shares,
                    price,
                    cum_qty,
                    commission,
                } => {
                    orders
                        .on_execution(order_id, &exec_id, shares, price, cum_qty, commission)
                        .await;
                }
                BrokerPush::Commission { exec_id, commission } => {
                    orders.on_commission(&exec_id, commission);
                }
                BrokerPush::Tick(tick) => {
                    bus.emit(Event::new("broker", EventPayload::Price(tick))).await;
                }
                BrokerPush::ManagedAccounts(accounts) => {
                    info!("managed accounts: {}", accounts.join(","));
                }
                BrokerPush::Connected => {
                    bus.emit(Event::new("broker", EventPayload::Connected)).await;
                }
                BrokerPush::Disconnected => {
                    warn!("broker connection lost");
                    bus.emit(Event::new("broker", EventPayload::Disconnected)).await;
                }
                BrokerPush::Error { code, msg } => {
                    warn!("broker error {}: {}", code, msg);
                    bus.emit(Event::new(
                        "broker",
                        EventPayload::Error(SystemError { code, msg }),
                    ))
                    .await;
                }
            }
        }
        info!("broker reader stopped (stream closed)");
    })
}
