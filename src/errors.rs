//! Error taxonomy for the trading core.
//!
//! Broker failures are classified by retryability: the fill-manager op queue
//! retries transient errors with bounded attempts, everything above the
//! operation layer surfaces failures as a failed action and lets the next
//! rule evaluation re-trigger.

use thiserror::Error;

/// Errors surfaced by a [`crate::broker::BrokerClient`] implementation.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The operation did not complete within its bounded timeout.
    #[error("broker operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The TCP session is down. Retryable once the connection is restored.
    #[error("broker disconnected")]
    Disconnected,

    /// Retryable broker-side condition (pacing violation, connectivity
    /// restored with data loss, transient farm outage).
    #[error("transient broker error {code}: {message}")]
    Transient { code: i32, message: String },

    /// Terminal order-level reject (permissions, invalid contract, margin).
    #[error("order rejected ({code}): {message}")]
    Rejected { code: i32, message: String },

    /// The broker reported an order-id conflict or duplicate subscription.
    /// Surfaced to the caller but tolerated by the core.
    #[error("duplicate request: {0}")]
    Duplicate(String),

    /// Anything the adapter could not classify.
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether the operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_) | BrokerError::Disconnected | BrokerError::Transient { .. }
        )
    }
}

/// Configuration problems. Fatal at startup, never tolerated at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {key}: {value} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown ticker {0} referenced by configuration")]
    UnknownTicker(String),
}
