//! Configuration: per-ticker trading parameters and process settings.
//!
//! Every knob has a default and an environment override; bad values are
//! fatal at startup, never tolerated at runtime.

use std::env;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::ConfigError;

// ─────────────────────────────────────────────────────────
// Per-ticker config
// ─────────────────────────────────────────────────────────

fn default_allocation() -> f64 {
    10_000.0
}
fn default_stop_mult() -> f64 {
    6.0
}
fn default_target_mult() -> f64 {
    3.0
}
fn default_cooldown_minutes() -> u64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct TickerConfig {
    pub symbol: String,
    /// Required; signals below this confidence are ignored.
    pub confidence_threshold: f64,
    /// Above 1000 this is a dollar allocation, otherwise a share count.
    #[serde(default = "default_allocation")]
    pub allocation: f64,
    #[serde(default = "default_stop_mult")]
    pub atr_stop_multiplier: f64,
    #[serde(default = "default_target_mult")]
    pub atr_target_multiplier: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
}

impl TickerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "symbol".into(),
                value: self.symbol.clone(),
                reason: "empty ticker".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid {
                key: format!("{}.confidence_threshold", self.symbol),
                value: self.confidence_threshold.to_string(),
                reason: "must be within [0, 1]".into(),
            });
        }
        if self.allocation <= 0.0 {
            return Err(ConfigError::Invalid {
                key: format!("{}.allocation", self.symbol),
                value: self.allocation.to_string(),
                reason: "must be positive".into(),
            });
        }
        if self.atr_stop_multiplier <= 0.0 || self.atr_target_multiplier <= 0.0 {
            return Err(ConfigError::Invalid {
                key: format!("{}.atr_multipliers", self.symbol),
                value: format!(
                    "{}/{}",
                    self.atr_stop_multiplier, self.atr_target_multiplier
                ),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// The deployment default: eight liquid tickers, conservative thresholds.
pub fn default_basket() -> Vec<TickerConfig> {
    let mk = |symbol: &str, threshold: f64| TickerConfig {
        symbol: symbol.into(),
        confidence_threshold: threshold,
        allocation: default_allocation(),
        atr_stop_multiplier: default_stop_mult(),
        atr_target_multiplier: default_target_mult(),
        cooldown_minutes: default_cooldown_minutes(),
    };
    vec![
        mk("AAPL", 0.80),
        mk("MSFT", 0.80),
        mk("NVDA", 0.85),
        mk("TSLA", 0.85),
        mk("AMZN", 0.80),
        mk("META", 0.80),
        mk("GOOG", 0.80),
        mk("TQQQ", 0.75),
    ]
}

/// Parse a basket from its JSON document and validate every entry.
pub fn basket_from_json(raw: &str) -> Result<Vec<TickerConfig>, ConfigError> {
    let basket: Vec<TickerConfig> =
        serde_json::from_str(raw).map_err(|err| ConfigError::Invalid {
            key: "basket".into(),
            value: raw.chars().take(80).collect(),
            reason: err.to_string(),
        })?;
    if basket.is_empty() {
        return Err(ConfigError::Invalid {
            key: "basket".into(),
            value: "[]".into(),
            reason: "at least one ticker required".into(),
        });
    }
    for ticker in &basket {
        ticker.validate()?;
    }
    Ok(basket)
}

// ─────────────────────────────────────────────────────────
// Process settings
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Settings {
    pub tws_host: String,
    pub tws_port: u16,
    pub tws_client_id: i32,
    pub tws_account: Option<String>,
    pub signal_base_url: Option<String>,
    pub signal_api_key: Option<SecretString>,
    pub signal_poll_interval: Duration,
    pub eval_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            tws_host: env::var("TWS_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            tws_port: parse_env("TWS_PORT", 7497)?,
            tws_client_id: parse_env("TWS_CLIENT_ID", 1)?,
            tws_account: env::var("TWS_ACCOUNT").ok().filter(|s| !s.is_empty()),
            signal_base_url: env::var("SIGNAL_API_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            signal_api_key: env::var("SIGNAL_API_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            signal_poll_interval: Duration::from_millis(parse_env(
                "SIGNAL_POLL_INTERVAL_MS",
                5_000u64,
            )?),
            eval_interval: Duration::from_millis(parse_env("RULE_EVAL_INTERVAL_MS", 1_000u64)?),
        })
    }

    /// The signal feed is only usable with both a base URL and an API key.
    pub fn signal_feed(&self) -> Option<(&str, &SecretString)> {
        match (&self.signal_base_url, &self.signal_api_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key)),
            _ => None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key: key.into(),
            value: raw,
            reason: "not parseable".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_basket_is_valid() {
        let basket = default_basket();
        assert_eq!(basket.len(), 8);
        for ticker in &basket {
            ticker.validate().unwrap();
        }
    }

    #[test]
    fn test_ticker_validation() {
        let mut t = default_basket().remove(0);
        t.confidence_threshold = 1.2;
        assert!(t.validate().is_err());

        let mut t = default_basket().remove(0);
        t.allocation = 0.0;
        assert!(t.validate().is_err());

        let mut t = default_basket().remove(0);
        t.symbol = "".into();
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_basket_from_json() {
        let raw = r#"[
            {"symbol": "AAPL", "confidence_threshold": 0.8},
            {"symbol": "TQQQ", "confidence_threshold": 0.75, "allocation": 5000,
             "atr_stop_multiplier": 4.0, "atr_target_multiplier": 2.0, "cooldown_minutes": 5}
        ]"#;
        let basket = basket_from_json(raw).unwrap();
        assert_eq!(basket.len(), 2);
        assert!((basket[0].allocation - 10_000.0).abs() < 1e-9);
        assert!((basket[1].atr_stop_multiplier - 4.0).abs() < 1e-9);
        assert_eq!(basket[1].cooldown_minutes, 5);
    }

    #[test]
    fn test_basket_rejects_bad_entries() {
        assert!(basket_from_json("[]").is_err());
        assert!(basket_from_json("not json").is_err());
        let raw = r#"[{"symbol": "AAPL", "confidence_threshold": 2.0}]"#;
        assert!(basket_from_json(raw).is_err());
    }
}
