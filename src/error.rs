//! Typed errors at the library boundary

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Bad or unusable market data. Logged, the event is dropped, processing continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("bar index {requested} is out of window (oldest retained {oldest}, tip {tip:?})")]
    OutOfWindow {
        requested: u64,
        oldest: u64,
        tip: Option<u64>,
    },

    #[error("out-of-order event at {got} (last accepted {last})")]
    OutOfOrder {
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },

    #[error("non-finite value in {field}")]
    NonFinite { field: &'static str },
}

impl DataError {
    /// Short code used in event logs
    pub fn code(&self) -> &'static str {
        match self {
            DataError::OutOfWindow { .. } => "OUT_OF_WINDOW",
            DataError::OutOfOrder { .. } => "OUT_OF_ORDER",
            DataError::NonFinite { .. } => "NON_FINITE",
        }
    }
}

/// Startup-only configuration failure. Trading never starts after one.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid pivot levels for {symbol}: {reason}")]
    Levels { symbol: String, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}
