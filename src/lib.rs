// Library crate - exports shared types and the breakout engine

pub mod types;
pub mod error;
pub mod config;
pub mod trading_core;

// Re-export commonly used types
pub use types::*;
pub use config::{BreakoutConfig, FilterToggles};
pub use error::{ConfigError, DataError};
pub use trading_core::{StrategyEngine, StrategyEvent};
