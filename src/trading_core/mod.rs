//! Trading Core - breakout detection and confirmation shared by replay and live
//!
//! This module contains the strategy components:
//! - Bar aggregation from ticks into an indexed ring buffer
//! - Candle derivation and volume/size classification
//! - Volume-delta imbalance (CVD) confirmation
//! - Quality filter chain
//! - Per-symbol confirmation state machine
//! - Multi-symbol engine plus replay and live drivers

pub mod bars;
pub mod candles;
pub mod indicators;
pub mod classifier;
pub mod cvd;
pub mod htf;
pub mod filters;
pub mod events;
pub mod state_machine;
pub mod pipeline;
pub mod drivers;
pub mod data;

#[cfg(test)]
pub(crate) mod testkit;

// Re-export commonly used types
pub use bars::{Bar, BarAggregator, BarBuffer};
pub use candles::{Candle, CandleSeries, CandleTracker};
pub use classifier::{CandleMetrics, Crossing};
pub use cvd::{CvdTracker, CvdUpdate};
pub use htf::{HigherTimeframeSource, HtfCache, InMemoryHtfSource};
pub use filters::{FilterKind, FilterOutcome, QualityFilterChain};
pub use events::{EventLog, EventSummary, MachineState, StrategyEvent};
pub use state_machine::{BreakoutState, BreakoutStateMachine};
pub use pipeline::{MarketEvent, StrategyEngine, SymbolPipeline};
pub use drivers::{LiveClock, LiveDriver, ReplayDriver};
