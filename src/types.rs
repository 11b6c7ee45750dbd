//! Shared value types handed between the engine and its collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single print from the tick stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: u64,
}

impl Tick {
    pub fn new(timestamp: DateTime<Utc>, price: f64, volume: u64) -> Self {
        Self { timestamp, price, volume }
    }
}

/// Trade direction of a breakout attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short. Multiply a price move by this to get the
    /// move "in the trade's favour".
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Scanner output for one symbol, loaded once per session and never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotLevel {
    /// Upward cross of this level starts a long attempt
    #[serde(default)]
    pub resistance: Option<f64>,
    /// Downward cross of this level starts a short attempt
    #[serde(default)]
    pub support: Option<f64>,
    /// Upside profit targets (used by long attempts)
    #[serde(default)]
    pub targets: Vec<f64>,
    /// Downside profit targets (used by short attempts)
    #[serde(default)]
    pub downside_targets: Vec<f64>,
    #[serde(default)]
    pub score: f64,
}

impl PivotLevel {
    /// Pivots must be finite and support must sit below resistance, so a
    /// single bar can never cross both.
    pub fn check(&self) -> Result<(), String> {
        for (name, level) in [("resistance", self.resistance), ("support", self.support)] {
            if let Some(value) = level {
                if !value.is_finite() || value <= 0.0 {
                    return Err(format!("{} must be a positive finite price, got {}", name, value));
                }
            }
        }
        if let (Some(resistance), Some(support)) = (self.resistance, self.support) {
            if support >= resistance {
                return Err(format!("support {} is not below resistance {}", support, resistance));
            }
        }
        Ok(())
    }

    pub fn pivot_for(&self, side: Side) -> Option<f64> {
        match side {
            Side::Long => self.resistance,
            Side::Short => self.support,
        }
    }

    /// First target the price has not yet passed in the direction of `side`.
    ///
    /// Targets are scanned nearest-first, so targets the price already cleared
    /// are skipped rather than picked as "nearest".
    pub fn next_unreached_target(&self, side: Side, price: f64) -> Option<f64> {
        match side {
            Side::Long => {
                let mut ups: Vec<f64> = self.targets.iter().copied().filter(|t| t.is_finite()).collect();
                ups.sort_by(|a, b| a.total_cmp(b));
                ups.into_iter().find(|&t| t > price)
            }
            Side::Short => {
                let mut downs: Vec<f64> = self
                    .downside_targets
                    .iter()
                    .copied()
                    .filter(|t| t.is_finite())
                    .collect();
                downs.sort_by(|a, b| b.total_cmp(a));
                downs.into_iter().find(|&t| t < price)
            }
        }
    }
}

/// First-candle classification of a breakout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Momentum,
    Weak,
}

/// Which confirmation path produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryPath {
    Momentum,
    PullbackRetest,
    SustainedBreak,
    CvdAggressive,
    CvdSustained,
}

impl std::fmt::Display for EntryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryPath::Momentum => write!(f, "MOMENTUM"),
            EntryPath::PullbackRetest => write!(f, "PULLBACK_RETEST"),
            EntryPath::SustainedBreak => write!(f, "SUSTAINED_BREAK"),
            EntryPath::CvdAggressive => write!(f, "CVD_AGGRESSIVE"),
            EntryPath::CvdSustained => write!(f, "CVD_SUSTAINED"),
        }
    }
}

/// The only artifact handed to the execution layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignal {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub entry_path: EntryPath,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}
