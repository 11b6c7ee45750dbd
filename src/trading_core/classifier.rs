//! Breakout detection and first-candle classification

use serde::{Deserialize, Serialize};

use super::candles::{Candle, CandleSeries};
use crate::config::BreakoutConfig;
use crate::types::{Classification, PivotLevel, Side};

/// Volume and body measurements of a candle relative to recent history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleMetrics {
    /// candle volume / mean volume of the preceding candles
    pub volume_ratio: f64,
    /// |close - open| / open, percent
    pub candle_size_pct: f64,
}

impl CandleMetrics {
    /// Measure `candle` against `history`, which must not yet contain it
    pub fn compute(candle: &Candle, history: &CandleSeries, lookback: usize) -> Self {
        let volume_ratio = match history.volume_baseline(lookback) {
            Some(baseline) if baseline > 0.0 => candle.volume as f64 / baseline,
            _ => 0.0,
        };
        Self {
            volume_ratio,
            candle_size_pct: candle.body_pct(),
        }
    }

    pub fn is_momentum(&self, config: &BreakoutConfig) -> bool {
        self.volume_ratio >= config.momentum_volume_threshold
            && self.candle_size_pct >= config.momentum_candle_min_pct
    }

    pub fn classify(&self, config: &BreakoutConfig) -> Classification {
        if self.is_momentum(config) {
            Classification::Momentum
        } else {
            Classification::Weak
        }
    }
}

/// A pivot crossing between two consecutive closes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub side: Side,
    pub pivot: f64,
}

/// Long on an upward cross of resistance, short on a downward cross of support.
///
/// Resistance is checked first. With support below resistance (enforced when
/// the engine loads its levels) one close-to-close move cannot cross both.
pub fn detect_crossing(levels: &PivotLevel, prev_close: f64, close: f64) -> Option<Crossing> {
    if let Some(resistance) = levels.resistance {
        if prev_close <= resistance && close > resistance {
            return Some(Crossing { side: Side::Long, pivot: resistance });
        }
    }
    if let Some(support) = levels.support {
        if prev_close >= support && close < support {
            return Some(Crossing { side: Side::Short, pivot: support });
        }
    }
    None
}

/// Signed distance of `price` beyond `pivot` in the trade direction, percent
pub fn beyond_pivot_pct(side: Side, pivot: f64, price: f64) -> f64 {
    if pivot == 0.0 {
        return 0.0;
    }
    side.sign() * (price - pivot) / pivot * 100.0
}
