//! Strategy configuration
//!
//! Every threshold the engine reads lives here with its default. Values are
//! validated once at startup; a session never begins with an undefined or
//! nonsensical threshold.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Enable flags for the quality filter chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterToggles {
    pub choppiness: bool,
    pub room_to_target: bool,
    pub htf_momentum: bool,
    pub order_flow: bool,
}

impl Default for FilterToggles {
    fn default() -> Self {
        Self {
            choppiness: true,
            room_to_target: true,
            htf_momentum: true,
            order_flow: true,
        }
    }
}

/// Configuration for breakout detection and confirmation.
///
/// Percent-valued fields are in percent units (0.3 means 0.3%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakoutConfig {
    /// Bar duration in seconds (default: 5)
    pub bar_seconds: i64,
    /// Bars per confirmation candle (default: 12 = 1 minute)
    pub bars_per_candle: usize,
    /// Ring buffer span in minutes (default: 10)
    pub buffer_minutes: i64,
    /// Data time before entry checks run (default: 100s)
    pub warmup_seconds: i64,
    /// Candles in the volume-ratio baseline (default: 20)
    pub volume_lookback_candles: usize,

    pub momentum_volume_threshold: f64,
    pub momentum_candle_min_pct: f64,

    pub pullback_distance_pct: f64,
    pub pullback_volume_threshold: f64,
    pub pullback_candle_min_pct: f64,
    /// Retest candle must close this far beyond the pivot (0 = just beyond)
    pub retest_confirm_buffer_pct: f64,
    /// Close this far back through the pivot kills the attempt
    pub invalidation_tolerance_pct: f64,

    pub sustained_break_minutes: i64,
    pub sustained_min_volume_ratio: f64,
    pub max_retest_staleness_minutes: i64,

    pub strong_imbalance_threshold: f64,
    pub confirmation_imbalance_threshold: f64,
    pub sustained_imbalance_threshold: f64,
    pub sustained_imbalance_candles: usize,
    pub imbalance_history_len: usize,
    pub cvd_volume_threshold: f64,

    pub choppy_atr_multiplier: f64,
    pub choppy_lookback_minutes: i64,
    pub atr_period: usize,
    pub min_room_to_target_pct: f64,
    pub htf_minutes: i64,
    pub htf_rsi_period: usize,
    pub htf_overbought: f64,
    pub htf_oversold: f64,
    pub htf_refresh_minutes: i64,
    pub order_flow_minutes: i64,

    pub filters: FilterToggles,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            bar_seconds: 5,
            bars_per_candle: 12,
            buffer_minutes: 10,
            warmup_seconds: 100,
            volume_lookback_candles: 20,
            momentum_volume_threshold: 2.0,
            momentum_candle_min_pct: 0.3,
            pullback_distance_pct: 0.3,
            pullback_volume_threshold: 2.0,
            pullback_candle_min_pct: 0.2,
            retest_confirm_buffer_pct: 0.0,
            invalidation_tolerance_pct: 0.2,
            sustained_break_minutes: 5,
            sustained_min_volume_ratio: 1.0,
            max_retest_staleness_minutes: 30,
            strong_imbalance_threshold: 20.0,
            confirmation_imbalance_threshold: 10.0,
            sustained_imbalance_threshold: 10.0,
            sustained_imbalance_candles: 3,
            imbalance_history_len: 10,
            cvd_volume_threshold: 1.2,
            choppy_atr_multiplier: 0.5,
            choppy_lookback_minutes: 5,
            atr_period: 20,
            min_room_to_target_pct: 1.5,
            htf_minutes: 60,
            htf_rsi_period: 14,
            htf_overbought: 70.0,
            htf_oversold: 30.0,
            htf_refresh_minutes: 60,
            order_flow_minutes: 5,
            filters: FilterToggles::default(),
        }
    }
}

impl BreakoutConfig {
    /// Load from a JSON file (missing fields take defaults) and validate
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BreakoutConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.into() }
        }

        let positive_ints: [(&'static str, i64); 8] = [
            ("bar_seconds", self.bar_seconds),
            ("buffer_minutes", self.buffer_minutes),
            ("sustained_break_minutes", self.sustained_break_minutes),
            ("max_retest_staleness_minutes", self.max_retest_staleness_minutes),
            ("choppy_lookback_minutes", self.choppy_lookback_minutes),
            ("htf_minutes", self.htf_minutes),
            ("htf_refresh_minutes", self.htf_refresh_minutes),
            ("order_flow_minutes", self.order_flow_minutes),
        ];
        for (field, value) in positive_ints {
            if value <= 0 {
                return Err(invalid(field, format!("must be > 0, got {}", value)));
            }
        }
        if self.warmup_seconds < 0 {
            return Err(invalid("warmup_seconds", "must be >= 0"));
        }

        let counts: [(&'static str, usize); 6] = [
            ("bars_per_candle", self.bars_per_candle),
            ("volume_lookback_candles", self.volume_lookback_candles),
            ("sustained_imbalance_candles", self.sustained_imbalance_candles),
            ("imbalance_history_len", self.imbalance_history_len),
            ("atr_period", self.atr_period),
            ("htf_rsi_period", self.htf_rsi_period),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(invalid(field, "must be >= 1"));
            }
        }
        if self.imbalance_history_len < self.sustained_imbalance_candles {
            return Err(invalid(
                "imbalance_history_len",
                "must hold at least sustained_imbalance_candles entries",
            ));
        }

        let thresholds: [(&'static str, f64); 15] = [
            ("momentum_volume_threshold", self.momentum_volume_threshold),
            ("momentum_candle_min_pct", self.momentum_candle_min_pct),
            ("pullback_distance_pct", self.pullback_distance_pct),
            ("pullback_volume_threshold", self.pullback_volume_threshold),
            ("pullback_candle_min_pct", self.pullback_candle_min_pct),
            ("retest_confirm_buffer_pct", self.retest_confirm_buffer_pct),
            ("invalidation_tolerance_pct", self.invalidation_tolerance_pct),
            ("sustained_min_volume_ratio", self.sustained_min_volume_ratio),
            ("strong_imbalance_threshold", self.strong_imbalance_threshold),
            ("confirmation_imbalance_threshold", self.confirmation_imbalance_threshold),
            ("sustained_imbalance_threshold", self.sustained_imbalance_threshold),
            ("cvd_volume_threshold", self.cvd_volume_threshold),
            ("choppy_atr_multiplier", self.choppy_atr_multiplier),
            ("min_room_to_target_pct", self.min_room_to_target_pct),
            ("htf_overbought", self.htf_overbought),
        ];
        for (field, value) in thresholds {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("must be finite and >= 0, got {}", value)));
            }
        }
        if !self.htf_oversold.is_finite()
            || self.htf_oversold < 0.0
            || self.htf_oversold >= self.htf_overbought
            || self.htf_overbought > 100.0
        {
            return Err(invalid(
                "htf_oversold",
                "oscillator bounds must satisfy 0 <= oversold < overbought <= 100",
            ));
        }

        let candle_seconds = self.bar_seconds * self.bars_per_candle as i64;
        if 60 % candle_seconds != 0 && candle_seconds % 60 != 0 {
            return Err(invalid(
                "bars_per_candle",
                format!("candle of {}s does not align to minute boundaries", candle_seconds),
            ));
        }
        if self.buffer_capacity() < self.bars_per_candle {
            return Err(invalid("buffer_minutes", "ring buffer shorter than one candle"));
        }
        if self.choppy_lookback_minutes > self.buffer_minutes
            || self.order_flow_minutes > self.buffer_minutes
        {
            return Err(invalid(
                "buffer_minutes",
                "filter lookback windows must fit inside the ring buffer",
            ));
        }

        Ok(())
    }

    pub fn bar_duration(&self) -> Duration {
        Duration::seconds(self.bar_seconds)
    }

    pub fn candle_duration(&self) -> Duration {
        Duration::seconds(self.bar_seconds * self.bars_per_candle as i64)
    }

    /// Number of bars retained by the ring buffer
    pub fn buffer_capacity(&self) -> usize {
        ((self.buffer_minutes * 60) / self.bar_seconds).max(1) as usize
    }

    pub fn warmup(&self) -> Duration {
        Duration::seconds(self.warmup_seconds)
    }

    pub fn sustained_window(&self) -> Duration {
        Duration::minutes(self.sustained_break_minutes)
    }

    pub fn staleness_bound(&self) -> Duration {
        Duration::minutes(self.max_retest_staleness_minutes)
    }
}
