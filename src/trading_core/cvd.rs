//! Volume-delta imbalance confirmation for weak breakouts
//!
//! Runs one instance per breakout attempt, fed every closed candle while the
//! attempt is in WEAK_TRACKING or PULLBACK_RETEST.
//!
//! - Path 1 (aggressive): a strong imbalance spike followed immediately by a
//!   same-direction confirmation candle with volume, still beyond the pivot.
//! - Path 2 (patient): any run of consecutive same-direction imbalances
//!   anywhere in a bounded history.
//!
//! A candle whose imbalance disagrees with its own color only clears the
//! pending spike; it is recorded as a neutral sample so it breaks runs.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::candles::Candle;
use super::classifier::CandleMetrics;
use crate::config::BreakoutConfig;
use crate::types::{EntryPath, Side};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct PendingSpike {
    candle_index: u64,
    imbalance_pct: f64,
}

/// A CVD path that wants to submit a signal to the filter chain
#[derive(Debug, Clone, PartialEq)]
pub struct CvdCandidate {
    pub path: EntryPath,
    pub reason: String,
}

/// What one candle did to the CVD tracker
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CvdUpdate {
    /// Raw imbalance, positive = bearish
    pub imbalance_pct: f64,
    pub color_conflict: bool,
    pub spike_marked: bool,
    /// Set when a pending spike was not confirmed by this candle
    pub spike_failed: Option<String>,
    pub candidate: Option<CvdCandidate>,
}

/// Find the first run of `run_len` consecutive values >= `threshold`.
///
/// Every window is examined, not only the newest one. Returns the start
/// position of the matching window.
pub fn find_sustained_run(values: &[f64], threshold: f64, run_len: usize) -> Option<usize> {
    if run_len == 0 || values.len() < run_len {
        return None;
    }
    values
        .windows(run_len)
        .position(|w| w.iter().all(|&v| v >= threshold))
}

#[derive(Debug, Clone)]
pub struct CvdTracker {
    side: Side,
    pending_spike: Option<PendingSpike>,
    /// Imbalance in the trade's favour (positive = with the trade), newest last
    history: VecDeque<f64>,
    capacity: usize,
    /// Samples recorded since the attempt began, evicted ones included
    recorded: u64,
    /// Sample number closing the last Path 2 window handed out
    candidate_end: Option<u64>,
    /// Path 2 windows ending at or before this sample were already rejected
    rejected_through: Option<u64>,
}

impl CvdTracker {
    pub fn new(side: Side, capacity: usize) -> Self {
        Self {
            side,
            pending_spike: None,
            history: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            recorded: 0,
            candidate_end: None,
            rejected_through: None,
        }
    }

    pub fn history(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }

    pub fn has_pending_spike(&self) -> bool {
        self.pending_spike.is_some()
    }

    /// The last Path 2 window was rejected downstream. History is kept; only
    /// that window is skipped by later scans.
    pub fn reject_candidate(&mut self) {
        if let Some(end) = self.candidate_end.take() {
            self.rejected_through = Some(end);
        }
    }

    /// Imbalance re-signed so that positive favours the trade
    fn directional(&self, imbalance_pct: f64) -> f64 {
        match self.side {
            Side::Long => -imbalance_pct,
            Side::Short => imbalance_pct,
        }
    }

    fn record(&mut self, value: f64) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(value);
        self.recorded += 1;
    }

    /// First qualifying Path 2 window that was not already rejected, as
    /// (start position in history, sample number of its last entry)
    fn find_fresh_run(&self, history: &[f64], config: &BreakoutConfig) -> Option<(usize, u64)> {
        let run_len = config.sustained_imbalance_candles;
        let base = self.recorded - history.len() as u64;
        let min_start = match self.rejected_through {
            Some(end) => ((end + 2).saturating_sub(base + run_len as u64) as usize).min(history.len()),
            None => 0,
        };
        let start = find_sustained_run(&history[min_start..], config.sustained_imbalance_threshold, run_len)?
            + min_start;
        Some((start, base + (start + run_len) as u64 - 1))
    }

    pub fn on_candle(
        &mut self,
        candle: &Candle,
        metrics: &CandleMetrics,
        beyond_pivot: bool,
        config: &BreakoutConfig,
    ) -> CvdUpdate {
        self.candidate_end = None;
        let imbalance_pct = candle.imbalance_pct();
        let mut update = CvdUpdate {
            imbalance_pct,
            ..Default::default()
        };

        let conflict = (imbalance_pct < 0.0 && candle.is_bearish())
            || (imbalance_pct > 0.0 && candle.is_bullish());
        if conflict {
            update.color_conflict = true;
            if self.pending_spike.take().is_some() {
                update.spike_failed = Some("candle color conflicts with imbalance".to_string());
            }
            self.record(0.0);
            return update;
        }

        let directional = self.directional(imbalance_pct);

        if let Some(spike) = self.pending_spike.take() {
            let confirmed = directional >= config.confirmation_imbalance_threshold
                && metrics.volume_ratio >= config.cvd_volume_threshold
                && beyond_pivot;
            if confirmed {
                update.candidate = Some(CvdCandidate {
                    path: EntryPath::CvdAggressive,
                    reason: format!(
                        "imbalance spike {:.1}% (candle {}) confirmed by {:.1}% at volume ratio {:.2}",
                        spike.imbalance_pct, spike.candle_index, imbalance_pct, metrics.volume_ratio
                    ),
                });
            } else {
                update.spike_failed = Some(format!(
                    "confirmation failed: imbalance {:.1}%, volume ratio {:.2}, beyond pivot {}",
                    imbalance_pct, metrics.volume_ratio, beyond_pivot
                ));
            }
        }

        self.record(directional);

        if update.candidate.is_none() {
            let history = self.history();
            if let Some((start, end)) = self.find_fresh_run(&history, config) {
                self.candidate_end = Some(end);
                let run = &history[start..start + config.sustained_imbalance_candles];
                update.candidate = Some(CvdCandidate {
                    path: EntryPath::CvdSustained,
                    reason: format!(
                        "{} consecutive imbalances >= {:.1}% in trade direction: {:?}",
                        run.len(),
                        config.sustained_imbalance_threshold,
                        run
                    ),
                });
            }
        }

        if update.candidate.is_none() && directional >= config.strong_imbalance_threshold {
            self.pending_spike = Some(PendingSpike {
                candle_index: candle.index,
                imbalance_pct,
            });
            update.spike_marked = true;
        }

        update
    }
}
