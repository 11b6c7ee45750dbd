//! Breakout confirmation state machine
//!
//! One machine per symbol, with at most one attempt in flight:
//! 1. MONITORING - wait for a close that crosses a pivot
//! 2. BREAKOUT_DETECTED - classify the breakout on the next candle close
//! 3. WEAK_TRACKING - wait for delayed momentum, a sustained hold, CVD
//!    confirmation, or a pullback toward the pivot
//! 4. PULLBACK_RETEST - wait for a volume candle closing back beyond the pivot
//!
//! Bars drive detection, invalidation and staleness. Candles drive every
//! confirmation decision. An attempt ends on a signal, invalidation or
//! staleness, and the machine drops back to MONITORING; a new attempt needs a
//! fresh crossing.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::bars::{Bar, BarBuffer};
use super::candles::{Candle, CandleSeries};
use super::classifier::{beyond_pivot_pct, detect_crossing, CandleMetrics, Crossing};
use super::cvd::CvdTracker;
use super::events::{MachineState, StrategyEvent};
use super::filters::{FilterContext, QualityFilterChain};
use super::htf::HtfSeries;
use crate::config::BreakoutConfig;
use crate::error::DataError;
use crate::types::{Classification, EntryPath, EntrySignal, PivotLevel, Side};

/// Read-only market data the machine consults when a candle closes
pub struct MarketView<'a> {
    pub bars: &'a BarBuffer,
    pub candles: &'a CandleSeries,
    pub htf: Option<&'a HtfSeries>,
}

/// Live breakout attempt
#[derive(Debug, Clone)]
pub struct BreakoutState {
    /// Monotonic per-symbol attempt number
    pub attempt: u64,
    pub state: MachineState,
    pub side: Side,
    pub pivot: f64,
    /// Absolute index of the bar that crossed the pivot
    pub breakout_index: u64,
    pub breakout_price: f64,
    /// Close time of the breakout bar
    pub breakout_time: DateTime<Utc>,
    pub classification: Option<Classification>,
    pub pullback_time: Option<DateTime<Utc>>,
    /// A bar after the breakout reached the pullback zone
    pub hold_breached: bool,
    /// Candles seen since the breakout (classification candle included)
    pub candles_tracked: u32,
    pub volume_ratio_sum: f64,
    sustained_reported: bool,
    pub cvd: CvdTracker,
}

impl BreakoutState {
    pub fn avg_volume_ratio(&self) -> f64 {
        if self.candles_tracked == 0 {
            return 0.0;
        }
        self.volume_ratio_sum / self.candles_tracked as f64
    }

    /// The breakout bar, while it is still retained
    pub fn breakout_bar<'a>(&self, bars: &'a BarBuffer) -> Result<&'a Bar, DataError> {
        bars.get(self.breakout_index)
    }
}

fn candle_metrics_map(candle: &Candle, metrics: &CandleMetrics) -> BTreeMap<String, f64> {
    [
        ("close", candle.close),
        ("volume_ratio", metrics.volume_ratio),
        ("candle_size_pct", metrics.candle_size_pct),
        ("imbalance_pct", candle.imbalance_pct()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn transition(
    symbol: &str,
    state: &BreakoutState,
    to: MachineState,
    timestamp: DateTime<Utc>,
    reason: String,
    metrics: BTreeMap<String, f64>,
) -> StrategyEvent {
    StrategyEvent::Transition {
        symbol: symbol.to_string(),
        timestamp,
        attempt: state.attempt,
        side: state.side,
        from: state.state,
        to,
        reason,
        metrics,
    }
}

fn note(symbol: &str, state: &BreakoutState, timestamp: DateTime<Utc>, message: String) -> StrategyEvent {
    StrategyEvent::Note {
        symbol: symbol.to_string(),
        timestamp,
        attempt: state.attempt,
        state: state.state,
        message,
    }
}

/// Candle body moves in the trade's direction
fn moves_with(side: Side, candle: &Candle) -> bool {
    match side {
        Side::Long => candle.is_bullish(),
        Side::Short => candle.is_bearish(),
    }
}

pub struct BreakoutStateMachine {
    symbol: String,
    levels: PivotLevel,
    config: BreakoutConfig,
    active: Option<BreakoutState>,
    attempts: u64,
    prev_close: Option<f64>,
    last_time: Option<DateTime<Utc>>,
}

impl BreakoutStateMachine {
    pub fn new(symbol: &str, levels: PivotLevel, config: BreakoutConfig) -> Self {
        Self {
            symbol: symbol.to_string(),
            levels,
            config,
            active: None,
            attempts: 0,
            prev_close: None,
            last_time: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn levels(&self) -> &PivotLevel {
        &self.levels
    }

    pub fn state(&self) -> MachineState {
        self.active.as_ref().map_or(MachineState::Monitoring, |s| s.state)
    }

    pub fn active(&self) -> Option<&BreakoutState> {
        self.active.as_ref()
    }

    /// Process a closed bar: pivot crossings, invalidation, staleness and
    /// pullback detection
    pub fn on_bar(&mut self, bar: &Bar, warmed_up: bool) -> Vec<StrategyEvent> {
        let now = bar.start_time + self.config.bar_duration();
        let prev_close = self.prev_close.replace(bar.close);
        self.last_time = Some(now);
        let mut events = Vec::new();

        if self.active.is_none() {
            if !warmed_up {
                return events;
            }
            if let Some(crossing) = prev_close.and_then(|prev| detect_crossing(&self.levels, prev, bar.close)) {
                events.push(self.begin_attempt(crossing, bar, now));
            }
            return events;
        }

        let Some(state) = self.active.as_mut() else {
            return events;
        };

        if now - state.breakout_time > self.config.staleness_bound() {
            let reason = format!(
                "stale: no confirmation within {}m of breakout",
                self.config.max_retest_staleness_minutes
            );
            events.extend(self.end_attempt(now, reason));
            return events;
        }

        if beyond_pivot_pct(state.side, state.pivot, bar.close) < -self.config.invalidation_tolerance_pct {
            let reason = format!("invalidated: close {:.2} back through pivot {:.2}", bar.close, state.pivot);
            events.extend(self.end_attempt(now, reason));
            return events;
        }

        if bar.index == state.breakout_index {
            return events;
        }

        let extreme = match state.side {
            Side::Long => bar.low,
            Side::Short => bar.high,
        };
        if beyond_pivot_pct(state.side, state.pivot, extreme) <= self.config.pullback_distance_pct {
            state.hold_breached = true;
            if state.state == MachineState::WeakTracking {
                let reason = format!(
                    "pullback to {:.2}, within {:.2}% of pivot {:.2}",
                    extreme, self.config.pullback_distance_pct, state.pivot
                );
                events.push(transition(
                    &self.symbol,
                    state,
                    MachineState::PullbackRetest,
                    now,
                    reason,
                    BTreeMap::new(),
                ));
                state.state = MachineState::PullbackRetest;
                state.pullback_time = Some(now);
            }
        }

        events
    }

    /// Process a closed candle. `metrics` are measured against the candles
    /// preceding this one.
    pub fn on_candle(
        &mut self,
        candle: &Candle,
        metrics: &CandleMetrics,
        view: &MarketView<'_>,
    ) -> Vec<StrategyEvent> {
        let mut events = Vec::new();
        match self.state() {
            MachineState::Monitoring => {}
            MachineState::BreakoutDetected => self.classify_breakout(candle, metrics, view, &mut events),
            MachineState::WeakTracking | MachineState::PullbackRetest => {
                self.track_confirmation(candle, metrics, view, &mut events)
            }
        }
        events
    }

    /// Abandon any attempt without a signal (fault recovery, session end)
    pub fn force_reset(&mut self, reason: &str) -> Option<StrategyEvent> {
        let now = self.last_time?;
        self.end_attempt(now, reason.to_string())
    }

    fn begin_attempt(&mut self, crossing: Crossing, bar: &Bar, now: DateTime<Utc>) -> StrategyEvent {
        self.attempts += 1;
        let state = BreakoutState {
            attempt: self.attempts,
            state: MachineState::Monitoring,
            side: crossing.side,
            pivot: crossing.pivot,
            breakout_index: bar.index,
            breakout_price: bar.close,
            breakout_time: now,
            classification: None,
            pullback_time: None,
            hold_breached: false,
            candles_tracked: 0,
            volume_ratio_sum: 0.0,
            sustained_reported: false,
            cvd: CvdTracker::new(crossing.side, self.config.imbalance_history_len),
        };
        let reason = format!("close {:.2} crossed pivot {:.2}", bar.close, crossing.pivot);
        let metrics = [("price", bar.close), ("pivot", crossing.pivot)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let event = transition(&self.symbol, &state, MachineState::BreakoutDetected, now, reason, metrics);
        self.active = Some(BreakoutState {
            state: MachineState::BreakoutDetected,
            ..state
        });
        event
    }

    fn end_attempt(&mut self, now: DateTime<Utc>, reason: String) -> Option<StrategyEvent> {
        let state = self.active.take()?;
        Some(transition(&self.symbol, &state, MachineState::Monitoring, now, reason, BTreeMap::new()))
    }

    /// Run the filter chain for `path`; on a pass emit the signal and end the
    /// attempt. Returns whether a signal went out.
    fn try_signal(
        &mut self,
        path: EntryPath,
        candle: &Candle,
        view: &MarketView<'_>,
        reason: String,
        events: &mut Vec<StrategyEvent>,
    ) -> bool {
        let Some(state) = self.active.as_ref() else {
            return false;
        };
        let ctx = FilterContext {
            side: state.side,
            price: candle.close,
            now: candle.end_time,
            levels: &self.levels,
            bars: view.bars,
            candles: view.candles,
            htf: view.htf,
        };
        let verdict = QualityFilterChain::new(&self.config).evaluate(&ctx);
        for outcome in verdict.outcomes.iter() {
            events.push(StrategyEvent::Filter {
                symbol: self.symbol.clone(),
                timestamp: candle.end_time,
                attempt: state.attempt,
                path,
                filter: outcome.filter,
                passed: outcome.passed,
                reason: outcome.reason.clone(),
            });
        }
        if !verdict.passed() {
            return false;
        }

        let attempt = state.attempt;
        let signal = EntrySignal {
            symbol: self.symbol.clone(),
            side: state.side,
            price: candle.close,
            entry_path: path,
            timestamp: candle.end_time,
            reason,
        };
        events.push(StrategyEvent::Signal { attempt, signal });
        events.extend(self.end_attempt(candle.end_time, format!("signal emitted via {}", path)));
        true
    }

    fn classify_breakout(
        &mut self,
        candle: &Candle,
        metrics: &CandleMetrics,
        view: &MarketView<'_>,
        events: &mut Vec<StrategyEvent>,
    ) {
        let classification = metrics.classify(&self.config);
        let Some(state) = self.active.as_mut() else {
            return;
        };
        state.classification = Some(classification);
        state.candles_tracked = 1;
        state.volume_ratio_sum = metrics.volume_ratio;
        let now = candle.end_time;

        match classification {
            Classification::Momentum => {
                let reason = format!(
                    "momentum breakout: volume {:.2}x, candle {:.2}%",
                    metrics.volume_ratio, metrics.candle_size_pct
                );
                if !self.try_signal(EntryPath::Momentum, candle, view, reason, events) {
                    events.extend(self.end_attempt(now, "momentum breakout rejected by filters".to_string()));
                }
            }
            Classification::Weak => {
                let reason = format!(
                    "weak breakout: volume {:.2}x, candle {:.2}%",
                    metrics.volume_ratio, metrics.candle_size_pct
                );
                events.push(transition(
                    &self.symbol,
                    state,
                    MachineState::WeakTracking,
                    now,
                    reason,
                    candle_metrics_map(candle, metrics),
                ));
                state.state = MachineState::WeakTracking;
            }
        }
    }

    /// WEAK_TRACKING and PULLBACK_RETEST.
    ///
    /// At most one candidate per candle goes to the filter chain, picked in
    /// order: retest confirmation, delayed momentum, sustained hold, CVD. The
    /// CVD tracker sees every candle whichever path is picked. Only a
    /// rejected delayed momentum ends the attempt.
    fn track_confirmation(
        &mut self,
        candle: &Candle,
        metrics: &CandleMetrics,
        view: &MarketView<'_>,
        events: &mut Vec<StrategyEvent>,
    ) {
        let now = candle.end_time;
        let Some(state) = self.active.as_mut() else {
            return;
        };
        state.candles_tracked += 1;
        state.volume_ratio_sum += metrics.volume_ratio;
        let beyond = beyond_pivot_pct(state.side, state.pivot, candle.close);
        let with_trade = moves_with(state.side, candle);
        let mut candidate: Option<(EntryPath, String)> = None;

        if state.state == MachineState::PullbackRetest
            && beyond > self.config.retest_confirm_buffer_pct
            && with_trade
            && metrics.volume_ratio >= self.config.pullback_volume_threshold
            && metrics.candle_size_pct >= self.config.pullback_candle_min_pct
        {
            let reason = format!(
                "retest confirmed: close {:.2} beyond pivot {:.2}, volume {:.2}x, candle {:.2}%",
                candle.close, state.pivot, metrics.volume_ratio, metrics.candle_size_pct
            );
            candidate = Some((EntryPath::PullbackRetest, reason));
        } else if metrics.is_momentum(&self.config) && beyond > 0.0 && with_trade {
            let reason = format!(
                "delayed momentum: volume {:.2}x, candle {:.2}%",
                metrics.volume_ratio, metrics.candle_size_pct
            );
            candidate = Some((EntryPath::Momentum, reason));
        } else if state.state == MachineState::WeakTracking
            && now - state.breakout_time >= self.config.sustained_window()
        {
            let avg_ratio = state.avg_volume_ratio();
            if !state.hold_breached && beyond > 0.0 && avg_ratio >= self.config.sustained_min_volume_ratio {
                let reason = format!(
                    "held beyond pivot {:.2} for {}m, avg volume {:.2}x",
                    state.pivot, self.config.sustained_break_minutes, avg_ratio
                );
                candidate = Some((EntryPath::SustainedBreak, reason));
            } else if !state.sustained_reported {
                state.sustained_reported = true;
                let message = format!(
                    "sustained hold not met: breached {}, avg volume {:.2}x",
                    state.hold_breached, avg_ratio
                );
                events.push(note(&self.symbol, state, now, message));
            }
        }

        let update = state.cvd.on_candle(candle, metrics, beyond > 0.0, &self.config);
        if update.color_conflict {
            let message = format!("imbalance {:.1}% conflicts with candle color", update.imbalance_pct);
            events.push(note(&self.symbol, state, now, message));
        }
        if let Some(failed) = update.spike_failed {
            events.push(note(&self.symbol, state, now, format!("CVD spike dropped: {}", failed)));
        }
        if update.spike_marked {
            let message = format!("CVD spike marked at imbalance {:.1}%", update.imbalance_pct);
            events.push(note(&self.symbol, state, now, message));
        }
        if let Some(cvd) = update.candidate {
            match candidate.as_ref().map(|(path, _)| *path) {
                None => candidate = Some((cvd.path, cvd.reason)),
                Some(path) => {
                    let message = format!("{} candidate deferred to {}", cvd.path, path);
                    events.push(note(&self.symbol, state, now, message));
                }
            }
        }

        let Some((path, reason)) = candidate else {
            return;
        };
        if self.try_signal(path, candle, view, reason, events) {
            return;
        }
        match path {
            EntryPath::Momentum => {
                events.extend(self.end_attempt(now, "delayed momentum rejected by filters".to_string()));
            }
            EntryPath::CvdSustained => {
                if let Some(state) = self.active.as_mut() {
                    state.cvd.reject_candidate();
                }
            }
            _ => {}
        }
    }
}
