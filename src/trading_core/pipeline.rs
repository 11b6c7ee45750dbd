//! Per-symbol processing and the multi-symbol engine
//!
//! A `SymbolPipeline` owns everything one symbol needs: bar aggregation, the
//! candle series and the confirmation state machine. The `StrategyEngine`
//! keeps one pipeline per symbol and isolates them: bad input or a fault in
//! one symbol is reported and that symbol is reset, the rest keep running.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{info, warn};

use super::bars::{Bar, BarAggregator};
use super::candles::{CandleSeries, CandleTracker};
use super::classifier::CandleMetrics;
use super::events::{MachineState, StrategyEvent};
use super::htf::{HigherTimeframeSource, HtfCache, HtfSeries};
use super::state_machine::{BreakoutStateMachine, MarketView};
use crate::config::BreakoutConfig;
use crate::error::{ConfigError, DataError};
use crate::types::{PivotLevel, Tick};

/// One unit of market input for one symbol
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Tick { symbol: String, tick: Tick },
    Bar { symbol: String, bar: Bar },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Tick { symbol, .. } | MarketEvent::Bar { symbol, .. } => symbol,
        }
    }
}

/// Candle history kept for volume baselines and ATR
fn candle_history_len(config: &BreakoutConfig) -> usize {
    config.volume_lookback_candles.max(config.atr_period + 1) + 1
}

pub struct SymbolPipeline {
    config: BreakoutConfig,
    aggregator: BarAggregator,
    candle_tracker: CandleTracker,
    candles: CandleSeries,
    machine: BreakoutStateMachine,
    first_bar: Option<DateTime<Utc>>,
}

impl SymbolPipeline {
    pub fn new(symbol: &str, levels: PivotLevel, config: BreakoutConfig) -> Self {
        Self {
            aggregator: BarAggregator::new(config.bar_duration(), config.buffer_capacity()),
            candle_tracker: CandleTracker::new(config.bar_duration(), config.candle_duration()),
            candles: CandleSeries::new(candle_history_len(&config)),
            machine: BreakoutStateMachine::new(symbol, levels, config.clone()),
            first_bar: None,
            config,
        }
    }

    pub fn machine(&self) -> &BreakoutStateMachine {
        &self.machine
    }

    pub fn aggregator(&self) -> &BarAggregator {
        &self.aggregator
    }

    pub fn candles(&self) -> &CandleSeries {
        &self.candles
    }

    /// Live path: a tick may close the previous bar
    pub fn on_tick(&mut self, tick: &Tick, htf: Option<&HtfSeries>) -> Result<Vec<StrategyEvent>, DataError> {
        match self.aggregator.push_tick(tick)? {
            Some(bar) => Ok(self.process_bar(bar, htf)),
            None => Ok(Vec::new()),
        }
    }

    /// Replay path: a pre-formed bar
    pub fn on_bar(&mut self, bar: Bar, htf: Option<&HtfSeries>) -> Result<Vec<StrategyEvent>, DataError> {
        let bar = self.aggregator.push_bar(bar)?;
        Ok(self.process_bar(bar, htf))
    }

    /// Close the open bar if its bucket has elapsed at `now`
    pub fn flush(&mut self, now: DateTime<Utc>, htf: Option<&HtfSeries>) -> Vec<StrategyEvent> {
        match self.aggregator.flush(now) {
            Some(bar) => self.process_bar(bar, htf),
            None => Vec::new(),
        }
    }

    pub fn reset(&mut self, reason: &str) -> Option<StrategyEvent> {
        self.machine.force_reset(reason)
    }

    fn warmed_up(&self, bar: &Bar) -> bool {
        match self.first_bar {
            Some(first) => bar.start_time + self.config.bar_duration() - first >= self.config.warmup(),
            None => false,
        }
    }

    fn process_bar(&mut self, bar: Bar, htf: Option<&HtfSeries>) -> Vec<StrategyEvent> {
        let mut events = Vec::new();
        if let Some(candle) = self.candle_tracker.close_before(bar.start_time) {
            self.close_candle(candle, htf, &mut events);
        }

        self.first_bar.get_or_insert(bar.start_time);
        let warmed_up = self.warmed_up(&bar);
        events.extend(self.machine.on_bar(&bar, warmed_up));

        if let Some(candle) = self.candle_tracker.add_bar(&bar) {
            self.close_candle(candle, htf, &mut events);
        }
        events
    }

    fn close_candle(
        &mut self,
        candle: super::candles::Candle,
        htf: Option<&HtfSeries>,
        events: &mut Vec<StrategyEvent>,
    ) {
        let metrics = CandleMetrics::compute(&candle, &self.candles, self.config.volume_lookback_candles);
        self.candles.push(candle.clone());
        let view = MarketView {
            bars: self.aggregator.buffer(),
            candles: &self.candles,
            htf,
        };
        events.extend(self.machine.on_candle(&candle, &metrics, &view));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// All symbols of a session, keyed by symbol
pub struct StrategyEngine {
    config: BreakoutConfig,
    pipelines: BTreeMap<String, SymbolPipeline>,
    htf: HtfCache,
}

impl StrategyEngine {
    pub fn new(config: BreakoutConfig, levels: BTreeMap<String, PivotLevel>) -> Result<Self, ConfigError> {
        config.validate()?;
        for (symbol, level) in &levels {
            level.check().map_err(|reason| ConfigError::Levels {
                symbol: symbol.clone(),
                reason,
            })?;
        }
        let pipelines = levels
            .into_iter()
            .map(|(symbol, level)| {
                let pipeline = SymbolPipeline::new(&symbol, level, config.clone());
                (symbol, pipeline)
            })
            .collect();
        let htf = HtfCache::new(
            Duration::minutes(config.htf_minutes),
            Duration::minutes(config.htf_refresh_minutes),
        );
        Ok(Self { config, pipelines, htf })
    }

    pub fn config(&self) -> &BreakoutConfig {
        &self.config
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(|s| s.as_str())
    }

    pub fn pipeline(&self, symbol: &str) -> Option<&SymbolPipeline> {
        self.pipelines.get(symbol)
    }

    pub fn state(&self, symbol: &str) -> Option<MachineState> {
        self.pipelines.get(symbol).map(|p| p.machine().state())
    }

    /// Refresh cached higher-timeframe bars that are due. Call outside the
    /// per-event path (once per driver cycle).
    pub fn refresh_htf(&mut self, now: DateTime<Utc>, source: &dyn HigherTimeframeSource) {
        if !self.config.filters.htf_momentum {
            return;
        }
        for symbol in self.pipelines.keys() {
            self.htf.refresh_if_due(symbol, now, source);
        }
    }

    /// Route one market event to its symbol
    pub fn ingest(&mut self, event: MarketEvent) -> Vec<StrategyEvent> {
        match event {
            MarketEvent::Tick { symbol, tick } => {
                self.run_isolated(&symbol, |pipeline, htf| pipeline.on_tick(&tick, htf))
            }
            MarketEvent::Bar { symbol, bar } => {
                self.run_isolated(&symbol, move |pipeline, htf| pipeline.on_bar(bar, htf))
            }
        }
    }

    /// Timer-driven bar close for every symbol (live mode)
    pub fn flush_all(&mut self, now: DateTime<Utc>) -> Vec<StrategyEvent> {
        let symbols: Vec<String> = self.pipelines.keys().cloned().collect();
        let mut events = Vec::new();
        for symbol in symbols {
            events.extend(self.run_isolated(&symbol, |pipeline, htf| Ok(pipeline.flush(now, htf))));
        }
        events
    }

    /// End of session: abandon every live attempt
    pub fn teardown(&mut self) -> Vec<StrategyEvent> {
        let mut events = Vec::new();
        for pipeline in self.pipelines.values_mut() {
            if let Some(event) = pipeline.reset("session teardown") {
                event.log();
                events.push(event);
            }
        }
        info!("Engine teardown: {} symbols", self.pipelines.len());
        events
    }

    fn run_isolated<F>(&mut self, symbol: &str, f: F) -> Vec<StrategyEvent>
    where
        F: FnOnce(&mut SymbolPipeline, Option<&HtfSeries>) -> Result<Vec<StrategyEvent>, DataError>,
    {
        let Some(pipeline) = self.pipelines.get_mut(symbol) else {
            warn!("Ignoring data for unknown symbol {}", symbol);
            return Vec::new();
        };
        let htf = self.htf.get(symbol);

        let events = match catch_unwind(AssertUnwindSafe(|| f(pipeline, htf))) {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => vec![StrategyEvent::DataDropped {
                symbol: symbol.to_string(),
                code: e.code().to_string(),
                detail: e.to_string(),
            }],
            Err(payload) => {
                let state = pipeline.machine().state();
                let mut events = vec![StrategyEvent::SymbolFault {
                    symbol: symbol.to_string(),
                    state,
                    index: pipeline.aggregator().buffer().tip(),
                    error: panic_message(payload.as_ref()),
                }];
                events.extend(pipeline.reset("fault recovery"));
                events
            }
        };
        for event in &events {
            event.log();
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::filters::FilterKind;
    use crate::trading_core::testkit::{levels, minute, quiet, ts, unfiltered_config};
    use crate::types::{EntryPath, Side};

    fn engine(config: BreakoutConfig) -> StrategyEngine {
        let mut scanner = BTreeMap::new();
        scanner.insert("AAA".to_string(), levels(100.0, 90.0));
        scanner.insert("BBB".to_string(), levels(50.0, 45.0));
        StrategyEngine::new(config, scanner).unwrap()
    }

    fn engine_with(config: BreakoutConfig, symbol: &str, level: PivotLevel) -> StrategyEngine {
        let mut scanner = BTreeMap::new();
        scanner.insert(symbol.to_string(), level);
        StrategyEngine::new(config, scanner).unwrap()
    }

    /// Levels at 100/90 whose only upside target is 101, so room-to-target
    /// rejects anything above 99.5
    fn near_target() -> PivotLevel {
        let mut level = levels(100.0, 90.0);
        level.targets = vec![101.0];
        level
    }

    /// Minute drifting from `open` to `near` whose last bar jumps to `close`,
    /// so the pivot is crossed on the candle's final bar
    fn gap_minute(m: i64, open: f64, near: f64, close: f64, volume: u64) -> Vec<Bar> {
        let mut bars = minute(m, open, near, volume, 50);
        if let Some(last) = bars.last_mut() {
            last.close = close;
            last.high = last.high.max(close);
            last.low = last.low.min(close);
        }
        bars
    }

    fn filter_outcomes(events: &[StrategyEvent]) -> Vec<(EntryPath, FilterKind, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                StrategyEvent::Filter { path, filter, passed, .. } => Some((*path, *filter, *passed)),
                _ => None,
            })
            .collect()
    }

    fn notes_starting(events: &[StrategyEvent], prefix: &str) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, StrategyEvent::Note { message, .. } if message.starts_with(prefix)))
            .count()
    }

    fn feed(engine: &mut StrategyEngine, symbol: &str, bars: Vec<Bar>) -> Vec<StrategyEvent> {
        bars.into_iter()
            .flat_map(|bar| engine.ingest(MarketEvent::Bar { symbol: symbol.to_string(), bar }))
            .collect()
    }

    fn signals(events: &[StrategyEvent]) -> Vec<EntryPath> {
        events.iter().filter_map(|e| e.as_signal()).map(|s| s.entry_path).collect()
    }

    fn warm(engine: &mut StrategyEngine, symbol: &str, price: f64) -> Vec<StrategyEvent> {
        (0..20).flat_map(|m| feed(engine, symbol, quiet(m, price, 1_200))).collect()
    }

    #[test]
    fn test_pullback_retest_scenario() {
        let mut config = unfiltered_config();
        config.filters.room_to_target = true;
        let mut engine = engine(config);
        let mut events = warm(&mut engine, "AAA", 99.8);
        // weak breakout: volume 0.8x, closes 100.50
        events.extend(feed(&mut engine, "AAA", minute(20, 99.8, 100.5, 960, 50)));
        assert_eq!(engine.state("AAA"), Some(MachineState::WeakTracking));
        // pulls back to 100.20
        events.extend(feed(&mut engine, "AAA", minute(21, 100.5, 100.2, 1_200, 50)));
        assert_eq!(engine.state("AAA"), Some(MachineState::PullbackRetest));
        // closes 100.45 on 2.1x volume with a 0.4% body; also momentum-sized,
        // but the retest confirmation wins
        events.extend(feed(&mut engine, "AAA", minute(22, 100.05, 100.45, 2_520, 60)));

        assert_eq!(signals(&events), vec![EntryPath::PullbackRetest]);
        let signal = events.iter().find_map(|e| e.as_signal()).unwrap();
        assert_eq!(signal.price, 100.45);
        assert_eq!(signal.timestamp, ts(23 * 60));
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
    }

    #[test]
    fn test_weak_breakout_confirmed_by_sustained_imbalance() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", minute(20, 99.8, 100.5, 1_200, 50)));
        // three small up candles well clear of the pullback zone, 60% buying
        events.extend(feed(&mut engine, "AAA", minute(21, 100.5, 100.55, 1_200, 60)));
        events.extend(feed(&mut engine, "AAA", minute(22, 100.55, 100.6, 1_200, 60)));
        assert!(signals(&events).is_empty());
        events.extend(feed(&mut engine, "AAA", minute(23, 100.6, 100.65, 1_200, 60)));
        assert_eq!(signals(&events), vec![EntryPath::CvdSustained]);
    }

    #[test]
    fn test_stale_attempt_resets_without_signal() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", minute(20, 99.8, 100.5, 1_200, 50)));
        events.extend(feed(&mut engine, "AAA", minute(21, 100.5, 100.2, 1_200, 50)));
        // drift just above the pivot with no volume for over 30 minutes
        for m in 22..54 {
            events.extend(feed(&mut engine, "AAA", quiet(m, 100.1, 1_200)));
        }
        assert!(signals(&events).is_empty());
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
        let stale = events.iter().any(|e| {
            matches!(e, StrategyEvent::Transition { reason, .. } if reason.starts_with("stale"))
        });
        assert!(stale);

        // a later fresh crossing starts a new, unrelated attempt
        events.extend(feed(&mut engine, "AAA", quiet(54, 99.8, 1_200)));
        let fresh = feed(&mut engine, "AAA", minute(55, 99.8, 100.5, 1_200, 50));
        assert!(matches!(
            &fresh[0],
            StrategyEvent::Transition { attempt: 2, from: MachineState::Monitoring, to: MachineState::BreakoutDetected, .. }
        ));
        let state = engine.pipeline("AAA").unwrap().machine().active().unwrap();
        assert!(!state.cvd.has_pending_spike());
        assert_eq!(state.candles_tracked, 1);
    }

    #[test]
    fn test_no_second_signal_without_fresh_cross() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", minute(20, 99.8, 100.4, 3_600, 70)));
        assert_eq!(signals(&events), vec![EntryPath::Momentum]);
        // another strong candle above the pivot is not a new breakout
        events.extend(feed(&mut engine, "AAA", minute(21, 100.4, 101.0, 4_800, 70)));
        assert_eq!(signals(&events).len(), 1);
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
    }

    #[test]
    fn test_symbols_are_isolated() {
        let mut engine = engine(unfiltered_config());
        warm(&mut engine, "AAA", 99.8);
        warm(&mut engine, "BBB", 49.9);
        // the fourth bar of the minute closes above the pivot
        engine.ingest(MarketEvent::Bar { symbol: "AAA".to_string(), bar: minute(20, 99.8, 100.5, 1_200, 50).remove(3) });

        // a regressing bar for BBB is dropped and reported
        let mut stale_bar = quiet(0, 49.9, 1_200).remove(0);
        stale_bar.start_time = ts(0);
        let events = engine.ingest(MarketEvent::Bar { symbol: "BBB".to_string(), bar: stale_bar });
        assert!(matches!(&events[..], [StrategyEvent::DataDropped { code, .. }] if code == "OUT_OF_ORDER"));

        // a non-finite price is dropped too, AAA state untouched
        let mut nan_bar = quiet(20, 49.9, 1_200).remove(0);
        nan_bar.close = f64::NAN;
        let events = engine.ingest(MarketEvent::Bar { symbol: "BBB".to_string(), bar: nan_bar });
        assert!(matches!(&events[..], [StrategyEvent::DataDropped { code, .. }] if code == "NON_FINITE"));
        assert_eq!(engine.state("AAA"), Some(MachineState::BreakoutDetected));
        assert_eq!(engine.state("BBB"), Some(MachineState::Monitoring));

        assert!(engine.ingest(MarketEvent::Bar { symbol: "ZZZ".to_string(), bar: quiet(0, 1.0, 12).remove(0) }).is_empty());
    }

    #[test]
    fn test_fault_in_one_symbol_resets_only_that_symbol() {
        let mut engine = engine(unfiltered_config());
        warm(&mut engine, "AAA", 99.8);
        warm(&mut engine, "BBB", 49.9);
        feed(&mut engine, "AAA", minute(20, 99.8, 100.5, 1_200, 50));
        feed(&mut engine, "BBB", minute(20, 49.9, 50.25, 1_200, 50));
        assert_eq!(engine.state("BBB"), Some(MachineState::WeakTracking));

        let events = engine.run_isolated("AAA", |_, _| panic!("corrupt state"));
        assert!(matches!(&events[0], StrategyEvent::SymbolFault { error, state: MachineState::WeakTracking, .. } if error == "corrupt state"));
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
        assert_eq!(engine.state("BBB"), Some(MachineState::WeakTracking));
    }

    #[test]
    fn test_warmup_blocks_early_crossing() {
        let mut engine = engine(unfiltered_config());
        // first minute already crosses the pivot; 100s warm-up has not passed
        let events = feed(&mut engine, "AAA", minute(0, 99.0, 101.0, 1_200, 50));
        assert!(events.is_empty());
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
    }

    #[test]
    fn test_teardown_abandons_live_attempts() {
        let mut engine = engine(unfiltered_config());
        warm(&mut engine, "AAA", 99.8);
        feed(&mut engine, "AAA", minute(20, 99.8, 100.5, 1_200, 50));
        let events = engine.teardown();
        assert_eq!(events.len(), 1);
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
    }

    #[test]
    fn test_rejected_retest_keeps_waiting_in_pullback() {
        let mut config = unfiltered_config();
        config.filters.room_to_target = true;
        let mut engine = engine_with(config, "AAA", near_target());
        warm(&mut engine, "AAA", 99.8);
        feed(&mut engine, "AAA", minute(20, 99.8, 100.5, 960, 50));
        feed(&mut engine, "AAA", minute(21, 100.5, 100.2, 1_200, 50));
        assert_eq!(engine.state("AAA"), Some(MachineState::PullbackRetest));

        // qualifies as retest and as momentum; only one filter run, no reset
        let events = feed(&mut engine, "AAA", minute(22, 100.05, 100.45, 2_520, 60));
        assert!(signals(&events).is_empty());
        assert_eq!(
            filter_outcomes(&events),
            vec![(EntryPath::PullbackRetest, FilterKind::RoomToTarget, false)]
        );
        assert_eq!(engine.state("AAA"), Some(MachineState::PullbackRetest));
        assert_eq!(engine.pipeline("AAA").unwrap().machine().active().unwrap().attempt, 1);
    }

    #[test]
    fn test_sustained_hold_signals_after_window() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", gap_minute(20, 99.8, 99.9, 100.5, 1_200)));
        assert_eq!(engine.state("AAA"), Some(MachineState::WeakTracking));

        // breakout bar closed at 21:00; the 5 minute hold ends with minute 25
        for m in 21..25 {
            events.extend(feed(&mut engine, "AAA", minute(m, 100.5, 100.5, 1_200, 50)));
        }
        assert!(signals(&events).is_empty());
        events.extend(feed(&mut engine, "AAA", minute(25, 100.5, 100.5, 1_200, 50)));

        assert_eq!(signals(&events), vec![EntryPath::SustainedBreak]);
        let signal = events.iter().find_map(|e| e.as_signal()).unwrap();
        assert_eq!(signal.timestamp, ts(26 * 60));
        assert_eq!(signal.price, 100.5);
    }

    #[test]
    fn test_sustained_hold_needs_volume() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", gap_minute(20, 99.8, 99.9, 100.5, 1_200)));
        for m in 21..28 {
            events.extend(feed(&mut engine, "AAA", minute(m, 100.5, 100.5, 600, 50)));
        }
        assert!(signals(&events).is_empty());
        assert_eq!(engine.state("AAA"), Some(MachineState::WeakTracking));
        assert_eq!(notes_starting(&events, "sustained hold not met"), 1);
    }

    #[test]
    fn test_rejected_sustained_hold_keeps_tracking() {
        let mut config = unfiltered_config();
        config.filters.room_to_target = true;
        let mut engine = engine_with(config, "AAA", near_target());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", gap_minute(20, 99.8, 99.9, 100.5, 1_200)));
        for m in 21..27 {
            events.extend(feed(&mut engine, "AAA", minute(m, 100.5, 100.5, 1_200, 50)));
        }
        assert!(signals(&events).is_empty());
        assert_eq!(engine.state("AAA"), Some(MachineState::WeakTracking));
        // minutes 25 and 26 each submit once
        assert_eq!(
            filter_outcomes(&events),
            vec![(EntryPath::SustainedBreak, FilterKind::RoomToTarget, false); 2]
        );
    }

    #[test]
    fn test_imbalance_spike_confirms_weak_breakout() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", gap_minute(20, 99.8, 99.9, 100.5, 1_200)));
        // 75% buying marks a spike
        events.extend(feed(&mut engine, "AAA", minute(21, 100.5, 100.55, 1_200, 75)));
        assert!(engine.pipeline("AAA").unwrap().machine().active().unwrap().cvd.has_pending_spike());
        // 60% buying on 1.5x volume confirms it
        events.extend(feed(&mut engine, "AAA", minute(22, 100.55, 100.6, 1_800, 60)));

        assert_eq!(signals(&events), vec![EntryPath::CvdAggressive]);
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
    }

    #[test]
    fn test_rejected_imbalance_run_keeps_history() {
        let mut config = unfiltered_config();
        config.filters.room_to_target = true;
        let mut engine = engine_with(config, "AAA", near_target());
        warm(&mut engine, "AAA", 99.8);
        feed(&mut engine, "AAA", minute(20, 99.8, 100.5, 1_200, 50));
        feed(&mut engine, "AAA", minute(21, 100.5, 100.55, 1_200, 60));
        feed(&mut engine, "AAA", minute(22, 100.55, 100.6, 1_200, 60));
        let events = feed(&mut engine, "AAA", minute(23, 100.6, 100.65, 1_200, 60));

        assert_eq!(
            filter_outcomes(&events),
            vec![(EntryPath::CvdSustained, FilterKind::RoomToTarget, false)]
        );
        assert_eq!(engine.state("AAA"), Some(MachineState::WeakTracking));
        let history = |engine: &StrategyEngine| {
            engine.pipeline("AAA").unwrap().machine().active().unwrap().cvd.history()
        };
        assert_eq!(history(&engine), vec![20.0, 20.0, 20.0]);

        // the next imbalance candle forms a new window and is submitted once
        let events = feed(&mut engine, "AAA", minute(24, 100.65, 100.7, 1_200, 60));
        assert_eq!(
            filter_outcomes(&events),
            vec![(EntryPath::CvdSustained, FilterKind::RoomToTarget, false)]
        );
        assert_eq!(history(&engine), vec![20.0, 20.0, 20.0, 20.0]);
    }

    #[test]
    fn test_short_momentum_breakout() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "BBB", 45.2);
        // 3x volume, 0.66% red body through support at 45
        events.extend(feed(&mut engine, "BBB", minute(20, 45.2, 44.9, 3_600, 30)));

        assert_eq!(signals(&events), vec![EntryPath::Momentum]);
        let signal = events.iter().find_map(|e| e.as_signal()).unwrap();
        assert_eq!(signal.side, Side::Short);
        assert_eq!(signal.price, 44.9);
        assert_eq!(engine.state("BBB"), Some(MachineState::Monitoring));
    }

    #[test]
    fn test_stale_weak_tracking_resets_with_partial_imbalance_runs() {
        let mut engine = engine(unfiltered_config());
        let mut events = warm(&mut engine, "AAA", 99.8);
        events.extend(feed(&mut engine, "AAA", gap_minute(20, 99.8, 99.9, 100.5, 1_200)));
        // thin volume holds above the pivot; imbalance runs never reach three
        for m in 21..52 {
            let buy_pct = if m % 3 == 0 { 50 } else { 60 };
            events.extend(feed(&mut engine, "AAA", minute(m, 100.5, 100.5, 600, buy_pct)));
        }

        assert!(signals(&events).is_empty());
        assert!(filter_outcomes(&events).is_empty());
        assert_eq!(engine.state("AAA"), Some(MachineState::Monitoring));
        let stale = events.iter().any(|e| {
            matches!(e, StrategyEvent::Transition { from: MachineState::WeakTracking, reason, .. } if reason.starts_with("stale"))
        });
        assert!(stale);
    }

    #[test]
    fn test_inverted_levels_fail_at_startup() {
        let mut scanner = BTreeMap::new();
        scanner.insert("AAA".to_string(), levels(95.0, 100.0));
        let result = StrategyEngine::new(unfiltered_config(), scanner);
        assert!(matches!(result, Err(ConfigError::Levels { symbol, .. }) if symbol == "AAA"));
    }
}
