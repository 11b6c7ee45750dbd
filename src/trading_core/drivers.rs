//! Replay and live drivers
//!
//! Both drivers feed the same `StrategyEngine`; they differ only in where the
//! bars come from. Replay hands pre-formed bars over in (start time, symbol)
//! order. Live aggregates ticks as they arrive and closes quiet bars on a
//! timer.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::bars::Bar;
use super::events::{EventLog, StrategyEvent};
use super::htf::HigherTimeframeSource;
use super::pipeline::{MarketEvent, StrategyEngine};
use crate::types::EntrySignal;

pub struct ReplayDriver {
    bars: Vec<(String, Bar)>,
}

impl ReplayDriver {
    /// Merge per-symbol bar series into one (start time, symbol) ordered stream
    pub fn new(bars: BTreeMap<String, Vec<Bar>>) -> Self {
        let mut merged: Vec<(String, Bar)> = bars
            .into_iter()
            .flat_map(|(symbol, series)| series.into_iter().map(move |bar| (symbol.clone(), bar)))
            .collect();
        merged.sort_by(|a, b| a.1.start_time.cmp(&b.1.start_time).then_with(|| a.0.cmp(&b.0)));
        Self { bars: merged }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn run(self, engine: &mut StrategyEngine, htf: Option<&dyn HigherTimeframeSource>) -> EventLog {
        info!("=== REPLAY ===");
        info!("Replaying {} bars across {} symbols", self.bars.len(), engine.symbols().count());

        let mut log = EventLog::new();
        for (symbol, bar) in self.bars {
            if let Some(source) = htf {
                engine.refresh_htf(bar.start_time, source);
            }
            log.extend(engine.ingest(MarketEvent::Bar { symbol, bar }));
        }
        log.extend(engine.teardown());
        log
    }
}

/// Time source the live driver uses to close quiet bars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveClock {
    /// Wall clock
    System,
    /// Latest tick timestamp seen; for recorded ticks fed faster than real time
    DataTime,
}

pub struct LiveDriver {
    cycle: std::time::Duration,
    clock: LiveClock,
}

async fn forward_signals(events: &[StrategyEvent], signals: Option<&mpsc::Sender<EntrySignal>>) {
    let Some(tx) = signals else {
        return;
    };
    for signal in events.iter().filter_map(|e| e.as_signal()) {
        if tx.send(signal.clone()).await.is_err() {
            warn!("Signal receiver dropped, {} not delivered", signal.symbol);
        }
    }
}

impl LiveDriver {
    pub fn new(cycle: std::time::Duration, clock: LiveClock) -> Self {
        Self { cycle, clock }
    }

    /// Consume market events until the channel closes.
    ///
    /// Every cycle: refresh higher-timeframe data that is due and close bars
    /// whose bucket has elapsed. Signals are forwarded to `signals` as they
    /// are produced.
    pub async fn run(
        &self,
        engine: &mut StrategyEngine,
        mut market: mpsc::Receiver<MarketEvent>,
        htf: Option<&dyn HigherTimeframeSource>,
        signals: Option<mpsc::Sender<EntrySignal>>,
    ) -> Result<EventLog> {
        info!("=== LIVE ===");
        info!("Cycle: {:?}, clock: {:?}", self.cycle, self.clock);

        let mut log = EventLog::new();
        let mut interval = tokio::time::interval(self.cycle);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_data: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                biased;
                maybe = market.recv() => {
                    let Some(event) = maybe else {
                        break;
                    };
                    if let MarketEvent::Tick { tick, .. } = &event {
                        last_data = last_data.max(Some(tick.timestamp));
                    }
                    let events = engine.ingest(event);
                    forward_signals(&events, signals.as_ref()).await;
                    log.extend(events);
                }
                _ = interval.tick() => {
                    let now = match self.clock {
                        LiveClock::System => Some(Utc::now()),
                        LiveClock::DataTime => last_data,
                    };
                    let Some(now) = now else {
                        continue;
                    };
                    if let Some(source) = htf {
                        engine.refresh_htf(now, source);
                    }
                    let events = engine.flush_all(now);
                    forward_signals(&events, signals.as_ref()).await;
                    log.extend(events);
                }
            }
        }

        info!("Market stream closed");
        let events = engine.teardown();
        log.extend(events);
        Ok(log)
    }
}
