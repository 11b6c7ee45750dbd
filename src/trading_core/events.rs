//! Structured strategy events
//!
//! Every transition, filter outcome and signal is recorded as an event. The
//! replay and live drivers both produce this stream, and comparing two runs is
//! a matter of diffing their JSON lines.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info, warn};

use super::filters::FilterKind;
use crate::types::{EntryPath, EntrySignal, Side};

/// Per-symbol confirmation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Monitoring,
    BreakoutDetected,
    WeakTracking,
    PullbackRetest,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Monitoring => write!(f, "MONITORING"),
            MachineState::BreakoutDetected => write!(f, "BREAKOUT_DETECTED"),
            MachineState::WeakTracking => write!(f, "WEAK_TRACKING"),
            MachineState::PullbackRetest => write!(f, "PULLBACK_RETEST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StrategyEvent {
    Transition {
        symbol: String,
        timestamp: DateTime<Utc>,
        attempt: u64,
        side: Side,
        from: MachineState,
        to: MachineState,
        reason: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metrics: BTreeMap<String, f64>,
    },
    /// Informational step inside a state (CVD spike marked, hold not met...)
    Note {
        symbol: String,
        timestamp: DateTime<Utc>,
        attempt: u64,
        state: MachineState,
        message: String,
    },
    Filter {
        symbol: String,
        timestamp: DateTime<Utc>,
        attempt: u64,
        path: EntryPath,
        filter: FilterKind,
        passed: bool,
        reason: String,
    },
    Signal {
        attempt: u64,
        signal: EntrySignal,
    },
    DataDropped {
        symbol: String,
        code: String,
        detail: String,
    },
    SymbolFault {
        symbol: String,
        state: MachineState,
        /// Newest closed bar index at the time of the fault
        index: Option<u64>,
        error: String,
    },
}

impl StrategyEvent {
    pub fn symbol(&self) -> &str {
        match self {
            StrategyEvent::Transition { symbol, .. }
            | StrategyEvent::Note { symbol, .. }
            | StrategyEvent::Filter { symbol, .. }
            | StrategyEvent::DataDropped { symbol, .. }
            | StrategyEvent::SymbolFault { symbol, .. } => symbol,
            StrategyEvent::Signal { signal, .. } => &signal.symbol,
        }
    }

    pub fn as_signal(&self) -> Option<&EntrySignal> {
        match self {
            StrategyEvent::Signal { signal, .. } => Some(signal),
            _ => None,
        }
    }

    /// Emit the event on the tracing stream
    pub fn log(&self) {
        match self {
            StrategyEvent::Transition { symbol, attempt, side, from, to, reason, .. } => {
                info!("STATE: [{}] #{} {} {} -> {} | {}", symbol, attempt, side, from, to, reason);
            }
            StrategyEvent::Note { symbol, attempt, state, message, .. } => {
                debug!("NOTE: [{}] #{} {} | {}", symbol, attempt, state, message);
            }
            StrategyEvent::Filter { symbol, attempt, path, filter, passed, reason, .. } => {
                if *passed {
                    debug!("FILTER: [{}] #{} {} {} passed | {}", symbol, attempt, path, filter, reason);
                } else {
                    info!("FILTER: [{}] #{} {} rejected by {} | {}", symbol, attempt, path, filter, reason);
                }
            }
            StrategyEvent::Signal { attempt, signal } => {
                info!(
                    "SIGNAL: [{}] #{} {} {} @ {:.2} | {}",
                    signal.symbol, attempt, signal.side, signal.entry_path, signal.price, signal.reason
                );
            }
            StrategyEvent::DataDropped { symbol, code, detail } => {
                warn!("DROPPED: [{}] {} | {}", symbol, code, detail);
            }
            StrategyEvent::SymbolFault { symbol, state, index, error } => {
                error!(
                    "FAULT: [{}] in {} at bar {:?} | {} (symbol reset)",
                    symbol, state, index, error
                );
            }
        }
    }
}

/// Counts by kind, for the end-of-run summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub attempts: u64,
    pub signals: u64,
    pub signals_by_path: BTreeMap<String, u64>,
    pub filter_rejections: BTreeMap<String, u64>,
    pub dropped: u64,
    pub faults: u64,
}

/// Ordered collection of everything the engine emitted
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<StrategyEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = StrategyEvent>) {
        self.events.extend(events);
    }

    pub fn events(&self) -> &[StrategyEvent] {
        &self.events
    }

    pub fn signals(&self) -> impl Iterator<Item = &EntrySignal> {
        self.events.iter().filter_map(|e| e.as_signal())
    }

    pub fn summary(&self) -> EventSummary {
        let mut summary = EventSummary::default();
        for event in &self.events {
            match event {
                StrategyEvent::Transition { from: MachineState::Monitoring, .. } => summary.attempts += 1,
                StrategyEvent::Signal { signal, .. } => {
                    summary.signals += 1;
                    *summary.signals_by_path.entry(signal.entry_path.to_string()).or_default() += 1;
                }
                StrategyEvent::Filter { filter, passed: false, .. } => {
                    *summary.filter_rejections.entry(filter.to_string()).or_default() += 1;
                }
                StrategyEvent::DataDropped { .. } => summary.dropped += 1,
                StrategyEvent::SymbolFault { .. } => summary.faults += 1,
                _ => {}
            }
        }
        summary
    }

    pub fn write_jsonl<W: Write>(&self, mut out: W) -> Result<()> {
        for event in &self.events {
            serde_json::to_writer(&mut out, event)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn save_jsonl(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating event file {:?}", path))?;
        self.write_jsonl(std::io::BufWriter::new(file))
    }
}
