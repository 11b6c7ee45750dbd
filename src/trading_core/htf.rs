//! Higher-timeframe bars for the momentum filter
//!
//! Fetching happens outside the hot path: the driver asks the cache to refresh
//! once per cycle, and a refresh only hits the source when the cached copy is
//! older than the TTL. The filter itself only reads.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::bars::Bar;

/// Provider of higher-timeframe (e.g. hourly) history for a symbol
pub trait HigherTimeframeSource {
    fn fetch(&self, symbol: &str) -> Result<Vec<Bar>>;
}

/// Source backed by bars loaded up front (replay, tests)
#[derive(Debug, Clone, Default)]
pub struct InMemoryHtfSource {
    bars: HashMap<String, Vec<Bar>>,
}

impl InMemoryHtfSource {
    pub fn new(bars: impl IntoIterator<Item = (String, Vec<Bar>)>) -> Self {
        Self {
            bars: bars.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, symbol: &str, bars: Vec<Bar>) {
        self.bars.insert(symbol.to_string(), bars);
    }
}

impl HigherTimeframeSource for InMemoryHtfSource {
    fn fetch(&self, symbol: &str) -> Result<Vec<Bar>> {
        Ok(self.bars.get(symbol).cloned().unwrap_or_default())
    }
}

/// Cached higher-timeframe bars of one symbol
#[derive(Debug, Clone)]
pub struct HtfSeries {
    bars: Vec<Bar>,
    bar_duration: Duration,
    fetched_at: DateTime<Utc>,
}

impl HtfSeries {
    pub fn new(mut bars: Vec<Bar>, bar_duration: Duration, fetched_at: DateTime<Utc>) -> Self {
        bars.sort_by_key(|b| b.start_time);
        Self { bars, bar_duration, fetched_at }
    }

    /// Closes of bars that had fully closed by `now`, oldest first
    pub fn closed_closes(&self, now: DateTime<Utc>) -> Vec<f64> {
        self.bars
            .iter()
            .filter(|b| b.start_time + self.bar_duration <= now)
            .map(|b| b.close)
            .collect()
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Time-bounded per-symbol cache
pub struct HtfCache {
    bar_duration: Duration,
    ttl: Duration,
    entries: BTreeMap<String, HtfSeries>,
}

impl HtfCache {
    pub fn new(bar_duration: Duration, ttl: Duration) -> Self {
        Self {
            bar_duration,
            ttl,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&HtfSeries> {
        self.entries.get(symbol)
    }

    pub fn is_due(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(symbol) {
            Some(series) => now - series.fetched_at >= self.ttl,
            None => true,
        }
    }

    /// Refresh `symbol` if its entry is missing or expired.
    ///
    /// A failed fetch keeps the previous (stale) copy and is only logged.
    pub fn refresh_if_due(
        &mut self,
        symbol: &str,
        now: DateTime<Utc>,
        source: &dyn HigherTimeframeSource,
    ) -> bool {
        if !self.is_due(symbol, now) {
            return false;
        }
        match source.fetch(symbol) {
            Ok(bars) => {
                debug!(symbol, count = bars.len(), "refreshed higher-timeframe bars");
                self.entries
                    .insert(symbol.to_string(), HtfSeries::new(bars, self.bar_duration, now));
                true
            }
            Err(e) => {
                warn!(symbol, error = %e, "higher-timeframe fetch failed, keeping cached copy");
                false
            }
        }
    }
}
