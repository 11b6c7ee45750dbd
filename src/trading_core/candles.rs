//! Candles: fixed groups of consecutive bars used for confirmation decisions
//!
//! A candle covers one time bucket of `bars_per_candle` bars. It closes when
//! its last bar slot closes, or when the first bar of a later bucket arrives
//! (gaps in the tick stream leave slots empty).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::bars::Bar;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Sequence number of this candle within the symbol's session
    pub index: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub buy_volume: u64,
    pub sell_volume: u64,
    /// Absolute index of the first and last bar in the candle
    pub first_bar: u64,
    pub last_bar: u64,
}

impl Candle {
    /// |close - open| / open, in percent
    pub fn body_pct(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.close - self.open).abs() / self.open * 100.0
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// (sell - buy) / total * 100. Positive is bearish pressure.
    pub fn imbalance_pct(&self) -> f64 {
        if self.volume == 0 {
            return 0.0;
        }
        (self.sell_volume as f64 - self.buy_volume as f64) / self.volume as f64 * 100.0
    }
}

struct CandleBuilder {
    start_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    buy_volume: u64,
    sell_volume: u64,
    first_bar: u64,
    last_bar: u64,
}

impl CandleBuilder {
    fn new(start_time: DateTime<Utc>, bar: &Bar) -> Self {
        Self {
            start_time,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            buy_volume: bar.buy_volume,
            sell_volume: bar.sell_volume,
            first_bar: bar.index,
            last_bar: bar.index,
        }
    }

    fn add_bar(&mut self, bar: &Bar) {
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
        self.buy_volume += bar.buy_volume;
        self.sell_volume += bar.sell_volume;
        self.last_bar = bar.index;
    }

    fn finish(&self, index: u64, duration: Duration) -> Candle {
        Candle {
            index,
            start_time: self.start_time,
            end_time: self.start_time + duration,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
            first_bar: self.first_bar,
            last_bar: self.last_bar,
        }
    }
}

/// Incrementally derives candles from the closed-bar stream
pub struct CandleTracker {
    candle_duration: Duration,
    bar_duration: Duration,
    open: Option<CandleBuilder>,
    next_index: u64,
}

impl CandleTracker {
    pub fn new(bar_duration: Duration, candle_duration: Duration) -> Self {
        Self {
            candle_duration,
            bar_duration,
            open: None,
            next_index: 0,
        }
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.candle_duration.num_milliseconds().max(1);
        let floored = ts.timestamp_millis().div_euclid(width) * width;
        DateTime::from_timestamp_millis(floored).unwrap_or(ts)
    }

    fn finish_open(&mut self) -> Option<Candle> {
        let builder = self.open.take()?;
        let candle = builder.finish(self.next_index, self.candle_duration);
        self.next_index += 1;
        Some(candle)
    }

    /// Close the open candle if `bar_start` belongs to a later bucket.
    /// Call before the bar itself is processed.
    pub fn close_before(&mut self, bar_start: DateTime<Utc>) -> Option<Candle> {
        let bucket = self.bucket_start(bar_start);
        match &self.open {
            Some(open) if open.start_time < bucket => self.finish_open(),
            _ => None,
        }
    }

    /// Add a bar; returns the candle if this bar filled its last slot
    pub fn add_bar(&mut self, bar: &Bar) -> Option<Candle> {
        let bucket = self.bucket_start(bar.start_time);
        match &mut self.open {
            Some(open) if open.start_time == bucket => open.add_bar(bar),
            _ => self.open = Some(CandleBuilder::new(bucket, bar)),
        }

        if bar.start_time + self.bar_duration >= bucket + self.candle_duration {
            self.finish_open()
        } else {
            None
        }
    }
}

/// Bounded history of closed candles
#[derive(Debug, Clone)]
pub struct CandleSeries {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, candle: Candle) {
        if self.candles.len() == self.capacity {
            self.candles.pop_front();
        }
        self.candles.push_back(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Mean volume of the last `lookback` candles
    pub fn volume_baseline(&self, lookback: usize) -> Option<f64> {
        let n = lookback.min(self.candles.len());
        if n == 0 {
            return None;
        }
        let total: u64 = self.candles.iter().rev().take(n).map(|c| c.volume).sum();
        Some(total as f64 / n as f64)
    }

    /// Last `n` candles, oldest first
    pub fn recent(&self, n: usize) -> Vec<&Candle> {
        let skip = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(skip).collect()
    }
}
