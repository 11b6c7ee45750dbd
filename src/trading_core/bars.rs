//! Bar aggregation
//!
//! Ticks are accumulated into fixed-duration bars. Every closed bar gets the
//! next absolute index for its symbol and lands in a bounded ring buffer.
//! Replay feeds pre-formed bars through the same buffer, so callers index bars
//! the same way in both modes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::types::Tick;

/// Closed, immutable bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Absolute index, assigned when the bar enters the buffer
    #[serde(default)]
    pub index: u64,
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Volume classified as buyer-initiated (tick rule)
    #[serde(default)]
    pub buy_volume: u64,
    /// Volume classified as seller-initiated (tick rule)
    #[serde(default)]
    pub sell_volume: u64,
}

impl Bar {
    pub fn delta(&self) -> i64 {
        self.buy_volume as i64 - self.sell_volume as i64
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    fn check_finite(&self) -> Result<(), DataError> {
        for (field, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if !value.is_finite() {
                return Err(DataError::NonFinite { field });
            }
        }
        Ok(())
    }
}

/// Uptick/downtick classification carried across ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickDirection {
    Unknown,
    Up,
    Down,
}

struct BarBuilder {
    start_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    buy_volume: u64,
    sell_volume: u64,
}

impl BarBuilder {
    fn new(start_time: DateTime<Utc>, price: f64) -> Self {
        Self {
            start_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0,
            buy_volume: 0,
            sell_volume: 0,
        }
    }

    fn add_trade(&mut self, price: f64, size: u64, direction: TickDirection) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
        match direction {
            TickDirection::Up => self.buy_volume += size,
            TickDirection::Down => self.sell_volume += size,
            TickDirection::Unknown => {
                let half = size / 2;
                self.buy_volume += half;
                self.sell_volume += size - half;
            }
        }
    }

    fn to_bar(&self) -> Bar {
        Bar {
            index: 0,
            start_time: self.start_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            buy_volume: self.buy_volume,
            sell_volume: self.sell_volume,
        }
    }
}

/// Bounded ring buffer of closed bars addressed by absolute index.
///
/// The slot of index `i` is `i % capacity`; an index is valid while
/// `tip - capacity < i <= tip`. Anything else is `OutOfWindow`.
#[derive(Debug, Clone)]
pub struct BarBuffer {
    slots: Vec<Bar>,
    capacity: usize,
    next_index: u64,
}

impl BarBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next_index: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot_for(&self, index: u64) -> usize {
        (index % self.capacity as u64) as usize
    }

    /// Store a bar, assigning it the next absolute index
    pub fn push(&mut self, mut bar: Bar) -> u64 {
        let index = self.next_index;
        bar.index = index;
        let slot = self.slot_for(index);
        if self.slots.len() < self.capacity {
            self.slots.push(bar);
        } else {
            self.slots[slot] = bar;
        }
        self.next_index += 1;
        index
    }

    /// Index of the newest bar
    pub fn tip(&self) -> Option<u64> {
        self.next_index.checked_sub(1)
    }

    /// Index of the oldest bar still retained
    pub fn oldest_index(&self) -> u64 {
        self.next_index.saturating_sub(self.capacity as u64)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: u64) -> Result<&Bar, DataError> {
        if index >= self.next_index || index < self.oldest_index() {
            return Err(DataError::OutOfWindow {
                requested: index,
                oldest: self.oldest_index(),
                tip: self.tip(),
            });
        }
        Ok(&self.slots[self.slot_for(index)])
    }

    pub fn last(&self) -> Option<&Bar> {
        self.tip().and_then(|tip| self.get(tip).ok())
    }

    /// Bars `from..=to` in index order
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<&Bar>, DataError> {
        (from..=to).map(|i| self.get(i)).collect()
    }

    /// Retained bars starting at or after `since`, oldest first
    pub fn since(&self, since: DateTime<Utc>) -> Vec<&Bar> {
        let Some(tip) = self.tip() else {
            return Vec::new();
        };
        let mut bars: Vec<&Bar> = (self.oldest_index()..=tip)
            .rev()
            .filter_map(|i| self.get(i).ok())
            .take_while(|b| b.start_time >= since)
            .collect();
        bars.reverse();
        bars
    }

    /// Retained bars with `since <= start_time < until`, oldest first
    pub fn window(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<&Bar> {
        self.since(since)
            .into_iter()
            .filter(|b| b.start_time < until)
            .collect()
    }
}

/// Turns ticks (live) or pre-formed bars (replay) into indexed bars
pub struct BarAggregator {
    bar_duration: Duration,
    current: Option<BarBuilder>,
    buffer: BarBuffer,
    last_event: Option<DateTime<Utc>>,
    last_price: Option<f64>,
    last_direction: TickDirection,
}

impl BarAggregator {
    pub fn new(bar_duration: Duration, capacity: usize) -> Self {
        Self {
            bar_duration,
            current: None,
            buffer: BarBuffer::new(capacity),
            last_event: None,
            last_price: None,
            last_direction: TickDirection::Unknown,
        }
    }

    pub fn buffer(&self) -> &BarBuffer {
        &self.buffer
    }

    pub fn bar_duration(&self) -> Duration {
        self.bar_duration
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.bar_duration.num_milliseconds().max(1);
        let floored = ts.timestamp_millis().div_euclid(width) * width;
        DateTime::from_timestamp_millis(floored).unwrap_or(ts)
    }

    fn commit(&mut self, builder: BarBuilder) -> Bar {
        let bar = builder.to_bar();
        let index = self.buffer.push(bar.clone());
        Bar { index, ..bar }
    }

    /// Feed a tick. Returns the bar it closed, if it crossed a bar boundary.
    pub fn push_tick(&mut self, tick: &Tick) -> Result<Option<Bar>, DataError> {
        if !tick.price.is_finite() {
            return Err(DataError::NonFinite { field: "price" });
        }
        if let Some(last) = self.last_event {
            if tick.timestamp < last {
                return Err(DataError::OutOfOrder { last, got: tick.timestamp });
            }
        }

        let bucket = self.bucket_start(tick.timestamp);
        // A tick for a bucket that was already closed would rewrite history
        if self.current.is_none() {
            if let Some(last_bar) = self.buffer.last() {
                if bucket <= last_bar.start_time {
                    return Err(DataError::OutOfOrder {
                        last: last_bar.start_time + self.bar_duration,
                        got: tick.timestamp,
                    });
                }
            }
        }

        let direction = match self.last_price {
            Some(prev) if tick.price > prev => TickDirection::Up,
            Some(prev) if tick.price < prev => TickDirection::Down,
            _ => self.last_direction,
        };
        self.last_event = Some(tick.timestamp);
        self.last_price = Some(tick.price);
        self.last_direction = direction;

        let mut closed = None;
        match self.current.take() {
            Some(mut builder) if builder.start_time == bucket => {
                builder.add_trade(tick.price, tick.volume, direction);
                self.current = Some(builder);
            }
            Some(builder) => {
                closed = Some(self.commit(builder));
                let mut next = BarBuilder::new(bucket, tick.price);
                next.add_trade(tick.price, tick.volume, direction);
                self.current = Some(next);
            }
            None => {
                let mut next = BarBuilder::new(bucket, tick.price);
                next.add_trade(tick.price, tick.volume, direction);
                self.current = Some(next);
            }
        }

        Ok(closed)
    }

    /// Close the open bar if its time bucket has fully elapsed at `now`
    pub fn flush(&mut self, now: DateTime<Utc>) -> Option<Bar> {
        let due = self
            .current
            .as_ref()
            .is_some_and(|b| now >= b.start_time + self.bar_duration);
        if !due {
            return None;
        }
        let builder = self.current.take()?;
        self.last_event = self.last_event.max(Some(now));
        Some(self.commit(builder))
    }

    /// Feed a pre-formed historical bar
    pub fn push_bar(&mut self, bar: Bar) -> Result<Bar, DataError> {
        bar.check_finite()?;
        if let Some(last) = self.buffer.last() {
            if bar.start_time <= last.start_time {
                return Err(DataError::OutOfOrder {
                    last: last.start_time,
                    got: bar.start_time,
                });
            }
        }
        if let Some(open) = &self.current {
            if bar.start_time <= open.start_time {
                return Err(DataError::OutOfOrder {
                    last: open.start_time,
                    got: bar.start_time,
                });
            }
        }
        self.last_event = self.last_event.max(Some(bar.start_time));
        self.last_price = Some(bar.close);
        let index = self.buffer.push(bar.clone());
        Ok(Bar { index, ..bar })
    }
}
