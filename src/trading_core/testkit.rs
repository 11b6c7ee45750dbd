//! Synthetic bars for unit tests

use chrono::{DateTime, TimeZone, Utc};

use super::bars::Bar;
use crate::config::{BreakoutConfig, FilterToggles};
use crate::types::PivotLevel;

/// Minute-aligned session origin
pub const ORIGIN: i64 = 1_699_999_980;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ORIGIN + secs, 0).unwrap()
}

/// Twelve 5s bars making up minute `m`, moving linearly from `open` to
/// `close`. `buy_pct` percent of each bar's volume is buyer-initiated.
pub fn minute(m: i64, open: f64, close: f64, volume: u64, buy_pct: u64) -> Vec<Bar> {
    let per_bar = volume / 12;
    let buy = per_bar * buy_pct / 100;
    (0..12)
        .map(|k| {
            let o = open + (close - open) * k as f64 / 12.0;
            let c = if k == 11 { close } else { open + (close - open) * (k + 1) as f64 / 12.0 };
            Bar {
                index: 0,
                start_time: ts(m * 60 + k * 5),
                open: o,
                high: o.max(c),
                low: o.min(c),
                close: c,
                volume: per_bar,
                buy_volume: buy,
                sell_volume: per_bar - buy,
            }
        })
        .collect()
}

/// A balanced minute going nowhere, with a 0.1 wide range
pub fn quiet(m: i64, price: f64, volume: u64) -> Vec<Bar> {
    minute(m, price, price, volume, 50)
        .into_iter()
        .map(|mut b| {
            b.high = price + 0.05;
            b.low = price - 0.05;
            b
        })
        .collect()
}

pub fn levels(resistance: f64, support: f64) -> PivotLevel {
    PivotLevel {
        resistance: Some(resistance),
        support: Some(support),
        targets: vec![resistance * 1.03],
        downside_targets: vec![support * 0.97],
        score: 1.0,
    }
}

/// Default thresholds with every quality filter switched off
pub fn unfiltered_config() -> BreakoutConfig {
    BreakoutConfig {
        filters: FilterToggles {
            choppiness: false,
            room_to_target: false,
            htf_momentum: false,
            order_flow: false,
        },
        ..Default::default()
    }
}
