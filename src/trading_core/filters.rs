//! Quality filters applied to every would-be signal
//!
//! Each filter is a pure function of the context it is given. The chain runs
//! them in a fixed order and the first rejection wins; `evaluate_all` runs
//! every enabled filter for diagnostics.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::bars::BarBuffer;
use super::candles::CandleSeries;
use super::htf::HtfSeries;
use super::indicators::{average_true_range, net_delta, price_range, rsi};
use crate::config::BreakoutConfig;
use crate::types::{PivotLevel, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Choppiness,
    RoomToTarget,
    HtfMomentum,
    OrderFlow,
}

impl FilterKind {
    /// Evaluation order of the chain
    pub const ORDER: [FilterKind; 4] = [
        FilterKind::Choppiness,
        FilterKind::RoomToTarget,
        FilterKind::HtfMomentum,
        FilterKind::OrderFlow,
    ];

    fn enabled(self, config: &BreakoutConfig) -> bool {
        match self {
            FilterKind::Choppiness => config.filters.choppiness,
            FilterKind::RoomToTarget => config.filters.room_to_target,
            FilterKind::HtfMomentum => config.filters.htf_momentum,
            FilterKind::OrderFlow => config.filters.order_flow,
        }
    }
}

impl std::fmt::Display for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterKind::Choppiness => write!(f, "choppiness"),
            FilterKind::RoomToTarget => write!(f, "room_to_target"),
            FilterKind::HtfMomentum => write!(f, "htf_momentum"),
            FilterKind::OrderFlow => write!(f, "order_flow"),
        }
    }
}

/// Everything a filter may look at
pub struct FilterContext<'a> {
    pub side: Side,
    /// Candidate entry price
    pub price: f64,
    /// Decision time; bars starting at or after it are not visible
    pub now: DateTime<Utc>,
    pub levels: &'a PivotLevel,
    pub bars: &'a BarBuffer,
    pub candles: &'a CandleSeries,
    pub htf: Option<&'a HtfSeries>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub filter: FilterKind,
    pub passed: bool,
    pub reason: String,
}

impl FilterOutcome {
    fn pass(filter: FilterKind, reason: String) -> Self {
        Self { filter, passed: true, reason }
    }

    fn reject(filter: FilterKind, reason: String) -> Self {
        Self { filter, passed: false, reason }
    }
}

/// Result of a short-circuiting chain run
#[derive(Debug, Clone, PartialEq)]
pub struct ChainVerdict {
    /// Outcomes of the filters that ran, in order
    pub outcomes: Vec<FilterOutcome>,
}

impl ChainVerdict {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn rejection(&self) -> Option<&FilterOutcome> {
        self.outcomes.iter().find(|o| !o.passed)
    }
}

pub fn check_choppiness(ctx: &FilterContext<'_>, config: &BreakoutConfig) -> FilterOutcome {
    let kind = FilterKind::Choppiness;
    let since = ctx.now - Duration::minutes(config.choppy_lookback_minutes);
    let recent = ctx.bars.window(since, ctx.now);
    let Some(range) = price_range(&recent) else {
        return FilterOutcome::reject(kind, "no bars in choppiness window".to_string());
    };
    let candles = ctx.candles.recent(config.atr_period + 1);
    if candles.len() < 2 {
        return FilterOutcome::reject(
            kind,
            format!("insufficient candle history for ATR ({} candles)", candles.len()),
        );
    }
    let Some(atr) = average_true_range(&candles, config.atr_period) else {
        return FilterOutcome::reject(kind, "ATR unavailable".to_string());
    };
    let floor = config.choppy_atr_multiplier * atr;
    if range < floor {
        FilterOutcome::reject(
            kind,
            format!("{}m range {:.4} < {:.2} x ATR {:.4}", config.choppy_lookback_minutes, range, config.choppy_atr_multiplier, atr),
        )
    } else {
        FilterOutcome::pass(kind, format!("range {:.4} >= {:.4}", range, floor))
    }
}

pub fn check_room_to_target(ctx: &FilterContext<'_>, config: &BreakoutConfig) -> FilterOutcome {
    let kind = FilterKind::RoomToTarget;
    let Some(target) = ctx.levels.next_unreached_target(ctx.side, ctx.price) else {
        return FilterOutcome::reject(kind, format!("no unreached {} target", ctx.side));
    };
    if ctx.price <= 0.0 {
        return FilterOutcome::reject(kind, format!("invalid entry price {}", ctx.price));
    }
    let room_pct = ctx.side.sign() * (target - ctx.price) / ctx.price * 100.0;
    if room_pct < config.min_room_to_target_pct {
        FilterOutcome::reject(
            kind,
            format!("{:.2}% to target {:.2} < {:.2}%", room_pct, target, config.min_room_to_target_pct),
        )
    } else {
        FilterOutcome::pass(kind, format!("{:.2}% to target {:.2}", room_pct, target))
    }
}

pub fn check_htf_momentum(ctx: &FilterContext<'_>, config: &BreakoutConfig) -> FilterOutcome {
    let kind = FilterKind::HtfMomentum;
    let closes = ctx.htf.map(|s| s.closed_closes(ctx.now)).unwrap_or_default();
    let Some(value) = rsi(&closes, config.htf_rsi_period) else {
        return FilterOutcome::reject(
            kind,
            format!("insufficient higher-timeframe data ({} closed bars)", closes.len()),
        );
    };
    let aligned = match ctx.side {
        Side::Long => value >= 50.0 && value < config.htf_overbought,
        Side::Short => value <= 50.0 && value > config.htf_oversold,
    };
    if aligned {
        FilterOutcome::pass(kind, format!("RSI {:.1} aligned with {}", value, ctx.side))
    } else {
        FilterOutcome::reject(kind, format!("RSI {:.1} not aligned with {}", value, ctx.side))
    }
}

pub fn check_order_flow(ctx: &FilterContext<'_>, config: &BreakoutConfig) -> FilterOutcome {
    let kind = FilterKind::OrderFlow;
    let since = ctx.now - Duration::minutes(config.order_flow_minutes);
    let recent = ctx.bars.window(since, ctx.now);
    let delta = net_delta(&recent);
    let supportive = match ctx.side {
        Side::Long => delta > 0,
        Side::Short => delta < 0,
    };
    if supportive {
        FilterOutcome::pass(kind, format!("net delta {} over {}m", delta, config.order_flow_minutes))
    } else {
        FilterOutcome::reject(
            kind,
            format!("net delta {} over {}m opposes {}", delta, config.order_flow_minutes, ctx.side),
        )
    }
}

pub fn run_filter(kind: FilterKind, ctx: &FilterContext<'_>, config: &BreakoutConfig) -> FilterOutcome {
    match kind {
        FilterKind::Choppiness => check_choppiness(ctx, config),
        FilterKind::RoomToTarget => check_room_to_target(ctx, config),
        FilterKind::HtfMomentum => check_htf_momentum(ctx, config),
        FilterKind::OrderFlow => check_order_flow(ctx, config),
    }
}

pub struct QualityFilterChain<'a> {
    config: &'a BreakoutConfig,
}

impl<'a> QualityFilterChain<'a> {
    pub fn new(config: &'a BreakoutConfig) -> Self {
        Self { config }
    }

    /// Run enabled filters in order, stopping at the first rejection
    pub fn evaluate(&self, ctx: &FilterContext<'_>) -> ChainVerdict {
        let mut outcomes = Vec::new();
        for kind in FilterKind::ORDER {
            if !kind.enabled(self.config) {
                continue;
            }
            let outcome = run_filter(kind, ctx, self.config);
            let rejected = !outcome.passed;
            outcomes.push(outcome);
            if rejected {
                break;
            }
        }
        ChainVerdict { outcomes }
    }

    /// Run every enabled filter regardless of earlier rejections
    pub fn evaluate_all(&self, ctx: &FilterContext<'_>) -> Vec<FilterOutcome> {
        FilterKind::ORDER
            .into_iter()
            .filter(|k| k.enabled(self.config))
            .map(|k| run_filter(k, ctx, self.config))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::bars::{Bar, BarAggregator};
    use crate::trading_core::candles::CandleTracker;
    use chrono::TimeZone;

    const ORIGIN: i64 = 1_699_999_980;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ORIGIN + secs, 0).unwrap()
    }

    fn bar(secs: i64, low: f64, high: f64, buy: u64, sell: u64) -> Bar {
        Bar {
            index: 0,
            start_time: ts(secs),
            open: low,
            high,
            low,
            close: high,
            volume: buy + sell,
            buy_volume: buy,
            sell_volume: sell,
        }
    }

    struct Fixture {
        agg: BarAggregator,
        candles: CandleSeries,
        levels: PivotLevel,
        htf: HtfSeries,
    }

    /// 10 minutes of 5s bars, each spanning `bar_range`, with `buy`/`sell` split
    fn fixture(bar_range: f64, buy: u64, sell: u64) -> Fixture {
        let mut agg = BarAggregator::new(Duration::seconds(5), 120);
        let mut tracker = CandleTracker::new(Duration::seconds(5), Duration::seconds(60));
        let mut candles = CandleSeries::new(60);
        for i in 0..120 {
            let low = 100.0 + (i % 12) as f64 * 0.01;
            let b = agg.push_bar(bar(i * 5, low, low + bar_range, buy, sell)).unwrap();
            if let Some(c) = tracker.add_bar(&b) {
                candles.push(c);
            }
        }
        // +2/-1 alternating hourly closes: RSI 66.7
        let mut htf_bars = Vec::new();
        let mut close = 90.0;
        for h in 0..16i64 {
            close += if h % 2 == 0 { 2.0 } else { -1.0 };
            htf_bars.push(Bar {
                index: h as u64,
                start_time: ts(-(20 - h) * 3600),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1,
                buy_volume: 0,
                sell_volume: 0,
            });
        }
        Fixture {
            agg,
            candles,
            levels: PivotLevel {
                resistance: Some(100.0),
                support: Some(95.0),
                targets: vec![103.0],
                downside_targets: vec![90.0],
                score: 1.0,
            },
            htf: HtfSeries::new(htf_bars, Duration::hours(1), ts(0)),
        }
    }

    fn context<'a>(f: &'a Fixture, side: Side, price: f64) -> FilterContext<'a> {
        FilterContext {
            side,
            price,
            now: ts(600),
            levels: &f.levels,
            bars: f.agg.buffer(),
            candles: &f.candles,
            htf: Some(&f.htf),
        }
    }

    #[test]
    fn test_all_filters_pass_on_healthy_setup() {
        let config = BreakoutConfig::default();
        let f = fixture(0.05, 60, 40);
        let verdict = QualityFilterChain::new(&config).evaluate(&context(&f, Side::Long, 100.5));
        assert!(verdict.passed(), "{:?}", verdict);
        assert_eq!(verdict.outcomes.len(), 4);
    }

    #[test]
    fn test_chain_stops_at_first_rejection() {
        let config = BreakoutConfig::default();
        let f = fixture(0.05, 60, 40);
        // 102.0 leaves < 1.5% to the 103 target
        let verdict = QualityFilterChain::new(&config).evaluate(&context(&f, Side::Long, 102.0));
        assert!(!verdict.passed());
        assert_eq!(verdict.outcomes.len(), 2);
        assert_eq!(verdict.rejection().unwrap().filter, FilterKind::RoomToTarget);
    }

    #[test]
    fn test_filters_are_independent() {
        let config = BreakoutConfig::default();
        // selling pressure fails order flow only
        let f = fixture(0.05, 40, 60);
        let ctx = context(&f, Side::Long, 100.5);
        let all = QualityFilterChain::new(&config).evaluate_all(&ctx);
        let failed: Vec<FilterKind> = all.iter().filter(|o| !o.passed).map(|o| o.filter).collect();
        assert_eq!(failed, vec![FilterKind::OrderFlow]);

        // re-running one filter alone gives the same answer as inside the chain
        for outcome in &all {
            assert_eq!(&run_filter(outcome.filter, &ctx, &config), outcome);
        }
    }

    #[test]
    fn test_choppiness_rejects_narrow_range() {
        let config = BreakoutConfig::default();
        let mut f = fixture(0.05, 60, 40);
        // a wide candle history inflates ATR far above the recent 5m range
        let mut tracker = CandleTracker::new(Duration::seconds(60), Duration::seconds(60));
        let mut wide = CandleSeries::new(60);
        for m in 0..21 {
            let base = if m % 2 == 0 { 100.0 } else { 104.0 };
            wide.push(tracker.add_bar(&bar(m * 60, base, base + 2.0, 1, 1)).unwrap());
        }
        f.candles = wide;
        let outcome = check_choppiness(&context(&f, Side::Long, 100.5), &config);
        assert!(!outcome.passed);
    }

    #[test]
    fn test_htf_fails_closed_without_data() {
        let config = BreakoutConfig::default();
        let f = fixture(0.05, 60, 40);
        let mut ctx = context(&f, Side::Long, 100.5);
        ctx.htf = None;
        let outcome = check_htf_momentum(&ctx, &config);
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("insufficient"));
    }

    #[test]
    fn test_htf_rejects_counter_trend_short() {
        let config = BreakoutConfig::default();
        let f = fixture(0.05, 40, 60);
        // RSI 66.7 supports longs, not shorts
        let outcome = check_htf_momentum(&context(&f, Side::Short, 94.0), &config);
        assert!(!outcome.passed);
    }

    #[test]
    fn test_disabled_filter_is_skipped() {
        let mut config = BreakoutConfig::default();
        config.filters.order_flow = false;
        let f = fixture(0.05, 40, 60);
        let verdict = QualityFilterChain::new(&config).evaluate(&context(&f, Side::Long, 100.5));
        assert!(verdict.passed());
        assert_eq!(verdict.outcomes.len(), 3);
    }
}
