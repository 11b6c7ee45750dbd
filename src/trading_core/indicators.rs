//! Small indicator helpers over bars and candles

use super::bars::Bar;
use super::candles::Candle;

/// Anything with a high, low and close
pub trait Ohlc {
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
}

impl Ohlc for Bar {
    fn high(&self) -> f64 {
        self.high
    }
    fn low(&self) -> f64 {
        self.low
    }
    fn close(&self) -> f64 {
        self.close
    }
}

impl Ohlc for Candle {
    fn high(&self) -> f64 {
        self.high
    }
    fn low(&self) -> f64 {
        self.low
    }
    fn close(&self) -> f64 {
        self.close
    }
}

impl<T: Ohlc> Ohlc for &T {
    fn high(&self) -> f64 {
        (*self).high()
    }
    fn low(&self) -> f64 {
        (*self).low()
    }
    fn close(&self) -> f64 {
        (*self).close()
    }
}

/// Average True Range over the last `period` true ranges (simple mean).
///
/// With a single item the range is its high - low.
pub fn average_true_range<T: Ohlc>(items: &[T], period: usize) -> Option<f64> {
    match items.len() {
        0 => None,
        1 => Some(items[0].high() - items[0].low()),
        len => {
            let start = len.saturating_sub(period + 1);
            let window = &items[start..];
            let mut sum_tr = 0.0;
            let mut prev_close = window[0].close();
            for item in window.iter().skip(1) {
                let tr = (item.high() - item.low())
                    .max((item.high() - prev_close).abs())
                    .max((item.low() - prev_close).abs());
                sum_tr += tr;
                prev_close = item.close();
            }
            Some(sum_tr / (window.len() - 1) as f64)
        }
    }
}

/// RSI over the last `period` close-to-close changes, using simple averages.
///
/// Needs `period + 1` closes. Bounded to [0, 100].
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let window = &closes[closes.len() - (period + 1)..];
    let (mut gains, mut losses) = (0.0, 0.0);
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Highest high minus lowest low
pub fn price_range<T: Ohlc>(items: &[T]) -> Option<f64> {
    if items.is_empty() {
        return None;
    }
    let high = items.iter().map(|b| b.high()).fold(f64::MIN, f64::max);
    let low = items.iter().map(|b| b.low()).fold(f64::MAX, f64::min);
    Some(high - low)
}

/// Net buy-minus-sell volume across bars
pub fn net_delta(bars: &[&Bar]) -> i64 {
    bars.iter().map(|b| b.delta()).sum()
}
