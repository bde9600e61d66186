/// Shared bar-series helpers used by Analytics (C3) and the Strategy Builder (C6).
use crate::types::Bar;

/// Wilder's smoothing (EMA-like with 1/period factor).
fn wilder_smooth(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period {
        return None;
    }

    let mut smoothed: f64 = values.iter().take(period).sum::<f64>() / period as f64;
    for value in values.iter().skip(period) {
        smoothed = ((period - 1) as f64 * smoothed + value) / period as f64;
    }

    Some(smoothed)
}

/// Simple moving average of closes over the trailing `period` bars.
pub fn calculate_sma(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.len() < period {
        return None;
    }

    let sum: f64 = bars.iter().rev().take(period).map(|b| b.close).sum();
    Some(sum / period as f64)
}

/// Average True Range, Wilder-smoothed.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.len() < period + 1 {
        return None;
    }

    let tr_values: Vec<f64> = (1..bars.len())
        .map(|i| {
            let high = bars[i].high;
            let low = bars[i].low;
            let prev_close = bars[i - 1].close;
            (high - low).max(f64::abs(high - prev_close)).max(f64::abs(low - prev_close))
        })
        .collect();

    wilder_smooth(&tr_values, period)
}

/// Rounds a price down to the nearest multiple of `strike_increment`.
pub fn round_to_strike(price: f64, strike_increment: i32) -> i32 {
    let inc = strike_increment as f64;
    (f64::floor(price / inc) * inc) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_bars(count: usize) -> Vec<Bar> {
        (0..count)
            .map(|i| Bar {
                timestamp: Utc::now(),
                open: 19000.0 + i as f64 * 10.0,
                high: 19100.0 + i as f64 * 10.0,
                low: 18900.0 + i as f64 * 10.0,
                close: 19050.0 + i as f64 * 10.0,
                volume: 1_000_000,
            })
            .collect()
    }

    #[test]
    fn sma_requires_full_window() {
        let bars = test_bars(10);
        assert!(calculate_sma(&bars, 20).is_none());
        assert!(calculate_sma(&bars, 10).is_some());
    }

    #[test]
    fn atr_is_positive_for_varying_bars() {
        let bars = test_bars(30);
        let atr = calculate_atr(&bars, 14).unwrap();
        assert!(atr > 0.0);
    }

    #[test]
    fn round_to_strike_floors_to_increment() {
        assert_eq!(round_to_strike(19345.0, 50), 19300);
        assert_eq!(round_to_strike(19375.0, 50), 19350);
        assert_eq!(round_to_strike(19399.99, 50), 19350);
    }
}
