//! Analytics Engine (C3): pure computation over bar history and option-chain
//! snapshots. No I/O, no shared state — everything here is a deterministic
//! function of its inputs, grounded in `original_source/core/analytics.py`'s
//! formulas and reusing the teacher's bar-series helpers
//! (`strategy::indicators::{calculate_atr, calculate_sma}`).
use statrs::distribution::{Continuous, Normal};

use crate::broker::ChainRow;
use crate::error::{Result, TradingError};
use crate::strategy::indicators::{calculate_atr, calculate_sma};
use crate::types::{GexRegime, SkewRegime, StructMetrics, VixMomentum, VolMetrics};

const TRADING_DAYS: f64 = 252.0;
const MIN_HISTORY_DAYS: usize = 252;
const VIX_MOMENTUM_BREAKOUT: f64 = 4.0;
const VOV_CRASH_ZSCORE: f64 = 3.0;
const HIGH_VOL_IVP: f64 = 80.0;
const LOW_VOL_IVP: f64 = 20.0;
const GEX_STICKY_RATIO: f64 = 0.03;

fn log_returns(closes: &[f64]) -> Vec<f64> {
    closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn trailing_stdev_annualized(returns: &[f64], window: usize) -> f64 {
    if returns.len() < window {
        return 0.0;
    }
    let slice = &returns[returns.len() - window..];
    stdev(slice) * TRADING_DAYS.sqrt() * 100.0
}

/// GARCH(1,1) with normal innovations, fit by coarse grid search over
/// (alpha, beta) maximizing log-likelihood (`omega` set by variance targeting).
/// Returns the annualized volatility forecast `horizon` days ahead, or `None`
/// if the series is too short or no stationary (alpha+beta<1) pair fits.
fn fit_garch(returns: &[f64], horizon: u32) -> Option<f64> {
    if returns.len() < 100 {
        return None;
    }

    let window: Vec<f64> = returns.iter().rev().take(252).rev().map(|r| r * 100.0).collect();
    let long_run_var = window.iter().map(|r| r.powi(2)).sum::<f64>() / window.len() as f64;
    if long_run_var <= 0.0 {
        return None;
    }

    let mut best_ll = f64::NEG_INFINITY;
    let mut best: Option<(f64, f64)> = None;

    let mut alpha = 0.02;
    while alpha < 0.25 {
        let mut beta = 0.5;
        while beta < 0.98 - alpha {
            let omega = long_run_var * (1.0 - alpha - beta);
            if omega <= 0.0 {
                beta += 0.04;
                continue;
            }

            let mut variance = long_run_var;
            let mut log_likelihood = 0.0;
            for &r in &window {
                variance = omega + alpha * variance + beta * variance;
                let sigma = variance.sqrt().max(1e-6);
                if let Ok(normal) = Normal::new(0.0, sigma) {
                    log_likelihood += normal.ln_pdf(r);
                }
                variance = omega + alpha * r.powi(2) + beta * variance;
            }

            if log_likelihood > best_ll {
                best_ll = log_likelihood;
                best = Some((alpha, beta));
            }

            beta += 0.04;
        }
        alpha += 0.02;
    }

    let (alpha, beta) = best?;
    let omega = long_run_var * (1.0 - alpha - beta);

    let mut variance = long_run_var;
    for &r in &window {
        variance = omega + alpha * r.powi(2) + beta * variance;
    }

    // h-step-ahead forecast variance under GARCH(1,1) mean reversion to long_run_var.
    let persistence = alpha + beta;
    let mut forecast_var = variance;
    for _ in 1..horizon {
        forecast_var = long_run_var + persistence * (forecast_var - long_run_var);
    }

    Some((forecast_var / 10_000.0).sqrt() * TRADING_DAYS.sqrt() * 100.0)
}

fn parkinson_vol(bars: &[crate::types::Bar], window: usize) -> f64 {
    if bars.len() < window {
        return 0.0;
    }
    let const_factor = 1.0 / (4.0 * 2f64.ln());
    let mean_sq_log_range = bars[bars.len() - window..]
        .iter()
        .map(|b| (b.high / b.low).ln().powi(2))
        .sum::<f64>()
        / window as f64;

    (mean_sq_log_range * const_factor).sqrt() * TRADING_DAYS.sqrt() * 100.0
}

/// Computes the full volatility surface from NIFTY and VIX history plus live
/// ticks. `is_fallback` is set when either live value had to fall back to the
/// last historical close.
pub fn compute_vol(
    history_nifty: &[crate::types::Bar],
    history_vix: &[crate::types::Bar],
    live_spot: f64,
    live_vix: f64,
) -> Result<VolMetrics> {
    if history_nifty.len() < MIN_HISTORY_DAYS {
        return Err(TradingError::InsufficientHistory(format!(
            "NIFTY history has {} bars, need {MIN_HISTORY_DAYS}",
            history_nifty.len()
        )));
    }
    if history_vix.len() < MIN_HISTORY_DAYS {
        return Err(TradingError::InsufficientHistory(format!(
            "VIX history has {} bars, need {MIN_HISTORY_DAYS}",
            history_vix.len()
        )));
    }

    let mut fallback = false;
    let spot = if live_spot > 0.0 {
        live_spot
    } else {
        fallback = true;
        history_nifty.last().unwrap().close
    };
    let vix = if live_vix > 0.0 {
        live_vix
    } else {
        fallback = true;
        history_vix.last().unwrap().close
    };

    let nifty_closes: Vec<f64> = history_nifty.iter().map(|b| b.close).collect();
    let returns = log_returns(&nifty_closes);

    let rv7 = trailing_stdev_annualized(&returns, 7);
    let rv28 = trailing_stdev_annualized(&returns, 28);
    let rv90 = trailing_stdev_annualized(&returns, 90);

    let garch7 = fit_garch(&returns, 7).unwrap_or(rv7);
    let garch28 = fit_garch(&returns, 28).unwrap_or(rv28);

    let parkinson7 = parkinson_vol(history_nifty, 7);
    let parkinson28 = parkinson_vol(history_nifty, 28);

    let vix_closes: Vec<f64> = history_vix.iter().map(|b| b.close).collect();
    let vix_returns = log_returns(&vix_closes);

    let vov = trailing_stdev_annualized(&vix_returns, 30);
    let vov_rolling: Vec<f64> = if vix_returns.len() >= 30 {
        (29..vix_returns.len()).map(|i| stdev(&vix_returns[i - 29..=i]) * TRADING_DAYS.sqrt() * 100.0).collect()
    } else {
        Vec::new()
    };
    let (vov_mean, vov_std) = if vov_rolling.len() >= 60 {
        let window = &vov_rolling[vov_rolling.len() - 60..];
        (window.iter().sum::<f64>() / window.len() as f64, stdev(window))
    } else {
        (vov, 1.0)
    };
    let vov_zscore = if vov_std > 0.0 { (vov - vov_mean) / vov_std } else { 0.0 };

    let ivp = |window: usize| -> f64 {
        if vix_closes.len() < window {
            return 0.0;
        }
        let slice = &vix_closes[vix_closes.len() - window..];
        slice.iter().filter(|&&c| c < vix).count() as f64 / slice.len() as f64 * 100.0
    };
    let ivp_30 = ivp(30);
    let ivp_90 = ivp(90);
    let ivp_252 = ivp(252);

    let ma20 = calculate_sma(history_nifty, 20).unwrap_or(spot);
    let atr14 = calculate_atr(history_nifty, 14).unwrap_or(0.0);

    let vix_5d_change = if history_vix.len() >= 6 { vix - history_vix[history_vix.len() - 6].close } else { 0.0 };

    let vix_momentum = if vix_5d_change > VIX_MOMENTUM_BREAKOUT {
        VixMomentum::ExplosiveUp
    } else if vix_5d_change < -VIX_MOMENTUM_BREAKOUT {
        VixMomentum::Collapsing
    } else {
        VixMomentum::Stable
    };

    let vol_regime = if vov_zscore > VOV_CRASH_ZSCORE {
        "EXPLODING"
    } else if ivp_252 > HIGH_VOL_IVP {
        "RICH"
    } else if ivp_252 < LOW_VOL_IVP {
        "CHEAP"
    } else {
        "FAIR"
    }
    .to_string();

    Ok(VolMetrics {
        rv7,
        rv28,
        rv90,
        garch7,
        garch28,
        parkinson7,
        parkinson28,
        vix,
        vix_5d_change,
        vov,
        vov_zscore,
        ivp_30,
        ivp_90,
        ivp_252,
        ma20,
        atr14,
        vol_regime,
        vix_momentum,
        fallback,
    })
}

/// Computes gamma exposure, put-call ratios, skew, and max pain from a chain
/// snapshot. An empty chain or non-positive spot returns a neutral fallback
/// rather than erroring, matching the teacher's defensive default.
pub fn compute_struct(chain: &[ChainRow], spot: f64) -> StructMetrics {
    if chain.is_empty() || spot <= 0.0 {
        return StructMetrics {
            net_gex: 0.0,
            max_gex_strike: spot.round() as i32,
            gex_ratio: 0.0,
            gex_regime: GexRegime::Slippery,
            pcr: 1.0,
            pcr_atm: 1.0,
            skew_25d: 0.0,
            skew_regime: SkewRegime::Balanced,
            max_pain_strike: spot.round() as i32,
            atm_iv: 0.20,
        };
    }

    use crate::types::OptionType;

    let calls: Vec<&ChainRow> = chain.iter().filter(|r| r.option_type == OptionType::Call).collect();
    let puts: Vec<&ChainRow> = chain.iter().filter(|r| r.option_type == OptionType::Put).collect();

    let total_call_gex: f64 = calls.iter().map(|r| r.oi as f64 * r.gamma.max(0.0) * spot.powi(2) * 0.01).sum();
    let total_put_gex: f64 = puts.iter().map(|r| r.oi as f64 * r.gamma.max(0.0) * spot.powi(2) * 0.01).sum();
    let net_gex = total_call_gex - total_put_gex;
    let gex_ratio = net_gex.abs() / spot.powi(2);

    let strikes: std::collections::BTreeSet<i32> = chain.iter().map(|r| r.strike).collect();
    let max_gex_strike = strikes
        .iter()
        .map(|&strike| {
            let call_gex: f64 = calls.iter().filter(|r| r.strike == strike).map(|r| r.oi as f64 * r.gamma.max(0.0) * spot.powi(2) * 0.01).sum();
            let put_gex: f64 = puts.iter().filter(|r| r.strike == strike).map(|r| r.oi as f64 * r.gamma.max(0.0) * spot.powi(2) * 0.01).sum();
            (strike, (call_gex - put_gex).abs())
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(strike, _)| strike)
        .unwrap_or_else(|| spot.round() as i32);

    let gex_regime = if gex_ratio > GEX_STICKY_RATIO { GexRegime::Sticky } else { GexRegime::Slippery };

    let total_call_oi: i64 = calls.iter().map(|r| r.oi).sum();
    let total_put_oi: i64 = puts.iter().map(|r| r.oi).sum();
    let pcr = if total_call_oi > 0 { total_put_oi as f64 / total_call_oi as f64 } else { 1.0 };

    let atm_band = spot * 0.02;
    let atm_call_oi: i64 = calls.iter().filter(|r| (r.strike as f64 - spot).abs() <= atm_band).map(|r| r.oi).sum();
    let atm_put_oi: i64 = puts.iter().filter(|r| (r.strike as f64 - spot).abs() <= atm_band).map(|r| r.oi).sum();
    let pcr_atm = if atm_call_oi > 0 { atm_put_oi as f64 / atm_call_oi as f64 } else { pcr };

    let otm_call_25d = calls
        .iter()
        .filter(|r| r.delta.abs() > 0.20 && r.delta.abs() < 0.30 && r.iv > 0.0)
        .min_by(|a, b| (a.delta.abs() - 0.25).abs().total_cmp(&(b.delta.abs() - 0.25).abs()));
    let otm_put_25d = puts
        .iter()
        .filter(|r| r.delta.abs() > 0.20 && r.delta.abs() < 0.30 && r.iv > 0.0)
        .min_by(|a, b| (a.delta.abs() - 0.25).abs().total_cmp(&(b.delta.abs() - 0.25).abs()));

    let skew_25d = match (otm_put_25d, otm_call_25d) {
        (Some(put), Some(call)) => put.iv - call.iv,
        _ => 0.0,
    };

    let skew_regime = if skew_25d > 3.0 {
        SkewRegime::CrashFear
    } else if skew_25d < -1.0 {
        SkewRegime::MeltUp
    } else {
        SkewRegime::Balanced
    };

    let max_pain_strike = strikes
        .iter()
        .map(|&candidate| {
            let loss: f64 = chain
                .iter()
                .map(|row| match row.option_type {
                    OptionType::Call if candidate > row.strike => row.oi as f64 * (candidate - row.strike) as f64,
                    OptionType::Put if candidate < row.strike => row.oi as f64 * (row.strike - candidate) as f64,
                    _ => 0.0,
                })
                .sum();
            (candidate, loss)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(strike, _)| strike)
        .unwrap_or_else(|| spot.round() as i32);

    let atm_band_1pct = spot * 0.01;
    let atm_rows: Vec<&ChainRow> = chain.iter().filter(|r| (r.strike as f64 - spot).abs() < atm_band_1pct).collect();
    let atm_iv = if atm_rows.is_empty() {
        0.20
    } else {
        atm_rows.iter().map(|r| r.iv).sum::<f64>() / atm_rows.len() as f64
    };

    StructMetrics {
        net_gex,
        max_gex_strike,
        gex_ratio,
        gex_regime,
        pcr,
        pcr_atm,
        skew_25d,
        skew_regime,
        max_pain_strike,
        atm_iv,
    }
}

fn weight_vrp_by_dte(vrp: f64, dte: i64) -> f64 {
    match dte {
        d if d <= 0 => 0.0,
        1 => vrp * 0.3,
        2 => vrp * 0.5,
        d if d <= 7 => vrp * 0.8,
        _ => vrp,
    }
}

/// Computes volatility risk premium and term-structure edge for the three
/// candidate expiries, selecting the one with the best DTE-normalized score.
pub fn compute_edge(
    vol: &VolMetrics,
    dte_weekly: i64,
    dte_monthly: i64,
    dte_next_weekly: i64,
) -> crate::types::EdgeMetrics {
    let vrp = vol.vix - vol.rv28;

    let weighted_vrp_weekly = weight_vrp_by_dte(vrp, dte_weekly);
    let weighted_vrp_monthly = weight_vrp_by_dte(vrp, dte_monthly);
    let weighted_vrp_next_weekly = weight_vrp_by_dte(vrp, dte_next_weekly);

    let term_structure_edge = if vol.garch7 > 0.0 && vol.garch28 > 0.0 { vol.garch7 - vol.garch28 } else { 0.0 };

    let candidates = [
        ("WEEKLY", weighted_vrp_weekly, dte_weekly),
        ("NEXT_WEEKLY", weighted_vrp_next_weekly, dte_next_weekly),
        ("MONTHLY", weighted_vrp_monthly, dte_monthly),
    ];

    let selected_expiry_label = candidates
        .iter()
        .filter(|(_, _, dte)| *dte > 0)
        .max_by(|a, b| (a.1 / (a.2 + 1) as f64).total_cmp(&(b.1 / (b.2 + 1) as f64)))
        .map(|(label, _, _)| label.to_string())
        .unwrap_or_else(|| "WEEKLY".to_string());

    crate::types::EdgeMetrics {
        vrp,
        weighted_vrp_weekly,
        weighted_vrp_monthly,
        weighted_vrp_next_weekly,
        term_structure_edge,
        selected_expiry_label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;
    use chrono::Utc;

    fn synthetic_history(days: usize, base: f64, daily_vol: f64) -> Vec<Bar> {
        let mut price = base;
        (0..days)
            .map(|i| {
                let drift = (i as f64 * 0.013).sin() * daily_vol * base;
                price += drift;
                Bar {
                    timestamp: Utc::now(),
                    open: price,
                    high: price + daily_vol * base * 0.5,
                    low: price - daily_vol * base * 0.5,
                    close: price,
                    volume: 1_000_000,
                }
            })
            .collect()
    }

    #[test]
    fn compute_vol_requires_minimum_history() {
        let short = synthetic_history(100, 20000.0, 0.01);
        let vix = synthetic_history(300, 14.0, 0.02);
        assert!(compute_vol(&short, &vix, 20000.0, 14.0).is_err());
    }

    #[test]
    fn compute_vol_succeeds_with_sufficient_history() {
        let nifty = synthetic_history(300, 20000.0, 0.01);
        let vix = synthetic_history(300, 14.0, 0.02);
        let vol = compute_vol(&nifty, &vix, 20050.0, 13.5).unwrap();
        assert!(vol.rv28 >= 0.0);
        assert!(!vol.fallback);
    }

    #[test]
    fn compute_vol_falls_back_to_last_close_when_live_missing() {
        let nifty = synthetic_history(300, 20000.0, 0.01);
        let vix = synthetic_history(300, 14.0, 0.02);
        let vol = compute_vol(&nifty, &vix, 0.0, 14.0).unwrap();
        assert!(vol.fallback);
    }

    fn chain_row(strike: i32, option_type: crate::types::OptionType, oi: i64, gamma: f64, delta: f64, iv: f64) -> ChainRow {
        ChainRow {
            instrument_key: format!("{strike}{}", option_type.as_str()),
            strike,
            option_type,
            expiry: chrono::Utc::now().date_naive(),
            ltp: 100.0,
            bid: 99.0,
            ask: 101.0,
            oi,
            iv,
            delta,
            theta: -2.0,
            gamma,
            vega: 5.0,
            lot_size: 75,
        }
    }

    #[test]
    fn compute_struct_empty_chain_returns_neutral_fallback() {
        let metrics = compute_struct(&[], 20000.0);
        assert_eq!(metrics.gex_regime, GexRegime::Slippery);
        assert_eq!(metrics.pcr, 1.0);
    }

    #[test]
    fn compute_struct_computes_pcr_from_chain() {
        use crate::types::OptionType;
        let chain = vec![
            chain_row(20000, OptionType::Call, 10_000, 0.002, 0.45, 0.13),
            chain_row(20000, OptionType::Put, 20_000, 0.002, -0.45, 0.14),
            chain_row(19500, OptionType::Put, 5_000, 0.001, -0.25, 0.16),
            chain_row(20500, OptionType::Call, 5_000, 0.001, 0.25, 0.12),
        ];
        let metrics = compute_struct(&chain, 20000.0);
        assert!(metrics.pcr > 1.0);
    }
}
