//! Regime Engine (C5): dynamic weights, 0-10 sub-scoring, and mandate
//! generation. Scoring tables and weight-adjustment rules are preserved
//! from `original_source/core/regime.py`, with thresholds taken from
//! SPEC_FULL.md where the two disagree (see DESIGN.md).
use crate::config::Config;
use crate::types::{
    Confidence, DirectionalBias, DynamicWeights, EdgeMetrics, ExternalMetrics, GexRegime, Score,
    SkewRegime, Structure, StructMetrics, TradingMandate, VixMomentum, VolMetrics,
};
use crate::ExpiryKind;

const VOV_CRASH_ZSCORE: f64 = 2.5;
const VOV_WARNING_ZSCORE: f64 = 2.0;
const HIGH_VOL_IVP: f64 = 75.0;
const LOW_VOL_IVP: f64 = 25.0;
const GAMMA_DANGER_DTE: i64 = 1;
const FII_STRONG: f64 = 50_000.0;
const FII_MODERATE: f64 = 20_000.0;

fn fii_net(external: &ExternalMetrics) -> f64 {
    external.fii_net_futures + external.fii_net_options
}

/// Adaptive weight vector for the composite score, adjusted for the
/// current volatility/structure/expiry/flow context and renormalized.
pub fn calculate_dynamic_weights(
    vol: &VolMetrics,
    struct_m: &StructMetrics,
    external: &ExternalMetrics,
    dte: i64,
) -> DynamicWeights {
    let mut weights = if vol.vov_zscore > VOV_CRASH_ZSCORE {
        DynamicWeights { vol: 0.50, struct_: 0.25, edge: 0.15, risk: 0.10 }
    } else if vol.vov_zscore > VOV_WARNING_ZSCORE {
        DynamicWeights { vol: 0.45, struct_: 0.28, edge: 0.17, risk: 0.10 }
    } else if vol.ivp_252 > HIGH_VOL_IVP {
        DynamicWeights { vol: 0.35, struct_: 0.35, edge: 0.20, risk: 0.10 }
    } else if vol.ivp_252 < LOW_VOL_IVP {
        DynamicWeights { vol: 0.30, struct_: 0.30, edge: 0.30, risk: 0.10 }
    } else {
        DynamicWeights { vol: 0.40, struct_: 0.30, edge: 0.20, risk: 0.10 }
    };

    match vol.vix_momentum {
        VixMomentum::ExplosiveUp => {
            weights.vol += 0.05;
            weights.edge -= 0.05;
        }
        VixMomentum::Collapsing => {
            weights.vol -= 0.05;
            weights.edge += 0.05;
        }
        VixMomentum::Stable => {}
    }

    match struct_m.gex_regime {
        GexRegime::Sticky => {
            weights.struct_ += 0.05;
            weights.vol -= 0.05;
        }
        GexRegime::Slippery => {
            weights.vol += 0.05;
            weights.struct_ -= 0.05;
        }
    }

    if dte <= GAMMA_DANGER_DTE {
        weights.struct_ += 0.10;
        weights.edge -= 0.05;
        weights.risk -= 0.05;
    }

    if fii_net(external).abs() > FII_STRONG {
        weights.risk += 0.05;
        weights.edge -= 0.05;
    }

    weights.normalized()
}

fn clamp_score(score: f64) -> f64 {
    score.max(0.0).min(10.0)
}

fn vol_score(vol: &VolMetrics) -> f64 {
    let mut score = 5.0;

    if vol.vov_zscore > VOV_CRASH_ZSCORE {
        score = 0.0;
    } else if vol.vov_zscore > VOV_WARNING_ZSCORE {
        score -= 3.0;
    } else if vol.vov_zscore < 1.5 {
        score += 1.5;
    }

    if vol.ivp_252 > HIGH_VOL_IVP {
        if vol.vix_5d_change < 0.0 {
            score += 1.5;
        } else if vol.vix_5d_change > 0.0 {
            score -= 1.0;
        } else {
            score += 0.5;
        }
    } else if vol.ivp_252 < LOW_VOL_IVP {
        score -= 2.5;
    } else {
        score += 1.0;
    }

    match vol.vix_momentum {
        VixMomentum::ExplosiveUp => score -= 2.0,
        VixMomentum::Collapsing => score += 1.0,
        VixMomentum::Stable => {}
    }

    if vol.garch28 > vol.rv28 * 1.2 {
        score += 0.5;
    }

    clamp_score(score)
}

fn struct_score(struct_m: &StructMetrics, spot: f64) -> f64 {
    let mut score = 5.0;

    match struct_m.gex_regime {
        GexRegime::Sticky => score += 2.5,
        GexRegime::Slippery => score -= 1.0,
    }

    if struct_m.pcr_atm > 0.9 && struct_m.pcr_atm < 1.1 {
        score += 1.5;
    } else if struct_m.pcr_atm > 1.3 {
        score += 0.5;
    } else if struct_m.pcr_atm < 0.7 {
        score -= 0.5;
    }

    match struct_m.skew_regime {
        SkewRegime::CrashFear => score -= 1.0,
        SkewRegime::MeltUp => score -= 0.5,
        SkewRegime::Balanced => score += 0.5,
    }

    if spot > 0.0 && ((struct_m.max_pain_strike as f64 - spot).abs() / spot) < 0.01 {
        score += 1.0;
    }

    clamp_score(score)
}

fn edge_score(edge: &EdgeMetrics) -> f64 {
    let mut score = 5.0;

    let weighted_vrp = edge.weighted_vrp_monthly;
    if weighted_vrp > 5.0 {
        score += 3.0;
    } else if weighted_vrp > 2.0 {
        score += 1.5;
    } else if weighted_vrp < -2.0 {
        score -= 2.0;
    } else {
        score += 0.5;
    }

    if edge.term_structure_edge < -2.0 {
        score -= 1.0;
    } else if edge.term_structure_edge > 2.0 {
        score += 0.5;
    }

    clamp_score(score)
}

fn risk_score(external: &ExternalMetrics) -> f64 {
    let mut score = 5.0;
    let fii = fii_net(external);

    if fii > FII_STRONG {
        score += 1.0;
    } else if fii < -FII_STRONG {
        score -= 1.0;
    } else if fii.abs() > FII_MODERATE {
        score += if fii > 0.0 { 0.5 } else { -0.5 };
    }

    clamp_score(score)
}

/// Composite score plus a stability measure computed against three
/// alternate weight sets, and the confidence band they imply.
pub fn calculate_scores(
    vol: &VolMetrics,
    struct_m: &StructMetrics,
    edge: &EdgeMetrics,
    external: &ExternalMetrics,
    spot: f64,
    dte: i64,
    high_impact_event_count: usize,
) -> Score {
    let mut drivers = Vec::new();

    let vol_s = vol_score(vol);
    drivers.push(format!("Vol: {:.1}", vol_s));

    let struct_s = struct_score(struct_m, spot);
    drivers.push(format!("Struct: {:.1}", struct_s));

    let edge_s = edge_score(edge);
    drivers.push(format!("Edge: {:.1}", edge_s));

    let mut risk_s = risk_score(external);
    if high_impact_event_count > 0 {
        risk_s -= (high_impact_event_count as f64 * 0.5).min(2.0);
        risk_s = clamp_score(risk_s);
    }
    drivers.push(format!("Risk: {:.1}", risk_s));

    let weights = calculate_dynamic_weights(vol, struct_m, external, dte);

    let composite =
        vol_s * weights.vol + struct_s * weights.struct_ + edge_s * weights.edge + risk_s * weights.risk;

    let alt_weight_sets = [(0.30, 0.35, 0.25, 0.10), (0.50, 0.25, 0.15, 0.10), (0.35, 0.30, 0.25, 0.10)];
    let alt_scores: Vec<f64> = alt_weight_sets
        .iter()
        .map(|(wv, ws, we, wr)| vol_s * wv + struct_s * ws + edge_s * we + risk_s * wr)
        .collect();

    let mean = alt_scores.iter().sum::<f64>() / alt_scores.len() as f64;
    let stability = if mean > 0.0 {
        let variance = alt_scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / alt_scores.len() as f64;
        (1.0 - variance.sqrt() / mean).max(0.0).min(1.0)
    } else {
        0.5
    };

    let confidence = if composite >= 8.0 && stability > 0.85 {
        Confidence::VeryHigh
    } else if composite >= 6.5 && stability > 0.75 {
        Confidence::High
    } else if composite >= 4.0 {
        Confidence::Moderate
    } else {
        Confidence::Low
    };

    drivers.push(format!(
        "Composite: {:.2}/10 [V:{:.1}x{:.0}% S:{:.1}x{:.0}% E:{:.1}x{:.0}% R:{:.1}x{:.0}%]",
        composite,
        vol_s,
        weights.vol * 100.0,
        struct_s,
        weights.struct_ * 100.0,
        edge_s,
        weights.edge * 100.0,
        risk_s,
        weights.risk * 100.0
    ));

    Score { vol: vol_s, struct_: struct_s, edge: edge_s, risk: risk_s, composite, confidence, score_stability: stability, drivers }
}

fn regime_name(vol: &VolMetrics) -> String {
    if vol.vov_zscore > VOV_CRASH_ZSCORE {
        "VOL_SPIKE".to_string()
    } else if vol.ivp_252 > HIGH_VOL_IVP {
        "HIGH_VOL".to_string()
    } else if vol.ivp_252 < LOW_VOL_IVP {
        "LOW_VOL".to_string()
    } else {
        "NORMAL".to_string()
    }
}

/// Selects a structure, allocation percentage, and directional bias from
/// the composite score and confidence band, then applies size multipliers
/// and the capital cap to produce the final mandate.
pub fn generate_mandate(
    expiry_kind: ExpiryKind,
    score: &Score,
    vol: &VolMetrics,
    struct_m: &StructMetrics,
    edge: &EdgeMetrics,
    dte: i64,
    high_impact_event_count: usize,
    mut veto_reasons: Vec<String>,
    config: &Config,
) -> TradingMandate {
    let mut rationale = Vec::new();
    let mut warnings = Vec::new();

    let high_confidence = matches!(score.confidence, Confidence::High | Confidence::VeryHigh);

    let (structure, directional_bias, mut allocation_pct) = if score.composite >= 7.5 && high_confidence && dte > 2 {
        rationale.push(format!("Very high confidence ({:?}): monthly VRP {:.2}%", score.confidence, edge.weighted_vrp_monthly));
        (Structure::IronCondor, DirectionalBias::Neutral, 60.0)
    } else if score.composite >= 7.5 && high_confidence {
        rationale.push("High VRP with near expiry: gamma harvest".to_string());
        warnings.push("gamma risk, monitor closely".to_string());
        (Structure::IronFly, DirectionalBias::Neutral, 50.0)
    } else if score.composite >= 6.0 && high_confidence && dte > 1 {
        rationale.push(format!("Moderate confidence: monthly VRP {:.2}%", edge.weighted_vrp_monthly));
        (Structure::IronCondor, DirectionalBias::Neutral, 40.0)
    } else if score.composite >= 6.0 && high_confidence {
        warnings.push("expiry risk, monitor gamma".to_string());
        (Structure::IronFly, DirectionalBias::Neutral, 35.0)
    } else if score.composite >= 4.0 {
        rationale.push("Defensive posture, lower conviction".to_string());
        warnings.push("lower conviction, reduced size".to_string());
        if struct_m.pcr_atm > 1.3 {
            (Structure::BullPutSpread, DirectionalBias::Bullish, 20.0)
        } else if struct_m.pcr_atm < 0.7 {
            (Structure::BearCallSpread, DirectionalBias::Bearish, 20.0)
        } else {
            (Structure::CreditSpread, DirectionalBias::Neutral, 20.0)
        }
    } else {
        rationale.push("Regime unfavorable: cash is a position".to_string());
        veto_reasons.push("low composite score".to_string());
        (Structure::NoTrade, DirectionalBias::Neutral, 0.0)
    };

    if vol.vov_zscore > VOV_WARNING_ZSCORE {
        warnings.push(format!("high vol-of-vol ({:.2}sigma), size reduced 30%", vol.vov_zscore));
        allocation_pct *= 0.7;
    }

    if matches!(vol.vix_momentum, VixMomentum::ExplosiveUp) {
        warnings.push(format!("VIX explosive ({:.1}), size reduced 40%", vol.vix));
        allocation_pct *= 0.6;
    }

    if score.score_stability < 0.75 {
        warnings.push(format!("low score stability ({:.2}), size reduced 20%", score.score_stability));
        allocation_pct *= 0.8;
    }

    if high_impact_event_count > 0 {
        warnings.push(format!("{} high impact event(s) this week", high_impact_event_count));
        allocation_pct *= 0.85;
    }

    allocation_pct = allocation_pct.max(0.0).min(100.0);
    let mut deployment_amount = config.base_capital * (allocation_pct / 100.0);

    if deployment_amount > config.max_capital_per_trade {
        deployment_amount = config.max_capital_per_trade;
        warnings.push(format!("capital capped at {:.0}", config.max_capital_per_trade));
    }

    let max_lots = (deployment_amount / config.margin_sell_base).floor() as i32;

    TradingMandate {
        expiry_kind,
        regime_name: regime_name(vol),
        structure,
        directional_bias,
        allocation_pct,
        deployment_amount,
        max_lots,
        score: score.clone(),
        rationale,
        warnings,
        veto_reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExpiryKind, GexRegime, SkewRegime, VixMomentum};

    fn calm_vol() -> VolMetrics {
        VolMetrics {
            rv7: 10.0,
            rv28: 11.0,
            rv90: 12.0,
            garch7: 10.5,
            garch28: 11.5,
            parkinson7: 10.0,
            parkinson28: 11.0,
            vix: 13.0,
            vix_5d_change: -0.5,
            vov: 1.0,
            vov_zscore: 0.5,
            ivp_30: 40.0,
            ivp_90: 45.0,
            ivp_252: 50.0,
            ma20: 19000.0,
            atr14: 100.0,
            vol_regime: "NORMAL".to_string(),
            vix_momentum: VixMomentum::Stable,
            fallback: false,
        }
    }

    fn balanced_struct() -> StructMetrics {
        StructMetrics {
            net_gex: 1.0e9,
            max_gex_strike: 19000,
            gex_ratio: 0.04,
            gex_regime: GexRegime::Sticky,
            pcr: 1.0,
            pcr_atm: 1.0,
            skew_25d: 0.5,
            skew_regime: SkewRegime::Balanced,
            max_pain_strike: 19000,
            atm_iv: 13.0,
        }
    }

    fn neutral_edge() -> EdgeMetrics {
        EdgeMetrics {
            vrp: 2.0,
            weighted_vrp_weekly: 1.0,
            weighted_vrp_monthly: 1.0,
            weighted_vrp_next_weekly: 1.0,
            term_structure_edge: 0.0,
            selected_expiry_label: "WEEKLY".to_string(),
        }
    }

    fn quiet_external() -> ExternalMetrics {
        ExternalMetrics { fii_net_futures: 1000.0, fii_net_options: 500.0, dii_net_futures: 0.0, dii_net_options: 0.0, data_relevance: true }
    }

    fn test_config() -> Config {
        std::env::set_var("VG_DRY_RUN", "true");
        crate::config::loader::load_config().expect("config loads")
    }

    #[test]
    fn weights_sum_to_one() {
        let weights = calculate_dynamic_weights(&calm_vol(), &balanced_struct(), &quiet_external(), 10);
        assert!((weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn vov_crash_zeroes_vol_score_and_shifts_weight_to_vol() {
        let mut vol = calm_vol();
        vol.vov_zscore = 3.0;
        assert_eq!(vol_score(&vol), 0.0);
        let weights = calculate_dynamic_weights(&vol, &balanced_struct(), &quiet_external(), 10);
        assert!(weights.vol > 0.45);
    }

    #[test]
    fn high_composite_high_confidence_selects_iron_condor() {
        let vol = calm_vol();
        let struct_m = balanced_struct();
        let edge = EdgeMetrics { weighted_vrp_monthly: 6.0, ..neutral_edge() };
        let external = quiet_external();
        let score = calculate_scores(&vol, &struct_m, &edge, &external, 19000.0, 10, 0);
        let config = test_config();
        let mandate = generate_mandate(ExpiryKind::Monthly, &score, &vol, &struct_m, &edge, 10, 0, Vec::new(), &config);
        if score.composite >= 7.5 && matches!(score.confidence, Confidence::High | Confidence::VeryHigh) {
            assert_eq!(mandate.structure, Structure::IronCondor);
        }
    }

    #[test]
    fn low_composite_is_no_trade_and_vetoed() {
        let vol = VolMetrics { ivp_252: 50.0, vov_zscore: 0.2, ..calm_vol() };
        let struct_m = StructMetrics { gex_regime: GexRegime::Slippery, skew_regime: SkewRegime::CrashFear, pcr_atm: 1.0, ..balanced_struct() };
        let edge = EdgeMetrics { weighted_vrp_monthly: -3.0, term_structure_edge: -3.0, ..neutral_edge() };
        let external = quiet_external();
        let score = calculate_scores(&vol, &struct_m, &edge, &external, 19000.0, 10, 0);
        let config = test_config();
        let mandate = generate_mandate(ExpiryKind::Monthly, &score, &vol, &struct_m, &edge, 10, 0, Vec::new(), &config);
        if score.composite < 4.0 {
            assert!(mandate.is_vetoed());
            assert_eq!(mandate.structure, Structure::NoTrade);
        }
    }

    #[test]
    fn deployment_is_capped_at_max_capital_per_trade() {
        let vol = calm_vol();
        let struct_m = balanced_struct();
        let edge = EdgeMetrics { weighted_vrp_monthly: 6.0, ..neutral_edge() };
        let score = Score {
            vol: 9.0,
            struct_: 9.0,
            edge: 9.0,
            risk: 9.0,
            composite: 9.0,
            confidence: Confidence::VeryHigh,
            score_stability: 0.95,
            drivers: vec![],
        };
        let mut config = test_config();
        config.base_capital = 10_000_000.0;
        config.max_capital_per_trade = 200_000.0;
        let mandate = generate_mandate(ExpiryKind::Monthly, &score, &vol, &struct_m, &edge, 10, 0, Vec::new(), &config);
        assert!(mandate.deployment_amount <= config.max_capital_per_trade);
    }
}
