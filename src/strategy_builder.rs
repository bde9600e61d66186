//! Strategy Builder (C6): turns a `TradingMandate` plus a live option chain
//! into concrete `OptionLeg`s. Structure shapes are grounded on
//! `original_source/core/strategy_builder.py`; the Iron Condor delta-targeting
//! and the defined-risk rejection are SPEC_FULL §4.6's fuller algorithm, not
//! the source's fixed-delta/fixed-wing version (see DESIGN.md).
use chrono::NaiveDate;

use crate::broker::ChainRow;
use crate::config::Config;
use crate::strategy::round_to_strike;
use crate::types::{LegRole, OptionLeg, OptionType, Side, Structure, TradingMandate};

const MIN_OI: i64 = 1000;
const MIN_LTP: f64 = 0.1;
const CONDOR_MIN_LTP: f64 = 0.5;
const CONDOR_MAX_SPREAD_PCT: f64 = 0.05;
const CONDOR_SHORT_DELTA_WEEKLY: f64 = 0.20;
const CONDOR_SHORT_DELTA_MONTHLY: f64 = 0.16;
const CONDOR_WING_DELTA: f64 = 0.05;
const DIRECTIONAL_SHORT_DELTA: f64 = 0.30;
const DIRECTIONAL_HEDGE_DELTA: f64 = 0.10;

fn leg_from_row(row: &ChainRow, side: Side, role: LegRole, quantity: i32) -> OptionLeg {
    OptionLeg {
        instrument_key: row.instrument_key.clone(),
        option_type: row.option_type,
        strike: row.strike,
        side,
        quantity,
        role,
        reference_premium: row.ltp,
        lot_size: row.lot_size,
        expiry: row.expiry,
        order_id: None,
        filled_qty: 0,
        avg_fill_price: None,
    }
}

fn rows_of(chain: &[ChainRow], option_type: OptionType) -> Vec<&ChainRow> {
    chain.iter().filter(|r| r.option_type == option_type).collect()
}

/// Strike interval as the mode of successive differences between sorted
/// unique strikes in the chain. Falls back to 50 (Nifty's usual increment)
/// if fewer than two distinct strikes are present.
fn discover_strike_interval(chain: &[ChainRow]) -> i32 {
    let mut strikes: Vec<i32> = chain.iter().map(|r| r.strike).collect();
    strikes.sort_unstable();
    strikes.dedup();

    if strikes.len() < 2 {
        return 50;
    }

    let mut diff_counts: std::collections::HashMap<i32, u32> = std::collections::HashMap::new();
    for window in strikes.windows(2) {
        *diff_counts.entry(window[1] - window[0]).or_insert(0) += 1;
    }

    diff_counts.into_iter().max_by_key(|(_, count)| *count).map(|(diff, _)| diff).unwrap_or(50)
}

fn find_row<'a>(rows: &[&'a ChainRow], strike: i32) -> Option<&'a ChainRow> {
    rows.iter().find(|r| r.strike == strike).copied()
}

fn is_tradeable(row: &ChainRow) -> bool {
    row.oi >= MIN_OI && row.ltp > MIN_LTP
}

/// Among {geometric ATM, ATM+interval, ATM-interval}, the strike with both
/// legs liquid whose call/put premiums are closest together.
fn find_professional_atm(calls: &[&ChainRow], puts: &[&ChainRow], spot: f64, interval: i32) -> Option<i32> {
    let geometric_atm = round_to_strike(spot, interval);
    let candidates = [geometric_atm, geometric_atm + interval, geometric_atm - interval];

    candidates
        .iter()
        .filter_map(|&strike| {
            let call = find_row(calls, strike)?;
            let put = find_row(puts, strike)?;
            if is_tradeable(call) && is_tradeable(put) {
                Some((strike, (call.ltp - put.ltp).abs()))
            } else {
                None
            }
        })
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .map(|(strike, _)| strike)
}

fn wing_factor(ivp_1yr: f64) -> f64 {
    if ivp_1yr > 80.0 {
        1.4
    } else if ivp_1yr > 50.0 {
        1.1
    } else if ivp_1yr < 20.0 {
        0.8
    } else {
        1.0
    }
}

fn build_iron_fly(chain: &[ChainRow], spot: f64, ivp_1yr: f64, max_lots: i32) -> Vec<OptionLeg> {
    let calls = rows_of(chain, OptionType::Call);
    let puts = rows_of(chain, OptionType::Put);

    let interval = discover_strike_interval(chain);
    let Some(atm) = find_professional_atm(&calls, &puts, spot, interval) else {
        return Vec::new();
    };

    let Some(atm_call) = find_row(&calls, atm) else { return Vec::new() };
    let Some(atm_put) = find_row(&puts, atm) else { return Vec::new() };

    let straddle_cost = atm_call.ltp + atm_put.ltp;
    let mut wing_width = straddle_cost * wing_factor(ivp_1yr);
    wing_width = (wing_width / interval as f64).round() * interval as f64;
    wing_width = wing_width.max(2.0 * interval as f64);
    let wing_width = wing_width.round() as i32;

    let call_wing_strike = atm + wing_width;
    let put_wing_strike = atm - wing_width;

    let Some(call_wing) = find_row(&calls, call_wing_strike) else { return Vec::new() };
    let Some(put_wing) = find_row(&puts, put_wing_strike) else { return Vec::new() };

    let quantity = max_lots * atm_call.lot_size;

    vec![
        leg_from_row(atm_call, Side::Sell, LegRole::Core, quantity),
        leg_from_row(atm_put, Side::Sell, LegRole::Core, quantity),
        leg_from_row(call_wing, Side::Buy, LegRole::Hedge, quantity),
        leg_from_row(put_wing, Side::Buy, LegRole::Hedge, quantity),
    ]
}

/// Filters to liquid, tight-spread rows, then returns the most liquid (by
/// OI) of the 3 candidates whose |delta| is nearest `target_delta`.
fn find_short_by_delta<'a>(rows: &[&'a ChainRow], target_delta: f64) -> Option<&'a ChainRow> {
    let mut candidates: Vec<&ChainRow> = rows
        .iter()
        .filter(|r| {
            r.oi >= MIN_OI
                && r.ltp > CONDOR_MIN_LTP
                && r.ltp > 0.0
                && (r.ask - r.bid) <= CONDOR_MAX_SPREAD_PCT * r.ltp
        })
        .copied()
        .collect();

    candidates.sort_by(|a, b| {
        (a.delta.abs() - target_delta).abs().partial_cmp(&(b.delta.abs() - target_delta).abs()).unwrap()
    });
    candidates.truncate(3);

    candidates.into_iter().max_by_key(|r| r.oi)
}

fn find_wing_by_delta<'a>(rows: &[&'a ChainRow], target_delta: f64) -> Option<&'a ChainRow> {
    rows.iter()
        .filter(|r| r.oi >= MIN_OI && r.ltp > 0.0)
        .min_by(|a, b| (a.delta.abs() - target_delta).abs().partial_cmp(&(b.delta.abs() - target_delta).abs()).unwrap())
        .copied()
}

fn build_iron_condor(chain: &[ChainRow], is_weekly: bool, max_lots: i32) -> Vec<OptionLeg> {
    let calls = rows_of(chain, OptionType::Call);
    let puts = rows_of(chain, OptionType::Put);

    let short_delta = if is_weekly { CONDOR_SHORT_DELTA_WEEKLY } else { CONDOR_SHORT_DELTA_MONTHLY };

    let Some(short_call) = find_short_by_delta(&calls, short_delta) else { return Vec::new() };
    let Some(short_put) = find_short_by_delta(&puts, short_delta) else { return Vec::new() };

    let call_wings: Vec<&ChainRow> = calls.iter().filter(|r| r.strike > short_call.strike).copied().collect();
    let put_wings: Vec<&ChainRow> = puts.iter().filter(|r| r.strike < short_put.strike).copied().collect();

    let Some(wing_call) = find_wing_by_delta(&call_wings, CONDOR_WING_DELTA) else { return Vec::new() };
    let Some(wing_put) = find_wing_by_delta(&put_wings, CONDOR_WING_DELTA) else { return Vec::new() };

    let quantity = max_lots * short_call.lot_size;

    vec![
        leg_from_row(short_call, Side::Sell, LegRole::Core, quantity),
        leg_from_row(short_put, Side::Sell, LegRole::Core, quantity),
        leg_from_row(wing_call, Side::Buy, LegRole::Hedge, quantity),
        leg_from_row(wing_put, Side::Buy, LegRole::Hedge, quantity),
    ]
}

fn build_directional_spread(chain: &[ChainRow], structure: Structure, max_lots: i32) -> Vec<OptionLeg> {
    let option_type = match structure {
        Structure::BullPutSpread => OptionType::Put,
        Structure::BearCallSpread => OptionType::Call,
        // CreditSpread is the neutral case; the put side per original_source's convention.
        Structure::CreditSpread => OptionType::Put,
        _ => return Vec::new(),
    };

    let rows = rows_of(chain, option_type);

    let Some(short) = find_short_by_delta(&rows, DIRECTIONAL_SHORT_DELTA) else { return Vec::new() };

    let hedge_rows: Vec<&ChainRow> = match option_type {
        OptionType::Put => rows.iter().filter(|r| r.strike < short.strike).copied().collect(),
        OptionType::Call => rows.iter().filter(|r| r.strike > short.strike).copied().collect(),
    };

    let Some(hedge) = find_wing_by_delta(&hedge_rows, DIRECTIONAL_HEDGE_DELTA) else { return Vec::new() };

    let quantity = max_lots * short.lot_size;

    vec![
        leg_from_row(short, Side::Sell, LegRole::Core, quantity),
        leg_from_row(hedge, Side::Buy, LegRole::Hedge, quantity),
    ]
}

fn net_credit(legs: &[OptionLeg]) -> f64 {
    legs.iter()
        .map(|leg| match leg.side {
            Side::Sell => leg.reference_premium * leg.quantity as f64,
            Side::Buy => -leg.reference_premium * leg.quantity as f64,
        })
        .sum()
}

fn spread_width(legs: &[OptionLeg], option_type: OptionType) -> i32 {
    let strikes: Vec<i32> = legs.iter().filter(|l| l.option_type == option_type).map(|l| l.strike).collect();
    match (strikes.iter().min(), strikes.iter().max()) {
        (Some(min), Some(max)) => max - min,
        _ => 0,
    }
}

fn max_loss(legs: &[OptionLeg]) -> f64 {
    if legs.is_empty() {
        return 0.0;
    }

    let call_width = spread_width(legs, OptionType::Call);
    let put_width = spread_width(legs, OptionType::Put);
    let width = call_width.max(put_width);
    let quantity = legs.iter().map(|l| l.quantity).max().unwrap_or(0);

    width as f64 * quantity as f64 - net_credit(legs)
}

/// Builds legs for the mandate's chosen structure and rejects (returns an
/// empty vec) any construction whose defined-risk bound exceeds the
/// per-trade max loss.
pub fn build_legs(
    mandate: &TradingMandate,
    chain: &[ChainRow],
    spot: f64,
    ivp_1yr: f64,
    expiry: NaiveDate,
    config: &Config,
) -> Vec<OptionLeg> {
    let chain_for_expiry: Vec<ChainRow> = chain.iter().filter(|r| r.expiry == expiry).cloned().collect();

    let legs = match mandate.structure {
        Structure::IronFly => build_iron_fly(&chain_for_expiry, spot, ivp_1yr, mandate.max_lots),
        Structure::IronCondor => {
            let is_weekly = mandate.expiry_kind != crate::types::ExpiryKind::Monthly;
            build_iron_condor(&chain_for_expiry, is_weekly, mandate.max_lots)
        }
        Structure::BullPutSpread | Structure::BearCallSpread | Structure::CreditSpread => {
            build_directional_spread(&chain_for_expiry, mandate.structure, mandate.max_lots)
        }
        Structure::NoTrade => Vec::new(),
    };

    if legs.is_empty() {
        return legs;
    }

    if max_loss(&legs) > config.max_loss_per_trade {
        return Vec::new();
    }

    legs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn test_config() -> Config {
        std::env::set_var("VG_DRY_RUN", "true");
        crate::config::loader::load_config().expect("config loads")
    }

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 6).unwrap()
    }

    fn row(strike: i32, option_type: OptionType, ltp: f64, delta: f64, oi: i64) -> ChainRow {
        ChainRow {
            instrument_key: format!("NIFTY{}{}", strike, option_type.as_str()),
            strike,
            option_type,
            expiry: expiry(),
            ltp,
            bid: ltp - 0.5,
            ask: ltp + 0.5,
            oi,
            iv: 14.0,
            delta,
            theta: -2.0,
            gamma: 0.001,
            vega: 5.0,
            lot_size: 25,
        }
    }

    fn straddle_chain(spot: f64) -> Vec<ChainRow> {
        let atm = round_to_strike(spot, 50);
        let mut rows = Vec::new();
        for i in -6..=6 {
            let strike = atm + i * 50;
            let dist = (strike - atm).abs() as f64;
            let call_delta = (0.5 - dist / 2000.0).max(0.02);
            let put_delta = -(0.5 - dist / 2000.0).max(0.02);
            let premium = (40.0 - dist / 20.0).max(1.0);
            rows.push(row(strike, OptionType::Call, premium, call_delta, 5000));
            rows.push(row(strike, OptionType::Put, premium, put_delta, 5000));
        }
        rows
    }

    #[test]
    fn iron_fly_builds_four_legs_with_wings_outside_atm() {
        let chain = straddle_chain(19300.0);
        let legs = build_iron_fly(&chain, 19300.0, 50.0, 2);
        assert_eq!(legs.len(), 4);
        let shorts: Vec<_> = legs.iter().filter(|l| l.role == LegRole::Core).collect();
        let hedges: Vec<_> = legs.iter().filter(|l| l.role == LegRole::Hedge).collect();
        assert_eq!(shorts.len(), 2);
        assert_eq!(hedges.len(), 2);
        assert_eq!(shorts[0].strike, shorts[1].strike);
    }

    #[test]
    fn iron_condor_shorts_are_further_otm_than_wings() {
        let chain = straddle_chain(19300.0);
        let legs = build_iron_condor(&chain, true, 2);
        assert_eq!(legs.len(), 4);
        let short_call = legs.iter().find(|l| l.option_type == OptionType::Call && l.side == Side::Sell).unwrap();
        let wing_call = legs.iter().find(|l| l.option_type == OptionType::Call && l.side == Side::Buy).unwrap();
        assert!(wing_call.strike > short_call.strike);
    }

    #[test]
    fn directional_spread_rejects_when_max_loss_too_high() {
        let legs = vec![
            OptionLeg {
                instrument_key: "A".to_string(),
                option_type: OptionType::Put,
                strike: 19000,
                side: Side::Sell,
                quantity: 25,
                role: LegRole::Core,
                reference_premium: 5.0,
                lot_size: 25,
                expiry: expiry(),
                order_id: None,
                filled_qty: 0,
                avg_fill_price: None,
            },
            OptionLeg {
                instrument_key: "B".to_string(),
                option_type: OptionType::Put,
                strike: 18500,
                side: Side::Buy,
                quantity: 25,
                role: LegRole::Hedge,
                reference_premium: 1.0,
                lot_size: 25,
                expiry: expiry(),
                order_id: None,
                filled_qty: 0,
                avg_fill_price: None,
            },
        ];
        let loss = max_loss(&legs);
        assert!(loss > 0.0);
        let mut config = test_config();
        config.max_loss_per_trade = 1.0;
        assert!(loss > config.max_loss_per_trade);
    }

    #[test]
    fn no_trade_structure_returns_no_legs() {
        let chain = straddle_chain(19300.0);
        let mandate = TradingMandate {
            expiry_kind: crate::types::ExpiryKind::Weekly,
            regime_name: "LOW_VOL".to_string(),
            structure: Structure::NoTrade,
            directional_bias: crate::types::DirectionalBias::Neutral,
            allocation_pct: 0.0,
            deployment_amount: 0.0,
            max_lots: 0,
            score: crate::types::Score {
                vol: 3.0,
                struct_: 3.0,
                edge: 3.0,
                risk: 3.0,
                composite: 3.0,
                confidence: crate::types::Confidence::Low,
                score_stability: 0.5,
                drivers: vec![],
            },
            rationale: vec![],
            warnings: vec![],
            veto_reasons: vec!["low composite score".to_string()],
        };
        let config = test_config();
        let legs = build_legs(&mandate, &chain, 19300.0, 50.0, expiry(), &config);
        assert!(legs.is_empty());
    }
}
