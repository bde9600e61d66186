//! Risk Manager (C7): the pre-trade gate. All nine checks run regardless of
//! earlier failures so the caller gets the full violation list, matching the
//! teacher's style of collecting every problem before rejecting (see
//! `src/risk/manager.rs`) generalized from a single-signal VIX breaker to the
//! full SPEC_FULL §4.7 checklist. Grounded on `original_source/core/risk_manager.py`.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::calendar::VetoRisk;
use crate::config::Config;
use crate::error::{Result, TradingError};
use crate::time;
use crate::types::CircuitBreakerState;

/// Everything the gate needs to evaluate a proposed deployment. Callers
/// gather this from the Broker Gateway, Market Data Cache, Circuit Breaker,
/// and persistence before calling `RiskManager::check`.
pub struct RiskCheckContext<'a> {
    pub circuit_breaker: &'a CircuitBreakerState,
    pub now: DateTime<Utc>,
    pub existing_deployed_capital: f64,
    pub new_deployment: f64,
    pub required_margin: f64,
    pub available_funds: f64,
    pub existing_contracts: i32,
    pub new_contracts: i32,
    pub daily_trade_count: u32,
    pub peak_capital: f64,
    pub current_capital: f64,
    pub spot_quote_age_sec: Option<i64>,
    pub veto_risk: &'a VetoRisk,
}

pub struct RiskManager {
    config: Arc<Config>,
}

impl RiskManager {
    pub fn new(config: Arc<Config>) -> Self {
        RiskManager { config }
    }

    /// Runs all nine checks and returns `Ok(())` only if every one passes.
    /// Returns `Err(TradingError::Validation(violations))` otherwise, plus a
    /// flag telling the caller whether this check itself should trip the
    /// circuit breaker (the drawdown check does, per SPEC_FULL §4.7 #6).
    pub fn check(&self, ctx: &RiskCheckContext) -> (Result<()>, bool) {
        let mut violations = Vec::new();
        let mut trip_circuit_breaker = false;
        let config = &self.config;

        // 1. Circuit breaker not active.
        if ctx.circuit_breaker.is_tripped(ctx.now) {
            violations.push(format!(
                "circuit breaker active until {}",
                ctx.circuit_breaker.trip_until.map(|t| t.to_rfc3339()).unwrap_or_default()
            ));
        }

        // 2. Capital allocation cap.
        let allocation_cap = config.base_capital * config.capital_allocation_cap_pct;
        let total_deployed = ctx.existing_deployed_capital + ctx.new_deployment;
        if total_deployed > allocation_cap {
            violations.push(format!(
                "capital allocation {:.0} exceeds cap {:.0} ({:.0}% of base capital)",
                total_deployed,
                allocation_cap,
                config.capital_allocation_cap_pct * 100.0
            ));
        }

        // 3. Margin utilization cap.
        let margin_cap = config.margin_utilization_cap_pct * ctx.available_funds;
        if ctx.required_margin > margin_cap {
            violations.push(format!(
                "required margin {:.0} exceeds {:.0}% of available funds ({:.0})",
                ctx.required_margin,
                config.margin_utilization_cap_pct * 100.0,
                ctx.available_funds
            ));
        }

        // 4. Concentration.
        let total_contracts = ctx.existing_contracts + ctx.new_contracts;
        if total_contracts > config.max_contracts_per_instrument {
            violations.push(format!(
                "total contracts {} exceeds concentration limit {}",
                total_contracts, config.max_contracts_per_instrument
            ));
        }

        // 5. Daily trade count.
        if ctx.daily_trade_count >= config.max_trades_per_day {
            violations.push(format!(
                "daily trade count {} has reached the limit of {}",
                ctx.daily_trade_count, config.max_trades_per_day
            ));
        }

        // 6. Drawdown — also trips the circuit breaker.
        if ctx.peak_capital > 0.0 {
            let drawdown = (ctx.peak_capital - ctx.current_capital) / ctx.peak_capital;
            if drawdown > config.max_drawdown_pct {
                violations.push(format!(
                    "drawdown {:.2}% exceeds limit {:.2}%",
                    drawdown * 100.0,
                    config.max_drawdown_pct * 100.0
                ));
                trip_circuit_breaker = true;
            }
        }

        // 7. Market open and non-stale spot.
        if !time::is_trading_day_weekday_only(ctx.now) {
            violations.push("market is closed today".to_string());
        } else {
            let (open, close) = time::get_market_timings(ctx.now);
            if ctx.now < open || ctx.now > close {
                violations.push("outside market hours".to_string());
            }
        }
        match ctx.spot_quote_age_sec {
            Some(age) if age > config.quote_stale_after_sec => {
                violations.push(format!("spot quote stale ({}s old)", age));
            }
            None => violations.push("spot quote unavailable".to_string()),
            _ => {}
        }

        // 8. Veto events within 48h.
        if ctx.veto_risk.square_off_needed {
            violations.push(format!(
                "veto event within square-off window: {}",
                ctx.veto_risk.event_title.clone().unwrap_or_default()
            ));
        }

        // 9. Deployment cap.
        if ctx.new_deployment > config.max_capital_per_trade {
            violations.push(format!(
                "deployment {:.0} exceeds max capital per trade {:.0}",
                ctx.new_deployment, config.max_capital_per_trade
            ));
        }

        if violations.is_empty() {
            (Ok(()), trip_circuit_breaker)
        } else {
            warn!(violations = ?violations, "risk gate rejected entry");
            (Err(TradingError::Validation(violations)), trip_circuit_breaker)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::VetoRisk;
    use chrono::NaiveDate;

    fn test_config() -> Config {
        std::env::set_var("VG_DRY_RUN", "true");
        crate::config::loader::load_config().expect("config loads")
    }

    fn calm_breaker() -> CircuitBreakerState {
        CircuitBreakerState {
            consecutive_losses: 0,
            peak_capital: 1_000_000.0,
            trip_reason: None,
            trip_until: None,
            daily_slippage_event_count: 0,
            day_key: NaiveDate::from_ymd_opt(2026, 7, 28).unwrap(),
        }
    }

    fn no_veto() -> VetoRisk {
        VetoRisk { has_veto: false, event_title: None, event_time: None, square_off_needed: false, hours_until: None, suggested_square_off_time: None }
    }

    fn healthy_context<'a>(breaker: &'a CircuitBreakerState, veto: &'a VetoRisk, now: DateTime<Utc>) -> RiskCheckContext<'a> {
        RiskCheckContext {
            circuit_breaker: breaker,
            now,
            existing_deployed_capital: 0.0,
            new_deployment: 100_000.0,
            required_margin: 50_000.0,
            available_funds: 500_000.0,
            existing_contracts: 0,
            new_contracts: 50,
            daily_trade_count: 0,
            peak_capital: 1_000_000.0,
            current_capital: 1_000_000.0,
            spot_quote_age_sec: Some(5),
            veto_risk: veto,
        }
    }

    fn market_hours_now() -> DateTime<Utc> {
        // 2026-07-28 is a Tuesday; 10:00 IST is well within market hours.
        DateTime::parse_from_rfc3339("2026-07-28T04:30:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn all_checks_pass_for_healthy_context() {
        let breaker = calm_breaker();
        let veto = no_veto();
        let now = market_hours_now();
        let ctx = healthy_context(&breaker, &veto, now);
        let manager = RiskManager::new(Arc::new(test_config()));
        let (result, trip) = manager.check(&ctx);
        assert!(result.is_ok());
        assert!(!trip);
    }

    #[test]
    fn tripped_circuit_breaker_blocks_entry() {
        let mut breaker = calm_breaker();
        breaker.trip_until = Some(Utc::now() + chrono::Duration::hours(1));
        let veto = no_veto();
        let now = market_hours_now();
        let ctx = healthy_context(&breaker, &veto, now);
        let manager = RiskManager::new(Arc::new(test_config()));
        let (result, _) = manager.check(&ctx);
        assert!(result.is_err());
    }

    #[test]
    fn drawdown_breach_trips_circuit_breaker() {
        let breaker = calm_breaker();
        let veto = no_veto();
        let now = market_hours_now();
        let mut ctx = healthy_context(&breaker, &veto, now);
        ctx.peak_capital = 1_000_000.0;
        ctx.current_capital = 800_000.0;
        let manager = RiskManager::new(Arc::new(test_config()));
        let (result, trip) = manager.check(&ctx);
        assert!(result.is_err());
        assert!(trip);
    }

    #[test]
    fn collects_all_violations_at_once() {
        let mut breaker = calm_breaker();
        breaker.trip_until = Some(Utc::now() + chrono::Duration::hours(1));
        let veto = no_veto();
        let now = market_hours_now();
        let mut ctx = healthy_context(&breaker, &veto, now);
        ctx.daily_trade_count = 10;
        ctx.new_deployment = 10_000_000.0;
        let manager = RiskManager::new(Arc::new(test_config()));
        let (result, _) = manager.check(&ctx);
        match result {
            Err(TradingError::Validation(violations)) => assert!(violations.len() >= 3),
            _ => panic!("expected validation error"),
        }
    }
}
