use config::{Config as ConfigSource, Environment, File};

use crate::config::Config;
use crate::error::{Result, TradingError};

/// Loads `config.toml` (if present) as the base layer, then applies `VG_`-prefixed
/// environment overrides, then the handful of env vars the spec names without that
/// prefix. Environment always wins over file.
pub fn load_config() -> Result<Config> {
    let path = std::env::var("VG_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let raw = ConfigSource::builder()
        .add_source(File::with_name(&path).required(false))
        .add_source(Environment::with_prefix("VG").try_parsing(true).separator("__"))
        .build()
        .map_err(|e| TradingError::ConfigError(format!("failed to build config: {e}")))?;

    let mut config: Config = raw
        .try_deserialize()
        .map_err(|e| TradingError::ConfigError(format!("failed to parse config: {e}")))?;

    apply_bare_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// A few env vars are specified without the `VG_` prefix; apply them after the
/// layered build rather than widening the environment source to all bare names.
fn apply_bare_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("MAX_TRADES_PER_DAY") {
        if let Ok(n) = v.parse() {
            config.max_trades_per_day = n;
        }
    }
}

fn validate_config(config: &Config) -> Result<()> {
    if !config.dry_run
        && (config.broker_client_code.is_empty() || config.broker_totp_secret.is_empty())
    {
        return Err(TradingError::ConfigError(
            "broker credentials are required unless VG_DRY_RUN is set".to_string(),
        ));
    }

    if config.base_capital <= 0.0 {
        return Err(TradingError::ConfigError("base_capital must be positive".to_string()));
    }

    if config.max_loss_per_trade <= 0.0 || config.max_capital_per_trade <= 0.0 {
        return Err(TradingError::ConfigError(
            "max_loss_per_trade and max_capital_per_trade must be positive".to_string(),
        ));
    }

    if config.max_drawdown_pct <= 0.0 || config.max_drawdown_pct >= 1.0 {
        return Err(TradingError::ConfigError(format!(
            "invalid max_drawdown_pct: {}",
            config.max_drawdown_pct
        )));
    }

    if config.daily_loss_limit_pct <= 0.0 {
        return Err(TradingError::ConfigError(format!(
            "invalid daily_loss_limit_pct: {}",
            config.daily_loss_limit_pct
        )));
    }

    if config.target_profit_pct <= 0.0 || config.stop_loss_pct <= 0.0 {
        return Err(TradingError::ConfigError(
            "target_profit_pct and stop_loss_pct must be positive".to_string(),
        ));
    }

    if config.max_trades_per_day == 0 {
        return Err(TradingError::ConfigError("max_trades_per_day must be >= 1".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            env: "TEST".to_string(),
            dry_run: true,
            base_capital: 1_000_000.0,
            max_loss_per_trade: 50_000.0,
            max_capital_per_trade: 300_000.0,
            max_trades_per_day: 3,
            max_drawdown_pct: 0.15,
            max_contracts_per_instrument: 1800,
            daily_loss_limit_pct: 0.03,
            consecutive_loss_limit: 3,
            slippage_event_daily_limit: 5,
            circuit_breaker_trip_hours: 24,
            capital_allocation_cap_pct: 0.80,
            margin_utilization_cap_pct: 0.90,
            target_profit_pct: 0.50,
            stop_loss_pct: 1.00,
            exit_dte: 1,
            max_portfolio_delta: 50.0,
            theta_vega_ratio_floor: 1.0,
            monitor_broadcast_interval_sec: 1,
            monitor_exit_eval_interval_sec: 5,
            order_timeout_sec: 10,
            order_poll_interval_ms: 200,
            hedge_price_offset_pct: 0.002,
            core_buy_price_offset_pct: 0.002,
            core_sell_price_offset_pct: 0.002,
            flatten_market_retries: 2,
            flatten_limit_retries: 3,
            flatten_limit_offset_pct: 0.10,
            slippage_alert_threshold_pct: 0.02,
            brokerage_impact_threshold_pct: 0.95,
            skew_crash_fear: 3.0,
            skew_melt_up: -1.0,
            margin_sell_base: 150_000.0,
            analysis_interval_sec: 1800,
            max_consecutive_analysis_failures: 3,
            quote_stale_after_sec: 60,
            broker_base_url: "https://example-broker.invalid".to_string(),
            broker_instrument_master_url: "https://example-broker.invalid/master.json".to_string(),
            broker_client_code: String::new(),
            broker_password: String::new(),
            broker_mpin: None,
            broker_totp_secret: String::new(),
            broker_api_key: String::new(),
            broker_secret_key: String::new(),
            token_expiry_warning_min: 60,
            ws_reconnect_backoff_sec: vec![1, 2, 4, 8, 16, 30],
            rate_limit_orders: 10,
            rate_limit_market_data: 10,
            rate_limit_historical: 3,
            calendar_feed_url: "https://example-calendar.invalid".to_string(),
            db_path: ":memory:".to_string(),
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
            kill_switch_file: "KILL".to_string(),
            token_file_path: "tokens.json".to_string(),
            event_log_path: "events.jsonl".to_string(),
            notify_bot_token: None,
            notify_chat_id: None,
        }
    }

    #[test]
    fn dry_run_does_not_require_broker_credentials() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn live_mode_requires_broker_credentials() {
        let mut c = base_config();
        c.dry_run = false;
        assert!(validate_config(&c).is_err());
    }

    #[test]
    fn rejects_bad_drawdown_pct() {
        let mut c = base_config();
        c.max_drawdown_pct = 1.5;
        assert!(validate_config(&c).is_err());
    }
}
