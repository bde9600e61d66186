//! Runtime configuration: a `config.toml` base layer merged with `VG_`-prefixed
//! environment overrides (plus a couple of spec-mandated bare env vars), following
//! the teacher's `toml`-based loader generalized to the `config` crate's layered builder.
pub mod loader;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub env: String,
    pub dry_run: bool,

    // Capital & portfolio-level risk thresholds (Risk Manager, Circuit Breaker).
    pub base_capital: f64,
    pub max_loss_per_trade: f64,
    pub max_capital_per_trade: f64,
    pub max_trades_per_day: u32,
    pub max_drawdown_pct: f64,
    pub max_contracts_per_instrument: i32,
    pub daily_loss_limit_pct: f64,
    pub consecutive_loss_limit: u32,
    pub slippage_event_daily_limit: u32,
    pub circuit_breaker_trip_hours: i64,
    pub capital_allocation_cap_pct: f64,
    pub margin_utilization_cap_pct: f64,

    // Position Monitor (C10) exit thresholds.
    pub target_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub exit_dte: i64,
    pub max_portfolio_delta: f64,
    pub theta_vega_ratio_floor: f64,
    pub monitor_broadcast_interval_sec: u64,
    pub monitor_exit_eval_interval_sec: u64,

    // Order Orchestrator (C9).
    pub order_timeout_sec: u64,
    pub order_poll_interval_ms: u64,
    pub hedge_price_offset_pct: f64,
    pub core_buy_price_offset_pct: f64,
    pub core_sell_price_offset_pct: f64,
    pub flatten_market_retries: u32,
    pub flatten_limit_retries: u32,
    pub flatten_limit_offset_pct: f64,
    pub slippage_alert_threshold_pct: f64,
    pub brokerage_impact_threshold_pct: f64,

    // Regime Engine (C5) fixed constants.
    pub skew_crash_fear: f64,
    pub skew_melt_up: f64,
    pub margin_sell_base: f64,

    // Trading Controller (C11).
    pub analysis_interval_sec: u64,
    pub max_consecutive_analysis_failures: u32,

    // Market Data Cache (C2).
    pub quote_stale_after_sec: i64,

    // Broker Gateway (C1) credentials and session handling.
    pub broker_base_url: String,
    pub broker_instrument_master_url: String,
    pub broker_client_code: String,
    pub broker_password: String,
    pub broker_mpin: Option<String>,
    pub broker_totp_secret: String,
    pub broker_api_key: String,
    pub broker_secret_key: String,
    pub token_expiry_warning_min: i64,
    pub ws_reconnect_backoff_sec: Vec<u64>,

    // Rate limiting (token-bucket caps per category).
    pub rate_limit_orders: u32,
    pub rate_limit_market_data: u32,
    pub rate_limit_historical: u32,

    // Calendar (C4).
    pub calendar_feed_url: String,

    // Storage / paths.
    pub db_path: String,
    pub log_dir: String,
    pub log_level: String,
    pub kill_switch_file: String,
    pub token_file_path: String,
    pub event_log_path: String,

    // Notification Sink (C14), best-effort.
    pub notify_bot_token: Option<String>,
    pub notify_chat_id: Option<String>,
}

impl Config {
    pub fn quote_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.quote_stale_after_sec)
    }
}
