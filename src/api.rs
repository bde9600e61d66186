//! External API facade (C12): typed request/response structs plus an
//! `AppContext`-driven dispatch function per route. Grounded on
//! `original_source/api/routes/*.py` and `original_source/api/websocket.py`
//! for the route shapes, but this crate stops short of wiring an actual HTTP
//! router (axum/actix) — a future binary owns that and calls these functions
//! from its handlers, so the request/response contract is defined exactly
//! once.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerGateway;
use crate::cache::MarketDataCache;
use crate::calendar::{analyze_veto_risk, CalendarClient};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::controller::TradingController;
use crate::error::{Result, TradingError};
use crate::monitor::snapshot_trade;
use crate::orchestrator::OrderOrchestrator;
use crate::persistence::SqliteStore;
use crate::risk::{RiskCheckContext, RiskManager};
use crate::strategy_builder::build_legs;
use crate::types::{OptionLeg, Trade, TradeStatus, TradingMandate};

const NIFTY_INDEX_KEY: &str = "NSE_INDEX|Nifty 50";

/// Everything a route handler needs, bundled the way the teacher's
/// `TradingApp` bundles its component `Arc`s. A future HTTP binary builds one
/// of these at startup and clones it into every request handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub broker: Arc<dyn BrokerGateway>,
    pub market_data: Arc<MarketDataCache>,
    pub calendar: Arc<CalendarClient>,
    pub risk_manager: Arc<RiskManager>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub orchestrator: Arc<OrderOrchestrator>,
    pub controller: Arc<TradingController>,
    pub store: Arc<SqliteStore>,
}

/// The error envelope every route maps its failures to: `{detail: string}`.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub detail: String,
}

impl From<&TradingError> for ErrorEnvelope {
    fn from(e: &TradingError) -> Self {
        ErrorEnvelope { detail: e.to_string() }
    }
}

// ---------------------------------------------------------------------
// POST /api/analysis/run
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct RunAnalysisRequest {
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct RunAnalysisResponse {
    pub triggered: bool,
    pub latest: Option<LatestAnalysisEntry>,
}

pub async fn run_analysis(ctx: &AppContext, _req: RunAnalysisRequest) -> Result<RunAnalysisResponse> {
    ctx.controller.run_cycle().await?;
    let latest = ctx.store.latest_mandate().await?.map(|(timestamp, mandate)| LatestAnalysisEntry { timestamp, mandate });
    Ok(RunAnalysisResponse { triggered: true, latest })
}

// ---------------------------------------------------------------------
// GET /api/analysis/latest
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct LatestAnalysisEntry {
    pub timestamp: DateTime<Utc>,
    pub mandate: TradingMandate,
}

#[derive(Debug, Serialize)]
pub struct LatestAnalysisResponse {
    pub found: bool,
    pub data: Option<LatestAnalysisEntry>,
}

pub async fn get_latest_analysis(ctx: &AppContext) -> Result<LatestAnalysisResponse> {
    let entry = ctx.store.latest_mandate().await?.map(|(timestamp, mandate)| LatestAnalysisEntry { timestamp, mandate });
    Ok(LatestAnalysisResponse { found: entry.is_some(), data: entry })
}

// ---------------------------------------------------------------------
// Shared: resolving a mandate's legs against the live chain.
// ---------------------------------------------------------------------

async fn build_legs_for_mandate(ctx: &AppContext, mandate: &TradingMandate) -> Result<(chrono::NaiveDate, Vec<OptionLeg>)> {
    let Some(expiry_date) = ctx.controller.resolve_expiry(mandate.expiry_kind).await else {
        return Err(TradingError::MissingData("no expiry discovered for mandate's expiry kind".to_string()));
    };

    let live_spot = ctx.broker.get_ltp(&NIFTY_INDEX_KEY.to_string()).await?;
    let chain = ctx.broker.get_option_chain(expiry_date).await?;
    let chain_rows: Vec<_> = chain.into_iter().filter(|r| r.expiry == expiry_date).collect();

    // ivp_252 only affects the iron-fly wing width; a preview/execute request
    // without a freshly computed VolMetrics falls back to a neutral middle value.
    let ivp_252_fallback = 0.5;
    Ok((expiry_date, build_legs(mandate, &chain_rows, live_spot, ivp_252_fallback, expiry_date, &ctx.config)))
}

// ---------------------------------------------------------------------
// POST /api/orders/build-strategy
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BuildStrategyRequest {
    pub mandate: TradingMandate,
}

#[derive(Debug, Serialize)]
pub struct BuildStrategyResponse {
    pub legs: Vec<OptionLeg>,
}

pub async fn build_strategy(ctx: &AppContext, req: BuildStrategyRequest) -> Result<BuildStrategyResponse> {
    let (_expiry_date, legs) = build_legs_for_mandate(ctx, &req.mandate).await?;
    Ok(BuildStrategyResponse { legs })
}

// ---------------------------------------------------------------------
// POST /api/orders/execute-strategy
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExecuteStrategyRequest {
    pub mandate: TradingMandate,
    #[serde(default)]
    pub validate_only: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecuteStrategyResponse {
    pub legs: Vec<OptionLeg>,
    pub validated: bool,
    pub trade: Option<Trade>,
}

pub async fn execute_strategy(ctx: &AppContext, req: ExecuteStrategyRequest) -> Result<ExecuteStrategyResponse> {
    let mandate = &req.mandate;
    if mandate.is_vetoed() {
        return Err(TradingError::Validation(vec!["mandate is NoTrade or carries veto reasons".to_string()]));
    }

    let (expiry_date, legs) = build_legs_for_mandate(ctx, mandate).await?;
    if legs.is_empty() {
        return Err(TradingError::Validation(vec!["strategy builder produced no legs for this mandate".to_string()]));
    }

    let now = Utc::now();
    let events = ctx.calendar.fetch_events(7).await;
    let veto = analyze_veto_risk(&events, now);
    let breaker_state = ctx.circuit_breaker.state().await;
    let required_margin = ctx.broker.required_margin(&legs).await?;
    let available_funds = ctx.broker.available_funds().await?;

    let ctx_check = RiskCheckContext {
        circuit_breaker: &breaker_state,
        now,
        existing_deployed_capital: ctx.store.deployed_capital().await?,
        new_deployment: mandate.deployment_amount,
        required_margin,
        available_funds,
        existing_contracts: ctx.store.deployed_contracts().await?,
        new_contracts: legs.iter().map(|l| l.quantity).sum(),
        daily_trade_count: ctx.store.count_trades_today().await?,
        peak_capital: breaker_state.peak_capital,
        current_capital: ctx.store.current_capital().await?,
        spot_quote_age_sec: ctx.market_data.get_with_age(&NIFTY_INDEX_KEY.to_string()).await.map(|q| q.age_sec),
        veto_risk: &veto,
    };

    let (check, _trip) = ctx.risk_manager.check(&ctx_check);
    check?;

    if req.validate_only {
        return Ok(ExecuteStrategyResponse { legs, validated: true, trade: None });
    }

    let max_loss_estimate = mandate.deployment_amount.min(ctx.config.max_loss_per_trade);
    let trade = ctx.orchestrator.execute_strategy(legs.clone(), mandate.structure, mandate.expiry_kind, expiry_date, max_loss_estimate).await?;

    if let Some(trade) = &trade {
        ctx.store.save_trade(trade).await?;
    }

    Ok(ExecuteStrategyResponse { legs, validated: true, trade })
}

// ---------------------------------------------------------------------
// POST /api/orders/exit-trade
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExitTradeRequest {
    pub trade_id: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ExitTradeResponse {
    pub trade: Trade,
}

pub async fn exit_trade(ctx: &AppContext, req: ExitTradeRequest) -> Result<ExitTradeResponse> {
    let Some(mut trade) = ctx.store.find_trade(&req.trade_id).await? else {
        return Err(TradingError::TradeNotFound(req.trade_id.clone()));
    };
    if trade.is_terminal() {
        return Err(TradingError::TradeNotFound(format!("trade {} is already terminal", req.trade_id)));
    }

    ctx.orchestrator.exit_strategy(&mut trade, &req.reason).await?;
    ctx.store.save_trade(&trade).await?;
    ctx.store.roll_up_daily_metrics(Utc::now().date_naive()).await?;

    Ok(ExitTradeResponse { trade })
}

// ---------------------------------------------------------------------
// GET /api/orders/risk-status
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RiskStatusResponse {
    pub circuit_breaker_tripped: bool,
    pub trip_reason: Option<String>,
    pub trip_until: Option<DateTime<Utc>>,
    pub consecutive_losses: u32,
    pub peak_capital: f64,
    pub current_capital: f64,
    pub deployed_capital: f64,
    pub daily_trade_count: u32,
    pub max_trades_per_day: u32,
}

pub async fn risk_status(ctx: &AppContext) -> Result<RiskStatusResponse> {
    let now = Utc::now();
    let state = ctx.circuit_breaker.state().await;
    Ok(RiskStatusResponse {
        circuit_breaker_tripped: state.is_tripped(now),
        trip_reason: state.trip_reason.clone(),
        trip_until: state.trip_until,
        consecutive_losses: state.consecutive_losses,
        peak_capital: state.peak_capital,
        current_capital: ctx.store.current_capital().await?,
        deployed_capital: ctx.store.deployed_capital().await?,
        daily_trade_count: ctx.store.count_trades_today().await?,
        max_trades_per_day: ctx.config.max_trades_per_day,
    })
}

// ---------------------------------------------------------------------
// GET /api/positions, GET /api/positions/{trade_id}
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PositionView {
    pub trade: Trade,
    pub unrealized_pnl: f64,
}

async fn snapshot_position(ctx: &AppContext, trade: Trade) -> PositionView {
    let snap = snapshot_trade(&trade, &ctx.market_data).await;
    PositionView { trade, unrealized_pnl: snap.unrealized_pnl }
}

#[derive(Debug, Serialize)]
pub struct PositionsResponse {
    pub positions: Vec<PositionView>,
}

pub async fn get_positions(ctx: &AppContext) -> Result<PositionsResponse> {
    let open = ctx.store.list_open_trades().await?;
    let mut positions = Vec::with_capacity(open.len());
    for trade in open {
        positions.push(snapshot_position(ctx, trade).await);
    }
    Ok(PositionsResponse { positions })
}

pub async fn get_position_detail(ctx: &AppContext, trade_id: &str) -> Result<PositionView> {
    let trade = ctx.store.find_trade(trade_id).await?.ok_or_else(|| TradingError::TradeNotFound(trade_id.to_string()))?;
    Ok(snapshot_position(ctx, trade).await)
}

// ---------------------------------------------------------------------
// POST /api/positions/exit-all
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ExitAllResponse {
    pub closed: Vec<String>,
    pub failed: Vec<String>,
}

pub async fn exit_all_positions(ctx: &AppContext) -> Result<ExitAllResponse> {
    let open = ctx.store.list_open_trades().await?;
    let mut closed = Vec::new();
    let mut failed = Vec::new();

    for mut trade in open {
        match ctx.orchestrator.exit_strategy(&mut trade, "EMERGENCY_FLATTEN").await {
            Ok(()) => {
                let _ = ctx.store.save_trade(&trade).await;
                closed.push(trade.trade_id);
            }
            Err(_) => failed.push(trade.trade_id),
        }
    }

    ctx.store.roll_up_daily_metrics(Utc::now().date_naive()).await?;
    Ok(ExitAllResponse { closed, failed })
}

// ---------------------------------------------------------------------
// GET /api/trades/history?status&days
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct TradeHistoryQuery {
    pub status: Option<String>,
    #[serde(default = "default_history_days")]
    pub days: i64,
}

fn default_history_days() -> i64 {
    30
}

#[derive(Debug, Serialize)]
pub struct TradeHistorySummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate_pct: f64,
    pub total_pnl: f64,
}

#[derive(Debug, Serialize)]
pub struct TradeHistoryResponse {
    pub trades: Vec<Trade>,
    pub summary: TradeHistorySummary,
}

pub async fn get_trade_history(ctx: &AppContext, query: TradeHistoryQuery) -> Result<TradeHistoryResponse> {
    let status = query.status.as_deref().map(|s| s.to_uppercase());
    let since = Utc::now() - Duration::days(query.days.max(0));
    let trades = ctx.store.list_trade_history_filtered(status.as_deref(), since).await?;

    let winning = trades.iter().filter(|t| matches!(t.realized_pnl, Some(p) if p > 0.0)).count();
    let losing = trades.iter().filter(|t| matches!(t.realized_pnl, Some(p) if p <= 0.0) && t.status == TradeStatus::Closed).count();
    let total_pnl: f64 = trades.iter().filter_map(|t| t.realized_pnl).sum();
    let win_rate_pct = if trades.is_empty() { 0.0 } else { winning as f64 / trades.len() as f64 * 100.0 };

    Ok(TradeHistoryResponse {
        summary: TradeHistorySummary { total_trades: trades.len(), winning_trades: winning, losing_trades: losing, win_rate_pct, total_pnl },
        trades,
    })
}

// ---------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub database_ok: bool,
    pub broker_session_ok: bool,
    pub circuit_breaker_tripped: bool,
}

pub async fn health(ctx: &AppContext) -> HealthResponse {
    let database_ok = ctx.store.count_trades_today().await.is_ok();
    let broker_session_ok = ctx.broker.available_funds().await.is_ok();
    let circuit_breaker_tripped = ctx.circuit_breaker.is_tripped(Utc::now()).await;
    HealthResponse { database_ok, broker_session_ok, circuit_breaker_tripped }
}

// ---------------------------------------------------------------------
// WS /ws — server-pushed 1Hz portfolio snapshot. No socket handling lives
// here; a future binary's WS layer calls `build_live_update` on its own
// 1-second tick and serializes the result as the outbound frame.
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PortfolioSnapshot {
    pub total_pnl: f64,
    pub net_delta: f64,
    pub net_theta: f64,
    pub net_gamma: f64,
    pub net_vega: f64,
    pub open_trades_count: usize,
}

#[derive(Debug, Serialize)]
pub struct LiveUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: DateTime<Utc>,
    pub portfolio: PortfolioSnapshot,
    pub positions: Vec<PositionView>,
}

pub async fn build_live_update(ctx: &AppContext) -> Result<LiveUpdate> {
    let open = ctx.store.list_open_trades().await?;
    let mut positions = Vec::with_capacity(open.len());
    let mut portfolio = PortfolioSnapshot { total_pnl: 0.0, net_delta: 0.0, net_theta: 0.0, net_gamma: 0.0, net_vega: 0.0, open_trades_count: open.len() };

    for trade in open {
        let snap = snapshot_trade(&trade, &ctx.market_data).await;
        portfolio.total_pnl += snap.unrealized_pnl;
        portfolio.net_delta += snap.net_delta;
        portfolio.net_theta += snap.net_theta;
        portfolio.net_gamma += snap.net_gamma;
        portfolio.net_vega += snap.net_vega;
        positions.push(PositionView { unrealized_pnl: snap.unrealized_pnl, trade });
    }

    Ok(LiveUpdate { kind: "live_update", timestamp: Utc::now(), portfolio, positions })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_history_query_defaults_to_thirty_days() {
        let query: TradeHistoryQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.days, 30);
        assert!(query.status.is_none());
    }

    #[test]
    fn error_envelope_carries_the_display_message() {
        let err = TradingError::TradeNotFound("t1".to_string());
        let envelope = ErrorEnvelope::from(&err);
        assert!(envelope.detail.contains("t1"));
    }
}
