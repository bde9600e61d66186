//! Trading Controller (C11): the top-level non-overlapping cycle. Generalized
//! from the teacher's `TradingApp::run` (trading-day/market-hours gating,
//! sleep-and-retry loop, fatal-vs-recoverable error handling) onto the
//! analysis-score-mandate-execute pipeline this domain runs instead of an
//! ADX bar loop.
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::analytics::{compute_edge, compute_struct, compute_vol};
use crate::broker::{BrokerGateway, InstrumentCache};
use crate::calendar::{analyze_veto_risk, CalendarClient, VetoRisk};
use crate::cache::MarketDataCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::Result;
use crate::events::event_bus::EventBus;
use crate::events::types::{Event, EventPayload, EventType};
use crate::orchestrator::OrderOrchestrator;
use crate::participant::ParticipantDataClient;
use crate::regime::{calculate_scores, generate_mandate};
use crate::risk::{RiskCheckContext, RiskManager};
use crate::strategy_builder::build_legs;
use crate::types::{ExpiryKind, TradingMandate};
use uuid::Uuid;

const NIFTY_INDEX_KEY: &str = "NSE_INDEX|Nifty 50";
const VIX_INDEX_KEY: &str = "NSE_INDEX|India VIX";

#[async_trait]
pub trait ControllerStore: Send + Sync {
    async fn save_mandate(&self, mandate: &TradingMandate) -> Result<()>;
    async fn count_trades_today(&self) -> Result<u32>;
    async fn deployed_capital(&self) -> Result<f64>;
    async fn deployed_contracts(&self) -> Result<i32>;
    async fn current_capital(&self) -> Result<f64>;
}

fn classify_expiries(mut dates: Vec<NaiveDate>) -> Option<(NaiveDate, NaiveDate, NaiveDate)> {
    dates.sort();
    dates.dedup();
    let weekly = *dates.first()?;
    let next_weekly = dates.get(1).copied().unwrap_or(weekly);
    let monthly = dates
        .iter()
        .filter(|d| d.year() == weekly.year() && d.month() == weekly.month())
        .last()
        .copied()
        .unwrap_or(weekly);
    Some((weekly, next_weekly, monthly))
}

pub struct TradingController {
    config: Arc<Config>,
    event_bus: Arc<EventBus>,
    broker: Arc<dyn BrokerGateway>,
    instrument_cache: Arc<InstrumentCache>,
    market_data: Arc<MarketDataCache>,
    calendar: Arc<CalendarClient>,
    participant: Arc<ParticipantDataClient>,
    risk_manager: Arc<RiskManager>,
    circuit_breaker: Arc<CircuitBreaker>,
    orchestrator: Arc<OrderOrchestrator>,
    store: Arc<dyn ControllerStore>,
    running: RwLock<bool>,
    consecutive_failures: RwLock<u32>,
    shutdown: RwLock<bool>,
}

impl TradingController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        event_bus: Arc<EventBus>,
        broker: Arc<dyn BrokerGateway>,
        instrument_cache: Arc<InstrumentCache>,
        market_data: Arc<MarketDataCache>,
        calendar: Arc<CalendarClient>,
        participant: Arc<ParticipantDataClient>,
        risk_manager: Arc<RiskManager>,
        circuit_breaker: Arc<CircuitBreaker>,
        orchestrator: Arc<OrderOrchestrator>,
        store: Arc<dyn ControllerStore>,
    ) -> Self {
        TradingController {
            config,
            event_bus,
            broker,
            instrument_cache,
            market_data,
            calendar,
            participant,
            risk_manager,
            circuit_breaker,
            orchestrator,
            store,
            running: RwLock::new(false),
            consecutive_failures: RwLock::new(0),
            shutdown: RwLock::new(false),
        }
    }

    pub async fn request_shutdown(&self) {
        *self.shutdown.write().await = true;
    }

    /// Resolves the expiry date the controller would currently trade for a
    /// given expiry kind, from the same instrument-master discovery
    /// `run_cycle_inner` uses. Exposed for the API facade's build/execute
    /// preview routes, which receive a mandate but not its expiry date.
    pub async fn resolve_expiry(&self, kind: ExpiryKind) -> Option<NaiveDate> {
        let instruments = self.instrument_cache.get_nifty_options_chain(None).await;
        let dates: Vec<NaiveDate> = instruments.iter().filter_map(|i| NaiveDate::parse_from_str(&i.expiry, "%d%b%Y").ok()).collect();
        let (weekly, next_weekly, monthly) = classify_expiries(dates)?;
        Some(match kind {
            ExpiryKind::Weekly => weekly,
            ExpiryKind::NextWeekly => next_weekly,
            ExpiryKind::Monthly => monthly,
        })
    }

    async fn emit(&self, event_type: EventType, payload: EventPayload) {
        if let Err(e) = self.event_bus.publish(Event::new(event_type, payload)).await {
            warn!(error = %e, "event publish failed");
        }
    }

    /// Discovers the three tracked expiries from the instrument master and
    /// runs one full analysis for each, executing a trade where the mandate
    /// calls for one. Non-overlapping: a cycle already in progress causes
    /// this call to return immediately without running another.
    pub async fn run_cycle(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                info!("trading cycle already running, skipping this tick");
                return Ok(());
            }
            *running = true;
        }

        let cycle_id = Uuid::new_v4().to_string();
        let started = Utc::now();
        self.emit(EventType::AnalysisCycleStarted, EventPayload::AnalysisCycleStarted { cycle_id: cycle_id.clone() }).await;

        let result = self.run_cycle_inner().await;

        if let Err(e) = &result {
            let mut failures = self.consecutive_failures.write().await;
            *failures += 1;
            let consecutive_failures = *failures;
            error!(error = %e, consecutive_failures, "analysis cycle failed");
            self.emit(
                EventType::AnalysisCycleFailed,
                EventPayload::AnalysisCycleFailed { cycle_id: cycle_id.clone(), reason: e.to_string(), consecutive_failures },
            )
            .await;

            if consecutive_failures >= self.config.max_consecutive_analysis_failures {
                let now = Utc::now();
                if let Err(trip_err) = self.circuit_breaker.trip_for_reason("ANALYSIS_FAILURE".to_string(), now).await {
                    warn!(error = %trip_err, "failed to persist circuit breaker state after repeated analysis failures");
                } else {
                    let state = self.circuit_breaker.state().await;
                    if let Some(trip_until) = state.trip_until {
                        self.emit(EventType::CircuitBreakerTripped, EventPayload::CircuitBreakerTripped { reason: "ANALYSIS_FAILURE".to_string(), trip_until }).await;
                    }
                }
            }
        } else {
            *self.consecutive_failures.write().await = 0;
            let duration_ms = (Utc::now() - started).num_milliseconds();
            self.emit(EventType::AnalysisCycleCompleted, EventPayload::AnalysisCycleCompleted { cycle_id, duration_ms }).await;
        }

        *self.running.write().await = false;
        result
    }

    async fn run_cycle_inner(&self) -> Result<()> {
        self.circuit_breaker.maybe_auto_reset(Utc::now()).await?;

        let instruments = self.instrument_cache.get_nifty_options_chain(None).await;
        let dates: Vec<NaiveDate> = instruments.iter().filter_map(|i| NaiveDate::parse_from_str(&i.expiry, "%d%b%Y").ok()).collect();
        let Some((weekly, next_weekly, monthly)) = classify_expiries(dates) else {
            warn!("no option expiries discovered, skipping cycle");
            return Ok(());
        };

        let events = self.calendar.fetch_events(7).await;
        let veto = analyze_veto_risk(&events, Utc::now());
        let external = self.participant.fetch_external_metrics().await;

        if let (Some(title), Some(event_time), Some(square_off_by)) = (veto.event_title.clone(), veto.event_time, veto.suggested_square_off_time) {
            self.emit(EventType::VetoEventDetected, EventPayload::VetoEventDetected { title, event_time, square_off_by }).await;
        }

        for (expiry_kind, expiry_date) in [(ExpiryKind::Weekly, weekly), (ExpiryKind::NextWeekly, next_weekly), (ExpiryKind::Monthly, monthly)] {
            if self.circuit_breaker.is_tripped(Utc::now()).await {
                info!("circuit breaker active, skipping remaining expiries this cycle");
                break;
            }
            self.run_expiry_cycle(expiry_kind, expiry_date, weekly, next_weekly, monthly, &veto, &events, &external).await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_expiry_cycle(
        &self,
        expiry_kind: ExpiryKind,
        expiry_date: NaiveDate,
        weekly: NaiveDate,
        next_weekly: NaiveDate,
        monthly: NaiveDate,
        veto: &VetoRisk,
        events: &[crate::types::EconomicEvent],
        external: &crate::types::ExternalMetrics,
    ) -> Result<()> {
        let now = Utc::now();
        let today = now.date_naive();

        let history_nifty = self.broker.get_historical_candles(&NIFTY_INDEX_KEY.to_string(), "day", 365).await?;
        let history_vix = self.broker.get_historical_candles(&VIX_INDEX_KEY.to_string(), "day", 365).await?;
        let live_spot = self.broker.get_ltp(&NIFTY_INDEX_KEY.to_string()).await.unwrap_or(0.0);
        let live_vix = self.broker.get_ltp(&VIX_INDEX_KEY.to_string()).await.unwrap_or(0.0);

        let vol = compute_vol(&history_nifty, &history_vix, live_spot, live_vix)?;
        let spot = if live_spot > 0.0 { live_spot } else { history_nifty.last().map(|b| b.close).unwrap_or(0.0) };

        let chain = self.broker.get_option_chain(expiry_date).await?;
        let chain_rows: Vec<crate::broker::ChainRow> = chain.into_iter().filter(|r| r.expiry == expiry_date).collect();
        let struct_m = compute_struct(&chain_rows, spot);

        let dte_weekly = (weekly - today).num_days();
        let dte_next_weekly = (next_weekly - today).num_days();
        let dte_monthly = (monthly - today).num_days();
        let edge = compute_edge(&vol, dte_weekly, dte_monthly, dte_next_weekly);

        let dte = (expiry_date - today).num_days();
        let high_impact_event_count = events
            .iter()
            .filter(|e| e.impact == crate::types::EventImpactClass::HighImpact && (e.event_time - now).num_hours() <= 48)
            .count();

        let score = calculate_scores(&vol, &struct_m, &edge, external, spot, dte, high_impact_event_count);

        let veto_reasons = if veto.square_off_needed { vec![veto.event_title.clone().unwrap_or_else(|| "calendar veto event".to_string())] } else { Vec::new() };

        let mandate = generate_mandate(expiry_kind, &score, &vol, &struct_m, &edge, dte, high_impact_event_count, veto_reasons, &self.config);

        self.store.save_mandate(&mandate).await?;

        if mandate.is_vetoed() {
            info!(expiry_kind = expiry_kind.as_str(), structure = mandate.structure.as_str(), "mandate is NoTrade or vetoed, skipping execution");
            return Ok(());
        }

        let legs = build_legs(&mandate, &chain_rows, spot, vol.ivp_252, expiry_date, &self.config);
        if legs.is_empty() {
            info!(expiry_kind = expiry_kind.as_str(), "strategy builder produced no legs, skipping execution");
            return Ok(());
        }

        let required_margin = self.broker.required_margin(&legs).await?;
        let available_funds = self.broker.available_funds().await?;
        let breaker_state = self.circuit_breaker.state().await;

        let ctx = RiskCheckContext {
            circuit_breaker: &breaker_state,
            now,
            existing_deployed_capital: self.store.deployed_capital().await?,
            new_deployment: mandate.deployment_amount,
            required_margin,
            available_funds,
            existing_contracts: self.store.deployed_contracts().await?,
            new_contracts: legs.iter().map(|l| l.quantity).sum(),
            daily_trade_count: self.store.count_trades_today().await?,
            peak_capital: breaker_state.peak_capital,
            current_capital: self.store.current_capital().await?,
            spot_quote_age_sec: self.market_data.get_with_age(&NIFTY_INDEX_KEY.to_string()).await.map(|q| q.age_sec),
            veto_risk: veto,
        };

        let (check, trip) = self.risk_manager.check(&ctx);
        if trip {
            if let Err(e) = self.circuit_breaker.record_trade_result(-1.0, ctx.current_capital, now).await {
                warn!(error = %e, "failed to persist drawdown-triggered circuit breaker trip");
            }
        }
        if let Err(e) = check {
            warn!(error = %e, "risk gate rejected mandate");
            return Ok(());
        }

        let max_loss_estimate = mandate.deployment_amount.min(self.config.max_loss_per_trade);
        match self.orchestrator.execute_strategy(legs, mandate.structure, expiry_kind, expiry_date, max_loss_estimate).await? {
            Some(trade) => {
                if let Err(e) = self.circuit_breaker.record_trade_result(trade.entry_credit, ctx.current_capital, now).await {
                    warn!(error = %e, "failed to persist circuit breaker state after trade open");
                }
            }
            None => info!(expiry_kind = expiry_kind.as_str(), "order orchestrator did not open a trade this cycle"),
        }

        Ok(())
    }

    /// Runs the main loop: waits for market hours, runs one non-overlapping
    /// cycle every `analysis_interval_sec`, honors the shutdown flag between
    /// cycles.
    pub async fn run(&self) {
        info!("trading controller starting main loop");

        loop {
            if *self.shutdown.read().await {
                info!("shutdown requested, stopping trading controller");
                break;
            }

            let now = Utc::now();
            if !crate::time::is_trading_day(now.date_naive()) {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                continue;
            }

            let (open, close) = crate::time::get_market_timings(now);
            if now < open {
                let wait = (open - now).num_seconds().max(0) as u64;
                tokio::time::sleep(StdDuration::from_secs(wait.min(300))).await;
                continue;
            }
            if now >= close {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "trading cycle returned an error");
                if e.is_fatal() {
                    error!("fatal error, stopping trading controller");
                    break;
                }
            }

            tokio::time::sleep(StdDuration::from_secs(self.config.analysis_interval_sec)).await;
        }
    }
}
