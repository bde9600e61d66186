/// Event definitions for the trading control plane.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExitTrigger, ExpiryKind, Structure};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub timestamp_ms: i64,
    pub idempotency_key: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Bootstrap
    LogInitialized,
    ConfigLoaded,
    StorageReady,
    BrokerSessionReady,

    // Session / token lifecycle
    TradingDayCheck,
    MarketSessionDetermined,
    TokenExpiryWarning,
    TokenRefreshStarted,
    TokenRefreshSuccess,
    TokenRefreshFailed,

    // Analysis cycle (C11)
    AnalysisCycleStarted,
    AnalysisCycleCompleted,
    AnalysisCycleFailed,
    MandateGenerated,
    MandateVetoed,

    // Calendar (C4)
    VetoEventDetected,
    SquareOffRequired,

    // Risk / circuit breaker (C7, C8)
    RiskCheckPassed,
    RiskCheckFailed,
    CircuitBreakerTripped,
    CircuitBreakerReset,
    SlippageEventRecorded,

    // Order orchestrator (C9)
    LegOrderPlaced,
    LegFilled,
    LegFailed,
    PhaseFlattened,
    TradeOpened,
    TradeExecutionFailed,
    ManualInterventionRequired,

    // Position monitor (C10)
    ExitTriggerFired,
    TradeClosed,

    // System
    GracefulShutdownInitiated,
    ShutdownCompleted,
    FatalError,
    KillSwitchActivated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    LogInitialized {
        log_level: String,
    },
    ConfigLoaded {
        config_hash: String,
        data_paths: Vec<String>,
    },
    StorageReady {
        data_root: String,
    },
    BrokerSessionReady {
        session_id: String,
    },

    TradingDayCheck {
        date: String,
        is_trading_day: bool,
    },
    MarketSessionDetermined {
        open_time: String,
        close_time: String,
    },
    TokenExpiryWarning {
        expires_at: DateTime<Utc>,
        minutes_remaining: i64,
    },
    TokenRefreshStarted {
        attempt: u32,
    },
    TokenRefreshSuccess {
        new_expiry: DateTime<Utc>,
    },
    TokenRefreshFailed {
        reason: String,
        attempts: u32,
    },

    AnalysisCycleStarted {
        cycle_id: String,
    },
    AnalysisCycleCompleted {
        cycle_id: String,
        duration_ms: i64,
    },
    AnalysisCycleFailed {
        cycle_id: String,
        reason: String,
        consecutive_failures: u32,
    },
    MandateGenerated {
        expiry_kind: ExpiryKind,
        structure: Structure,
        composite_score: f64,
    },
    MandateVetoed {
        expiry_kind: ExpiryKind,
        reasons: Vec<String>,
    },

    VetoEventDetected {
        title: String,
        event_time: DateTime<Utc>,
        square_off_by: DateTime<Utc>,
    },
    SquareOffRequired {
        trade_ids: Vec<String>,
        reason: String,
    },

    RiskCheckPassed {
        trade_id: String,
    },
    RiskCheckFailed {
        reasons: Vec<String>,
    },
    CircuitBreakerTripped {
        reason: String,
        trip_until: DateTime<Utc>,
    },
    CircuitBreakerReset {
        at: DateTime<Utc>,
    },
    SlippageEventRecorded {
        trade_id: String,
        instrument_key: String,
        slippage_pct: f64,
    },

    LegOrderPlaced {
        trade_id: String,
        instrument_key: String,
        order_id: String,
        price: f64,
    },
    LegFilled {
        trade_id: String,
        instrument_key: String,
        fill_price: f64,
        fill_qty: i32,
    },
    LegFailed {
        trade_id: String,
        instrument_key: String,
        reason: String,
    },
    PhaseFlattened {
        trade_id: String,
        phase: String,
        legs_flattened: usize,
    },
    TradeOpened {
        trade_id: String,
        structure: Structure,
        entry_credit: f64,
    },
    TradeExecutionFailed {
        reason: String,
    },
    ManualInterventionRequired {
        trade_id: String,
        instrument_key: String,
        reason: String,
    },

    ExitTriggerFired {
        trade_id: String,
        trigger: ExitTrigger,
        reason: String,
    },
    TradeClosed {
        trade_id: String,
        exit_reason: String,
        realized_pnl: f64,
    },

    GracefulShutdownInitiated {
        reason: String,
    },
    ShutdownCompleted {
        duration_sec: u64,
    },
    FatalError {
        error_code: String,
        message: String,
    },
    KillSwitchActivated {
        reason: String,
        manual: bool,
    },

    Empty,
}

impl Event {
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        let now = Utc::now();
        let idempotency_key = format!(
            "{}:{}:{}",
            event_type.as_str(),
            now.timestamp_millis(),
            uuid::Uuid::new_v4()
        );

        Event {
            event_type,
            timestamp: now,
            timestamp_ms: now.timestamp_millis(),
            idempotency_key,
            payload,
        }
    }
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::LogInitialized => "LOG_INITIALIZED",
            EventType::ConfigLoaded => "CONFIG_LOADED",
            EventType::StorageReady => "STORAGE_READY",
            EventType::BrokerSessionReady => "BROKER_SESSION_READY",
            EventType::TradingDayCheck => "TRADING_DAY_CHECK",
            EventType::MarketSessionDetermined => "MARKET_SESSION_DETERMINED",
            EventType::TokenExpiryWarning => "TOKEN_EXPIRY_WARNING",
            EventType::TokenRefreshStarted => "TOKEN_REFRESH_STARTED",
            EventType::TokenRefreshSuccess => "TOKEN_REFRESH_SUCCESS",
            EventType::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            EventType::AnalysisCycleStarted => "ANALYSIS_CYCLE_STARTED",
            EventType::AnalysisCycleCompleted => "ANALYSIS_CYCLE_COMPLETED",
            EventType::AnalysisCycleFailed => "ANALYSIS_CYCLE_FAILED",
            EventType::MandateGenerated => "MANDATE_GENERATED",
            EventType::MandateVetoed => "MANDATE_VETOED",
            EventType::VetoEventDetected => "VETO_EVENT_DETECTED",
            EventType::SquareOffRequired => "SQUARE_OFF_REQUIRED",
            EventType::RiskCheckPassed => "RISK_CHECK_PASSED",
            EventType::RiskCheckFailed => "RISK_CHECK_FAILED",
            EventType::CircuitBreakerTripped => "CIRCUIT_BREAKER_TRIPPED",
            EventType::CircuitBreakerReset => "CIRCUIT_BREAKER_RESET",
            EventType::SlippageEventRecorded => "SLIPPAGE_EVENT_RECORDED",
            EventType::LegOrderPlaced => "LEG_ORDER_PLACED",
            EventType::LegFilled => "LEG_FILLED",
            EventType::LegFailed => "LEG_FAILED",
            EventType::PhaseFlattened => "PHASE_FLATTENED",
            EventType::TradeOpened => "TRADE_OPENED",
            EventType::TradeExecutionFailed => "TRADE_EXECUTION_FAILED",
            EventType::ManualInterventionRequired => "MANUAL_INTERVENTION_REQUIRED",
            EventType::ExitTriggerFired => "EXIT_TRIGGER_FIRED",
            EventType::TradeClosed => "TRADE_CLOSED",
            EventType::GracefulShutdownInitiated => "GRACEFUL_SHUTDOWN_INITIATED",
            EventType::ShutdownCompleted => "SHUTDOWN_COMPLETED",
            EventType::FatalError => "FATAL_ERROR",
            EventType::KillSwitchActivated => "KILL_SWITCH_ACTIVATED",
        }
    }
}
