//! Error taxonomy for the trading control plane.
//!
//! Every variant maps onto one of the classes in SPEC_FULL.md §7 (Transient, Rejected,
//! AuthExpired, Validation, PartialFill, Stale, Fatal) via the predicate methods below, plus
//! a handful of ambient IO/serialization wrapper variants.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TradingError>;

#[derive(Error, Debug)]
pub enum TradingError {
    // --- Broker gateway (C1) ---
    #[error("broker transient failure: {0}")]
    Transient(String),

    #[error("broker rejected order: {0}")]
    Rejected(String),

    #[error("authentication expired: {0}")]
    AuthExpired(String),

    #[error("instrument/order not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    // --- Risk / validation (C7) ---
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    // --- Order execution (C9) ---
    #[error("leg partially filled below threshold: {0}")]
    PartialFill(String),

    #[error("order placement failed: {0}")]
    OrderPlacementFailed(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    // --- Market data (C2) ---
    #[error("quote stale: {0}")]
    Stale(String),

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("insufficient history: {0}")]
    InsufficientHistory(String),

    // --- Circuit breaker / risk halts ---
    #[error("circuit breaker active: {0}")]
    CircuitBreakerActive(String),

    #[error("risk check failed: {0}")]
    RiskCheckFailed(String),

    #[error("daily loss limit breached: {0}")]
    DailyLossLimit(String),

    #[error("position limit exceeded: {0}")]
    PositionLimitExceeded(String),

    // --- Position / trade bookkeeping ---
    #[error("position not found: {0}")]
    PositionNotFound(String),

    #[error("duplicate position: {0}")]
    DuplicatePosition(String),

    #[error("trade not found: {0}")]
    TradeNotFound(String),

    #[error("instrument not found: {0}")]
    InstrumentNotFound(String),

    // --- Fatal (halts new entries) ---
    #[error("fatal: {0}")]
    Fatal(String),

    // --- Config / bootstrap ---
    #[error("configuration error: {0}")]
    ConfigError(String),

    // --- Events ---
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("event dispatch failed: {0}")]
    EventDispatchFailed(String),

    #[error("internal error: {0}")]
    InternalError(String),

    // --- Ambient wrappers ---
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl TradingError {
    /// Whether the gateway may silently retry this without surfacing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TradingError::Transient(_) | TradingError::Io(_) | TradingError::Http(_))
    }

    /// Cannot be repaired by retrying; halts new entries.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TradingError::Fatal(_) | TradingError::ConfigError(_))
    }

    /// Whether this error should trigger an exit of affected positions.
    pub fn requires_exit(&self) -> bool {
        matches!(
            self,
            TradingError::CircuitBreakerActive(_)
                | TradingError::DailyLossLimit(_)
                | TradingError::Fatal(_)
        )
    }

    /// Stable machine-readable code, used in logs and risk_events rows.
    pub fn error_code(&self) -> &'static str {
        match self {
            TradingError::Transient(_) => "GATEWAY_TRANSIENT",
            TradingError::Rejected(_) => "GATEWAY_REJECTED",
            TradingError::AuthExpired(_) => "GATEWAY_AUTH_EXPIRED",
            TradingError::NotFound(_) => "GATEWAY_NOT_FOUND",
            TradingError::AuthenticationFailed(_) => "AUTH_001",
            TradingError::Validation(_) => "RISK_VALIDATION",
            TradingError::PartialFill(_) => "ORDER_PARTIAL_FILL",
            TradingError::OrderPlacementFailed(_) => "ORDER_PLACEMENT_FAILED",
            TradingError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            TradingError::Stale(_) => "DATA_STALE",
            TradingError::MissingData(_) => "DATA_MISSING",
            TradingError::InsufficientHistory(_) => "DATA_INSUFFICIENT_HISTORY",
            TradingError::CircuitBreakerActive(_) => "RISK_CIRCUIT_BREAKER",
            TradingError::RiskCheckFailed(_) => "RISK_CHECK_FAILED",
            TradingError::DailyLossLimit(_) => "RISK_DAILY_LOSS_LIMIT",
            TradingError::PositionLimitExceeded(_) => "RISK_POSITION_LIMIT",
            TradingError::PositionNotFound(_) => "POSITION_NOT_FOUND",
            TradingError::DuplicatePosition(_) => "POSITION_DUPLICATE",
            TradingError::TradeNotFound(_) => "TRADE_NOT_FOUND",
            TradingError::InstrumentNotFound(_) => "INSTRUMENT_NOT_FOUND",
            TradingError::Fatal(_) => "SYSTEM_FATAL",
            TradingError::ConfigError(_) => "CONFIG_ERROR",
            TradingError::DuplicateEvent(_) => "EVENT_DUPLICATE",
            TradingError::EventDispatchFailed(_) => "EVENT_DISPATCH_FAILED",
            TradingError::InternalError(_) => "INTERNAL_ERROR",
            TradingError::Io(_) => "IO_ERROR",
            TradingError::Http(_) => "HTTP_ERROR",
            TradingError::Json(_) => "JSON_ERROR",
            TradingError::Database(_) => "DB_ERROR",
        }
    }
}
