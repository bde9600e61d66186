/// Core type definitions for the options control plane.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Opaque broker instrument identifier, stable for the life of a contract.
pub type InstrumentKey = String;

/// OHLCV candle, used for realized-vol / Parkinson-vol history and GARCH fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// A single streamed quote update for an instrument key.
#[derive(Debug, Clone)]
pub struct Tick {
    pub instrument_key: InstrumentKey,
    pub ltp: f64,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

/// Option type (Call or Put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "CE",
            OptionType::Put => "PE",
        }
    }
}

/// Trade side (Buy or Sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
    Failed,
}

/// One broker-facing order (a leg's placement attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub broker_order_id: Option<String>,
    pub trade_id: String,
    pub instrument_key: InstrumentKey,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: i32,
    pub limit_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub fill_quantity: i32,
    pub fill_time: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub attempts: u32,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A leg's role within a strategy: protective hedge or income-generating core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegRole {
    Core,
    Hedge,
}

impl LegRole {
    /// Minimum filled-quantity ratio below which a fill counts as a failure.
    pub fn min_fill_ratio(&self) -> f64 {
        match self {
            LegRole::Hedge => 0.98,
            LegRole::Core => 0.95,
        }
    }
}

/// One leg of a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionLeg {
    pub instrument_key: InstrumentKey,
    pub option_type: OptionType,
    pub strike: i32,
    pub side: Side,
    pub quantity: i32,
    pub role: LegRole,
    pub reference_premium: f64,
    pub lot_size: i32,
    pub expiry: NaiveDate,
    pub order_id: Option<String>,
    pub filled_qty: i32,
    pub avg_fill_price: Option<f64>,
    pub slippage_pct: Option<f64>,
    pub fill_time: Option<DateTime<Utc>>,
}

impl OptionLeg {
    /// Whether the filled quantity clears the role's minimum-fill threshold.
    pub fn fill_sufficient(&self) -> bool {
        self.filled_qty as f64 >= self.quantity as f64 * self.role.min_fill_ratio()
    }

    /// Builds the reversing leg used to flatten or exit this one, at a fresh reference price.
    pub fn reversed(&self, current_price: f64) -> OptionLeg {
        OptionLeg {
            side: self.side.opposite(),
            quantity: self.filled_qty.max(self.quantity),
            reference_premium: current_price,
            filled_qty: 0,
            avg_fill_price: None,
            slippage_pct: None,
            fill_time: None,
            order_id: None,
            ..self.clone()
        }
    }
}

/// Which expiry a mandate/trade targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryKind {
    Weekly,
    Monthly,
    NextWeekly,
}

impl ExpiryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryKind::Weekly => "WEEKLY",
            ExpiryKind::Monthly => "MONTHLY",
            ExpiryKind::NextWeekly => "NEXT_WEEKLY",
        }
    }
}

/// Trade lifecycle. Transitions are monotone: Pending->Open->Closed, Pending->Failed,
/// Open->Closing->Closed. No state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Pending,
    Open,
    Closing,
    Closed,
    Failed,
}

/// A strategy instance: owns its legs exclusively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub strategy: Structure,
    pub expiry_kind: ExpiryKind,
    pub expiry_date: NaiveDate,
    pub status: TradeStatus,
    pub entry_time: DateTime<Utc>,
    pub legs: Vec<OptionLeg>,
    pub entry_credit: f64,
    pub max_loss: f64,
    pub realized_pnl: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub manual_exit_flag: bool,
    pub net_delta: f64,
    pub net_theta: f64,
    pub net_gamma: f64,
    pub net_vega: f64,
}

impl Trade {
    /// Net-short contract count: Sell legs minus Buy legs, summed over filled quantity.
    pub fn net_short_contracts(&self) -> i32 {
        self.legs
            .iter()
            .map(|l| match l.side {
                Side::Sell => l.filled_qty,
                Side::Buy => -l.filled_qty,
            })
            .sum()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TradeStatus::Closed | TradeStatus::Failed)
    }
}

/// Realized-vol / IV / GEX-adjacent classification: how "sticky" gamma is making the tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GexRegime {
    Sticky,
    Slippery,
}

/// 25-delta skew classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkewRegime {
    CrashFear,
    Balanced,
    MeltUp,
}

/// Short-term VIX momentum classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VixMomentum {
    ExplosiveUp,
    Collapsing,
    Stable,
}

/// Volatility surface and realized/implied vol measures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolMetrics {
    pub rv7: f64,
    pub rv28: f64,
    pub rv90: f64,
    pub garch7: f64,
    pub garch28: f64,
    pub parkinson7: f64,
    pub parkinson28: f64,
    pub vix: f64,
    pub vix_5d_change: f64,
    pub vov: f64,
    pub vov_zscore: f64,
    pub ivp_30: f64,
    pub ivp_90: f64,
    pub ivp_252: f64,
    pub ma20: f64,
    pub atr14: f64,
    pub vol_regime: String,
    pub vix_momentum: VixMomentum,
    pub fallback: bool,
}

/// Option-chain-derived structural measures (GEX, skew, max pain, PCR).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructMetrics {
    pub net_gex: f64,
    pub max_gex_strike: i32,
    pub gex_ratio: f64,
    pub gex_regime: GexRegime,
    pub pcr: f64,
    pub pcr_atm: f64,
    pub skew_25d: f64,
    pub skew_regime: SkewRegime,
    pub max_pain_strike: i32,
    pub atm_iv: f64,
}

/// Volatility-risk-premium and term-structure edge, per target expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeMetrics {
    pub vrp: f64,
    pub weighted_vrp_weekly: f64,
    pub weighted_vrp_monthly: f64,
    pub weighted_vrp_next_weekly: f64,
    pub term_structure_edge: f64,
    pub selected_expiry_label: String,
}

/// External-flow context (FII/DII positioning) feeding the Risk sub-score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalMetrics {
    pub fii_net_futures: f64,
    pub fii_net_options: f64,
    pub dii_net_futures: f64,
    pub dii_net_options: f64,
    pub data_relevance: bool,
}

/// Regime-engine weight vector; always renormalized to sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DynamicWeights {
    pub vol: f64,
    pub struct_: f64,
    pub edge: f64,
    pub risk: f64,
}

impl DynamicWeights {
    pub fn sum(&self) -> f64 {
        self.vol + self.struct_ + self.edge + self.risk
    }

    pub fn normalized(&self) -> DynamicWeights {
        let s = self.sum();
        if s <= 0.0 {
            return *self;
        }
        DynamicWeights {
            vol: self.vol / s,
            struct_: self.struct_ / s,
            edge: self.edge / s,
            risk: self.risk / s,
        }
    }
}

/// Expiry calendar context: DTEs and gamma-week/month flags for all three expiry kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeMetrics {
    pub weekly_expiry: NaiveDate,
    pub monthly_expiry: NaiveDate,
    pub next_weekly_expiry: NaiveDate,
    pub dte_weekly: i64,
    pub dte_monthly: i64,
    pub dte_next_weekly: i64,
    pub is_gamma_week: bool,
    pub is_gamma_month: bool,
    pub is_past_square_off: bool,
}

/// Raw importance as reported by the calendar feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventImportance {
    Low,
    Medium,
    High,
}

/// Computed classification per the veto/high/medium keyword sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventImpactClass {
    Veto,
    HighImpact,
    MediumImpact,
    Negligible,
}

/// A macro/earnings calendar event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub title: String,
    pub country: String,
    pub importance: EventImportance,
    pub impact: EventImpactClass,
    pub event_time: DateTime<Utc>,
}

/// Confidence banding for a composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    VeryHigh,
    High,
    Moderate,
    Low,
}

/// Four sub-scores plus the weighted composite and its stability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub vol: f64,
    pub struct_: f64,
    pub edge: f64,
    pub risk: f64,
    pub composite: f64,
    pub confidence: Confidence,
    pub score_stability: f64,
    pub drivers: Vec<String>,
}

/// Strategy structure chosen by the regime engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Structure {
    IronFly,
    IronCondor,
    BullPutSpread,
    BearCallSpread,
    CreditSpread,
    NoTrade,
}

impl Structure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Structure::IronFly => "IRON_FLY",
            Structure::IronCondor => "IRON_CONDOR",
            Structure::BullPutSpread => "BULL_PUT_SPREAD",
            Structure::BearCallSpread => "BEAR_CALL_SPREAD",
            Structure::CreditSpread => "CREDIT_SPREAD",
            Structure::NoTrade => "NO_TRADE",
        }
    }
}

/// Directional lean implied by the regime engine's strategy pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectionalBias {
    Bullish,
    Bearish,
    Neutral,
}

/// Output of the regime engine: what to trade, how much, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingMandate {
    pub expiry_kind: ExpiryKind,
    pub regime_name: String,
    pub structure: Structure,
    pub directional_bias: DirectionalBias,
    pub allocation_pct: f64,
    pub deployment_amount: f64,
    pub max_lots: i32,
    pub score: Score,
    pub rationale: Vec<String>,
    pub warnings: Vec<String>,
    pub veto_reasons: Vec<String>,
}

impl TradingMandate {
    pub fn is_vetoed(&self) -> bool {
        self.structure == Structure::NoTrade || !self.veto_reasons.is_empty()
    }
}

/// Persistent circuit-breaker memory; survives process restart via `system_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub consecutive_losses: u32,
    pub peak_capital: f64,
    pub trip_reason: Option<String>,
    pub trip_until: Option<DateTime<Utc>>,
    pub daily_slippage_event_count: u32,
    pub day_key: NaiveDate,
}

impl CircuitBreakerState {
    pub fn is_tripped(&self, now: DateTime<Utc>) -> bool {
        matches!(self.trip_until, Some(until) if now < until)
    }
}

/// Exit-trigger precedence for the Position Monitor; lower discriminant fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitTrigger {
    ManualExit = 1,
    ProfitTarget = 2,
    StopLoss = 3,
    ExpiryWindow = 4,
    DeltaBreach = 5,
    ThetaVegaDecay = 6,
    VetoEvent = 7,
}

impl ExitTrigger {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ExitTrigger::ManualExit => "MANUAL_EXIT",
            ExitTrigger::ProfitTarget => "PROFIT_TARGET",
            ExitTrigger::StopLoss => "STOP_LOSS",
            ExitTrigger::ExpiryWindow => "EXPIRY_WINDOW",
            ExitTrigger::DeltaBreach => "DELTA_BREACH",
            ExitTrigger::ThetaVegaDecay => "THETA_VEGA_DECAY",
            ExitTrigger::VetoEvent => "VETO_EVENT",
        }
    }
}

/// Live Greeks + quote snapshot: the Market Data Cache's value type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeksData {
    pub delta: f64,
    pub theta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub iv: f64,
    pub ltp: f64,
    pub oi: i64,
    pub timestamp: DateTime<Utc>,
}

/// Market session state, used by the controller's cycle gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    PreOpen,
    Open,
    Closed,
    PostMarket,
}

/// Instrument master row as returned by the broker's instrument dump / option chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub token: String,
    pub symbol: String,
    pub name: String,
    pub expiry: String,
    pub strike: f64,
    pub lotsize: i32,
    pub instrument_type: String,
    pub exch_seg: String,
    pub tick_size: f64,
}
