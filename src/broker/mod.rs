pub mod tokens;
pub mod instrument_cache;
pub mod live;
pub mod paper;

pub use instrument_cache::InstrumentCache;
pub use live::LiveBrokerGateway;
pub use paper::PaperBrokerGateway;
pub use tokens::TokenManager;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Bar, GreeksData, InstrumentKey, OptionLeg, OptionType, OrderStatus};

/// A snapshot of an order's current state, as reported by the broker.
#[derive(Debug, Clone)]
pub struct OrderStatusSnapshot {
    pub status: OrderStatus,
    pub filled_qty: i32,
    pub avg_price: f64,
}

/// One row of a broker option-chain response.
#[derive(Debug, Clone)]
pub struct ChainRow {
    pub instrument_key: InstrumentKey,
    pub strike: i32,
    pub option_type: OptionType,
    pub expiry: NaiveDate,
    pub ltp: f64,
    pub bid: f64,
    pub ask: f64,
    pub oi: i64,
    pub iv: f64,
    pub delta: f64,
    pub theta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub lot_size: i32,
}

/// Unified broker surface shared by the live (HTTP/TOTP) and paper-trading
/// implementations. All mutating calls assume the caller owns idempotency once
/// an order id has been returned.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn place_order(&self, leg: &OptionLeg, limit_price: f64) -> Result<String>;
    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusSnapshot>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;
    async fn get_ltp(&self, key: &InstrumentKey) -> Result<f64>;
    async fn get_option_chain(&self, expiry: NaiveDate) -> Result<Vec<ChainRow>>;
    async fn get_historical_candles(&self, key: &InstrumentKey, interval: &str, days: u32) -> Result<Vec<Bar>>;
    /// Returns `f64::INFINITY` when the broker imposes no practical margin ceiling.
    async fn required_margin(&self, legs: &[OptionLeg]) -> Result<f64>;
    async fn available_funds(&self) -> Result<f64>;
    async fn exit_all_positions(&self) -> Result<()>;
    async fn subscribe_greeks(
        &self,
        keys: Vec<InstrumentKey>,
    ) -> Result<mpsc::UnboundedReceiver<(InstrumentKey, GreeksData)>>;
}
