//! Paper-trading `BrokerGateway`: probabilistic fills with Gaussian slippage,
//! so the control plane can be dry-run without a funded account. Fill
//! probability and slippage distribution are grounded in the reference
//! paper-trading engine; the `Arc<RwLock<HashMap<_>>>` order book follows the
//! teacher's `PaperTradingBroker`.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::broker::{BrokerGateway, ChainRow, OrderStatusSnapshot};
use crate::config::Config;
use crate::error::{Result, TradingError};
use crate::types::{Bar, GreeksData, InstrumentKey, OptionLeg, OrderStatus, Side};

const FILL_PROBABILITY: f64 = 0.97;
const SLIPPAGE_MEAN: f64 = 0.0015;
const SLIPPAGE_STD: f64 = 0.001;
const SIMULATED_FUNDS: f64 = 5_000_000.0;

#[derive(Debug, Clone)]
struct SimulatedOrder {
    status: OrderStatus,
    filled_qty: i32,
    avg_price: f64,
}

pub struct PaperBrokerGateway {
    orders: Arc<RwLock<HashMap<String, SimulatedOrder>>>,
    config: Arc<Config>,
}

impl PaperBrokerGateway {
    pub fn new(config: Arc<Config>) -> Self {
        PaperBrokerGateway { orders: Arc::new(RwLock::new(HashMap::new())), config: config.clone() }
    }

    fn simulate_fill(&self, side: Side, limit_price: f64) -> (bool, f64) {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() > FILL_PROBABILITY {
            return (false, 0.0);
        }

        let normal = Normal::new(SLIPPAGE_MEAN, SLIPPAGE_STD).expect("valid slippage distribution");
        let slippage = normal.sample(&mut rng).max(0.0);

        let fill_price = match side {
            Side::Buy => limit_price * (1.0 + slippage),
            Side::Sell => limit_price * (1.0 - slippage),
        };

        (true, (fill_price * 100.0).round() / 100.0)
    }
}

#[async_trait]
impl BrokerGateway for PaperBrokerGateway {
    async fn place_order(&self, leg: &OptionLeg, limit_price: f64) -> Result<String> {
        let order_id = format!("PAPER_{}", uuid::Uuid::new_v4());
        let (filled, fill_price) = self.simulate_fill(leg.side, limit_price);

        let order = if filled {
            info!(
                order_id = %order_id, leg = %leg.instrument_key, side = leg.side.as_str(),
                qty = leg.quantity, fill_price, "paper order filled"
            );
            SimulatedOrder { status: OrderStatus::Filled, filled_qty: leg.quantity, avg_price: fill_price }
        } else {
            warn!(order_id = %order_id, leg = %leg.instrument_key, "paper order rejected (simulated)");
            SimulatedOrder { status: OrderStatus::Rejected, filled_qty: 0, avg_price: 0.0 }
        };

        self.orders.write().await.insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusSnapshot> {
        let orders = self.orders.read().await;
        let order = orders.get(order_id).ok_or_else(|| TradingError::OrderNotFound(order_id.to_string()))?;
        Ok(OrderStatusSnapshot { status: order.status, filled_qty: order.filled_qty, avg_price: order.avg_price })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(order_id) {
            Some(order) if order.status != OrderStatus::Filled => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            Some(_) => Err(TradingError::Rejected("already filled".to_string())),
            None => Err(TradingError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn get_ltp(&self, _key: &InstrumentKey) -> Result<f64> {
        Err(TradingError::MissingData("paper gateway has no independent quote source".to_string()))
    }

    async fn get_option_chain(&self, _expiry: NaiveDate) -> Result<Vec<ChainRow>> {
        Err(TradingError::MissingData("paper gateway has no independent chain source".to_string()))
    }

    async fn get_historical_candles(&self, _key: &InstrumentKey, _interval: &str, _days: u32) -> Result<Vec<Bar>> {
        Err(TradingError::MissingData("paper gateway has no independent historical source".to_string()))
    }

    async fn required_margin(&self, _legs: &[OptionLeg]) -> Result<f64> {
        Ok(self.config.margin_sell_base)
    }

    async fn available_funds(&self) -> Result<f64> {
        Ok(SIMULATED_FUNDS)
    }

    async fn exit_all_positions(&self) -> Result<()> {
        let mut orders = self.orders.write().await;
        for order in orders.values_mut() {
            if order.status != OrderStatus::Filled {
                order.status = OrderStatus::Cancelled;
            }
        }
        info!("paper gateway: all open simulated orders cancelled");
        Ok(())
    }

    async fn subscribe_greeks(
        &self,
        _keys: Vec<InstrumentKey>,
    ) -> Result<mpsc::UnboundedReceiver<(InstrumentKey, GreeksData)>> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LegRole, OptionType};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
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
        })
    }

    fn test_leg(side: Side) -> OptionLeg {
        OptionLeg {
            instrument_key: "12345".to_string(),
            option_type: OptionType::Call,
            strike: 24500,
            side,
            quantity: 75,
            role: LegRole::Core,
            reference_premium: 120.0,
            lot_size: 75,
            expiry: chrono::Utc::now().date_naive(),
            order_id: None,
            filled_qty: 0,
            avg_fill_price: None,
            slippage_pct: None,
            fill_time: None,
        }
    }

    #[tokio::test]
    async fn sell_leg_fills_with_negative_slippage_direction() {
        let gw = PaperBrokerGateway::new(test_config());
        let leg = test_leg(Side::Sell);
        let order_id = gw.place_order(&leg, 120.0).await.unwrap();
        let snapshot = gw.get_order_status(&order_id).await.unwrap();
        if snapshot.status == OrderStatus::Filled {
            assert!(snapshot.avg_price <= 120.0);
        }
    }

    #[tokio::test]
    async fn cancel_after_fill_is_rejected() {
        let gw = PaperBrokerGateway::new(test_config());
        let leg = test_leg(Side::Buy);
        let mut order_id = String::new();
        for _ in 0..20 {
            order_id = gw.place_order(&leg, 120.0).await.unwrap();
            if gw.get_order_status(&order_id).await.unwrap().status == OrderStatus::Filled {
                break;
            }
        }
        if gw.get_order_status(&order_id).await.unwrap().status == OrderStatus::Filled {
            assert!(gw.cancel_order(&order_id).await.is_err());
        }
    }

    #[tokio::test]
    async fn available_funds_is_fixed() {
        let gw = PaperBrokerGateway::new(test_config());
        assert_eq!(gw.available_funds().await.unwrap(), SIMULATED_FUNDS);
    }
}
