//! Order Orchestrator (C9): the transactional heart. `execute_strategy` places
//! hedges first, then cores, and flattens everything filled so far on any
//! phase failure. Grounded on the teacher's `src/orders/manager.rs` (retry,
//! idempotency, event-emitting style) and `original_source/core/execution.py`
//! (the phased algorithm). The flatten price reference is corrected from the
//! source's stale-entry-price bug — see DESIGN.md.
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerGateway;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::{Result, TradingError};
use crate::events::event_bus::EventBus;
use crate::events::types::{Event, EventPayload, EventType};
use crate::types::{ExpiryKind, LegRole, OptionLeg, OrderStatus, Side, Structure, Trade, TradeStatus};
use crate::utils::idempotency::generate_idempotency_key;

const FLAT_BROKERAGE_PER_ORDER: f64 = 20.0;

/// Persists a trade's current state. Implemented by `persistence.rs`; the
/// trait lives here (rather than in `monitor.rs`, which already depends on
/// this module) so `exit_strategy` can persist the `Open -> Closing`
/// transition before placing reversing legs, not just the final state.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn list_open_trades(&self) -> Result<Vec<Trade>>;
    async fn save_trade(&self, trade: &Trade) -> Result<()>;
}

pub struct OrderOrchestrator {
    broker: Arc<dyn BrokerGateway>,
    circuit_breaker: Arc<CircuitBreaker>,
    event_bus: Arc<EventBus>,
    config: Arc<Config>,
    store: Arc<dyn TradeStore>,
}

impl OrderOrchestrator {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        circuit_breaker: Arc<CircuitBreaker>,
        event_bus: Arc<EventBus>,
        config: Arc<Config>,
        store: Arc<dyn TradeStore>,
    ) -> Self {
        OrderOrchestrator { broker, circuit_breaker, event_bus, config, store }
    }

    fn preflight(&self, legs: &[OptionLeg], max_loss: f64) -> std::result::Result<(), Vec<String>> {
        let mut violations = Vec::new();

        if legs.is_empty() {
            violations.push("no legs to execute".to_string());
            return Err(violations);
        }

        for leg in legs {
            if leg.quantity <= 0 || leg.quantity % leg.lot_size != 0 {
                violations.push(format!("{}: quantity {} is not a positive multiple of lot size {}", leg.instrument_key, leg.quantity, leg.lot_size));
            }
        }

        if max_loss > self.config.max_loss_per_trade {
            violations.push(format!("max loss {:.0} exceeds per-trade limit {:.0}", max_loss, self.config.max_loss_per_trade));
        }

        let projected_premium: f64 = legs.iter().filter(|l| l.side == Side::Sell).map(|l| l.reference_premium * l.quantity as f64).sum();
        if projected_premium > 0.0 {
            let brokerage_cost = FLAT_BROKERAGE_PER_ORDER * legs.len() as f64;
            if (projected_premium - brokerage_cost) < projected_premium * (1.0 - self.config.brokerage_impact_threshold_pct) {
                violations.push(format!("brokerage {:.2} too high against projected premium {:.2}", brokerage_cost, projected_premium));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn limit_price_for(&self, leg: &OptionLeg) -> f64 {
        match leg.role {
            LegRole::Hedge => leg.reference_premium * (1.0 - self.config.hedge_price_offset_pct),
            LegRole::Core => match leg.side {
                Side::Buy => leg.reference_premium * (1.0 + self.config.core_buy_price_offset_pct),
                Side::Sell => leg.reference_premium * (1.0 - self.config.core_sell_price_offset_pct),
            },
        }
    }

    /// Places and polls a single leg to fill or failure. Never errors; a
    /// failed leg is reported through the returned `Option`.
    async fn place_and_track_leg(&self, trade_id: &str, mut leg: OptionLeg) -> Option<OptionLeg> {
        let limit_price = self.limit_price_for(&leg);
        let quantity_str = leg.quantity.to_string();
        let idempotency_key = generate_idempotency_key(&[trade_id, leg.instrument_key.as_str(), leg.side.as_str(), quantity_str.as_str()]);

        let order_id = match self.broker.place_order(&leg, limit_price).await {
            Ok(id) => id,
            Err(e) => {
                warn!(leg = %leg.instrument_key, idempotency_key, error = %e, "leg order placement failed");
                self.emit(EventType::LegFailed, EventPayload::LegFailed { trade_id: trade_id.to_string(), instrument_key: leg.instrument_key.clone(), reason: e.to_string() }).await;
                return None;
            }
        };
        leg.order_id = Some(order_id.clone());
        info!(leg = %leg.instrument_key, order_id = %order_id, idempotency_key, "leg order placed");

        self.emit(EventType::LegOrderPlaced, EventPayload::LegOrderPlaced {
            trade_id: trade_id.to_string(),
            instrument_key: leg.instrument_key.clone(),
            order_id: order_id.clone(),
            price: limit_price,
        })
        .await;

        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(self.config.order_timeout_sec);
        let poll_interval = StdDuration::from_millis(self.config.order_poll_interval_ms);

        loop {
            let status = match self.broker.get_order_status(&order_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(leg = %leg.instrument_key, error = %e, "order status poll failed");
                    tokio::time::sleep(poll_interval).await;
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    continue;
                }
            };

            match status.status {
                OrderStatus::Filled | OrderStatus::PartiallyFilled => {
                    leg.filled_qty = status.filled_qty;
                    leg.avg_fill_price = Some(status.avg_price);
                    if leg.fill_sufficient() {
                        return Some(self.finish_fill(trade_id, leg, status.avg_price).await);
                    }
                    if status.status == OrderStatus::Filled {
                        return None;
                    }
                }
                OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Failed => {
                    self.emit(EventType::LegFailed, EventPayload::LegFailed { trade_id: trade_id.to_string(), instrument_key: leg.instrument_key.clone(), reason: format!("{:?}", status.status) }).await;
                    return None;
                }
                OrderStatus::Pending | OrderStatus::Submitted => {}
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = self.broker.cancel_order(&order_id).await;
                if let Ok(post_cancel) = self.broker.get_order_status(&order_id).await {
                    if post_cancel.status == OrderStatus::Filled {
                        leg.filled_qty = post_cancel.filled_qty;
                        leg.avg_fill_price = Some(post_cancel.avg_price);
                        if leg.fill_sufficient() {
                            return Some(self.finish_fill(trade_id, leg, post_cancel.avg_price).await);
                        }
                    }
                }
                self.emit(EventType::LegFailed, EventPayload::LegFailed { trade_id: trade_id.to_string(), instrument_key: leg.instrument_key.clone(), reason: "timed out".to_string() }).await;
                return None;
            }

            tokio::time::sleep(poll_interval).await;
        }

        None
    }

    /// Records the fill timestamp/slippage and reports the slippage event if
    /// it crosses the alert threshold.
    async fn finish_fill(&self, trade_id: &str, mut leg: OptionLeg, fill_price: f64) -> OptionLeg {
        leg.fill_time = Some(Utc::now());
        let slippage = (fill_price - leg.reference_premium).abs() / leg.reference_premium;
        leg.slippage_pct = Some(slippage);

        self.emit(EventType::LegFilled, EventPayload::LegFilled {
            trade_id: trade_id.to_string(),
            instrument_key: leg.instrument_key.clone(),
            fill_price,
            fill_qty: leg.filled_qty,
        })
        .await;

        if slippage > self.config.slippage_alert_threshold_pct {
            self.emit(EventType::SlippageEventRecorded, EventPayload::SlippageEventRecorded {
                trade_id: trade_id.to_string(),
                instrument_key: leg.instrument_key.clone(),
                slippage_pct: slippage,
            })
            .await;
            if let Err(e) = self.circuit_breaker.record_slippage_event(Utc::now()).await {
                error!(error = %e, "failed to persist slippage event");
            }
        }

        leg
    }

    /// Places every leg in a phase concurrently; fails the whole phase if
    /// any single leg fails.
    async fn execute_phase(&self, trade_id: &str, legs: Vec<OptionLeg>) -> std::result::Result<Vec<OptionLeg>, Vec<OptionLeg>> {
        let futures = legs.into_iter().map(|leg| self.place_and_track_leg(trade_id, leg));
        let results = futures_util::future::join_all(futures).await;

        let mut filled = Vec::new();
        let mut any_failed = false;
        for result in results {
            match result {
                Some(leg) => filled.push(leg),
                None => any_failed = true,
            }
        }

        if any_failed {
            Err(filled)
        } else {
            Ok(filled)
        }
    }

    /// Reverses every already-filled leg at the *current* market price (not
    /// the stale entry price), escalating from market orders to aggressive
    /// limits and finally a manual-intervention alert.
    async fn flatten(&self, trade_id: &str, filled_legs: &[OptionLeg], phase: &str) {
        let mut flattened = 0usize;

        for leg in filled_legs {
            let reversing_side = leg.side.opposite();

            let current_ltp = match self.broker.get_ltp(&leg.instrument_key).await {
                Ok(ltp) => ltp,
                Err(_) => leg.avg_fill_price.unwrap_or(leg.reference_premium),
            };

            let reversing = leg.reversed(current_ltp);

            let mut done = false;

            for _ in 0..self.config.flatten_market_retries {
                if self.broker.place_order(&reversing, current_ltp).await.is_ok() {
                    done = true;
                    break;
                }
            }

            if !done {
                for _ in 0..self.config.flatten_limit_retries {
                    let offset = self.config.flatten_limit_offset_pct;
                    let aggressive_price = match reversing_side {
                        Side::Buy => current_ltp * (1.0 + offset),
                        Side::Sell => current_ltp * (1.0 - offset),
                    };
                    if self.broker.place_order(&reversing, aggressive_price).await.is_ok() {
                        done = true;
                        break;
                    }
                }
            }

            if done {
                flattened += 1;
            } else {
                error!(leg = %leg.instrument_key, "leg could not be flattened, manual intervention required");
                self.emit(EventType::ManualInterventionRequired, EventPayload::ManualInterventionRequired {
                    trade_id: trade_id.to_string(),
                    instrument_key: leg.instrument_key.clone(),
                    reason: "unable to flatten leg after market and aggressive-limit retries".to_string(),
                })
                .await;
            }
        }

        self.emit(EventType::PhaseFlattened, EventPayload::PhaseFlattened { trade_id: trade_id.to_string(), phase: phase.to_string(), legs_flattened: flattened }).await;
    }

    async fn emit(&self, event_type: EventType, payload: EventPayload) {
        if let Err(e) = self.event_bus.publish(Event::new(event_type, payload)).await {
            warn!(error = %e, "event publish failed");
        }
    }

    /// Executes a mandate's legs. Returns `Ok(None)` for any preflight or
    /// phase failure (nothing left open); `Ok(Some(trade))` on success.
    pub async fn execute_strategy(
        &self,
        legs: Vec<OptionLeg>,
        structure: Structure,
        expiry_kind: ExpiryKind,
        expiry_date: chrono::NaiveDate,
        max_loss: f64,
    ) -> Result<Option<Trade>> {
        if let Err(violations) = self.preflight(&legs, max_loss) {
            warn!(violations = ?violations, "order orchestrator preflight failed");
            self.emit(EventType::TradeExecutionFailed, EventPayload::TradeExecutionFailed { reason: violations.join("; ") }).await;
            return Ok(None);
        }

        let trade_id = Uuid::new_v4().to_string();
        let (hedges, cores): (Vec<OptionLeg>, Vec<OptionLeg>) = legs.into_iter().partition(|l| l.role == LegRole::Hedge);

        let hedge_fills = match self.execute_phase(&trade_id, hedges).await {
            Ok(filled) => filled,
            Err(filled_so_far) => {
                self.flatten(&trade_id, &filled_so_far, "hedge").await;
                self.emit(EventType::TradeExecutionFailed, EventPayload::TradeExecutionFailed { reason: "hedge phase failed".to_string() }).await;
                return Ok(None);
            }
        };

        let core_fills = match self.execute_phase(&trade_id, cores).await {
            Ok(filled) => filled,
            Err(filled_so_far) => {
                let mut all_filled = hedge_fills;
                all_filled.extend(filled_so_far);
                self.flatten(&trade_id, &all_filled, "core").await;
                self.emit(EventType::TradeExecutionFailed, EventPayload::TradeExecutionFailed { reason: "core phase failed".to_string() }).await;
                return Ok(None);
            }
        };

        let mut all_legs = hedge_fills;
        all_legs.extend(core_fills);

        let entry_credit: f64 = all_legs
            .iter()
            .map(|l| {
                let price = l.avg_fill_price.unwrap_or(l.reference_premium);
                match l.side {
                    Side::Sell => price * l.filled_qty as f64,
                    Side::Buy => -price * l.filled_qty as f64,
                }
            })
            .sum();

        let trade = Trade {
            trade_id: trade_id.clone(),
            strategy: structure,
            expiry_kind,
            expiry_date,
            status: TradeStatus::Open,
            entry_time: Utc::now(),
            legs: all_legs,
            entry_credit,
            max_loss,
            realized_pnl: None,
            exit_time: None,
            exit_reason: None,
            manual_exit_flag: false,
            net_delta: 0.0,
            net_theta: 0.0,
            net_gamma: 0.0,
            net_vega: 0.0,
        };

        info!(trade_id = %trade_id, entry_credit, "trade opened");
        self.emit(EventType::TradeOpened, EventPayload::TradeOpened { trade_id: trade_id.clone(), structure, entry_credit }).await;

        Ok(Some(trade))
    }

    /// Exits an open trade: builds reversing legs for every leg and executes
    /// them through the same phased primitive, treating the whole reversal
    /// as a single core phase (no hedge/core distinction on exit).
    pub async fn exit_strategy(&self, trade: &mut Trade, reason: &str) -> Result<()> {
        trade.status = TradeStatus::Closing;
        if let Err(e) = self.store.save_trade(trade).await {
            warn!(trade_id = %trade.trade_id, error = %e, "failed to persist Closing state before placing reversing legs");
        }

        let mut reversing_legs = Vec::with_capacity(trade.legs.len());
        for leg in &trade.legs {
            let current_ltp = self.broker.get_ltp(&leg.instrument_key).await.unwrap_or(leg.avg_fill_price.unwrap_or(leg.reference_premium));
            reversing_legs.push(leg.reversed(current_ltp));
        }

        let fills = match self.execute_phase(&trade.trade_id, reversing_legs).await {
            Ok(filled) => filled,
            Err(filled_so_far) => {
                self.flatten(&trade.trade_id, &filled_so_far, "exit").await;
                return Err(TradingError::OrderPlacementFailed(format!("exit of trade {} partially failed", trade.trade_id)));
            }
        };

        let mut realized_pnl = 0.0;
        for (entry_leg, exit_leg) in trade.legs.iter().zip(fills.iter()) {
            let entry_price = entry_leg.avg_fill_price.unwrap_or(entry_leg.reference_premium);
            let exit_price = exit_leg.avg_fill_price.unwrap_or(exit_leg.reference_premium);
            let qty = entry_leg.filled_qty as f64;
            let pnl = match entry_leg.side {
                Side::Sell => (entry_price - exit_price) * qty,
                Side::Buy => (exit_price - entry_price) * qty,
            };
            realized_pnl += pnl;
        }

        trade.status = TradeStatus::Closed;
        trade.exit_time = Some(Utc::now());
        trade.exit_reason = Some(reason.to_string());
        trade.realized_pnl = Some(realized_pnl);

        info!(trade_id = %trade.trade_id, realized_pnl, reason, "trade closed");
        self.emit(EventType::TradeClosed, EventPayload::TradeClosed { trade_id: trade.trade_id.clone(), exit_reason: reason.to_string(), realized_pnl }).await;

        Ok(())
    }
}
