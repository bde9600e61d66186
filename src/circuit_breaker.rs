//! Circuit Breaker (C8): persistent trip state machine. Any component may
//! call `record_trade_result`/`record_slippage_event`/`check_kill_switch_and_trip`
//! to report a signal; this module decides whether it trips and durably
//! persists every state change before acknowledging, via the `CircuitBreakerStore`
//! seam (implemented by `persistence.rs`). Grounded on
//! `original_source/core/risk_manager.py::activate_circuit_breaker` and friends.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::types::CircuitBreakerState;

#[async_trait]
pub trait CircuitBreakerStore: Send + Sync {
    async fn load_circuit_breaker_state(&self) -> Result<Option<CircuitBreakerState>>;
    async fn save_circuit_breaker_state(&self, state: &CircuitBreakerState) -> Result<()>;
}

pub struct CircuitBreaker {
    config: Arc<Config>,
    store: Arc<dyn CircuitBreakerStore>,
    state: RwLock<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Loads prior state from the store, or starts fresh with `peak_capital`
    /// seeded at `base_capital` if nothing was persisted yet.
    pub async fn load(config: Arc<Config>, store: Arc<dyn CircuitBreakerStore>) -> Result<Self> {
        let state = store.load_circuit_breaker_state().await?.unwrap_or_else(|| CircuitBreakerState {
            consecutive_losses: 0,
            peak_capital: config.base_capital,
            trip_reason: None,
            trip_until: None,
            daily_slippage_event_count: 0,
            day_key: Utc::now().date_naive(),
        });

        Ok(CircuitBreaker { config, store, state: RwLock::new(state) })
    }

    pub async fn state(&self) -> CircuitBreakerState {
        self.state.read().await.clone()
    }

    pub async fn is_tripped(&self, now: DateTime<Utc>) -> bool {
        self.state.read().await.is_tripped(now)
    }

    fn roll_day_if_needed(state: &mut CircuitBreakerState, today: NaiveDate) {
        if state.day_key != today {
            state.day_key = today;
            state.daily_slippage_event_count = 0;
        }
    }

    async fn trip(&self, reason: String, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        warn!(reason = %reason, "circuit breaker tripped");
        state.trip_reason = Some(reason);
        state.trip_until = Some(now + Duration::hours(self.config.circuit_breaker_trip_hours));
        self.store.save_circuit_breaker_state(&state).await
    }

    /// Auto-resets a tripped breaker once `trip_until` has passed.
    pub async fn maybe_auto_reset(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if matches!(state.trip_until, Some(until) if now >= until) {
            info!("circuit breaker auto-reset, trip window elapsed");
            state.trip_reason = None;
            state.trip_until = None;
            self.store.save_circuit_breaker_state(&state).await?;
        }
        Ok(())
    }

    /// Updates the loss/drawdown/streak counters after a trade closes and
    /// trips the breaker if any of the three thresholds are breached.
    pub async fn record_trade_result(&self, realized_pnl: f64, current_capital: f64, now: DateTime<Utc>) -> Result<()> {
        let mut trip_reasons = Vec::new();

        {
            let mut state = self.state.write().await;
            Self::roll_day_if_needed(&mut state, now.date_naive());

            if current_capital > state.peak_capital {
                state.peak_capital = current_capital;
            }

            if realized_pnl < 0.0 {
                state.consecutive_losses += 1;
            } else {
                state.consecutive_losses = 0;
            }

            let loss_from_peak = (state.peak_capital - current_capital).max(0.0);

            let daily_loss_pct = loss_from_peak / self.config.base_capital;
            if daily_loss_pct >= self.config.daily_loss_limit_pct {
                trip_reasons.push(format!(
                    "daily loss {:.2}% of base capital >= limit {:.2}%",
                    daily_loss_pct * 100.0,
                    self.config.daily_loss_limit_pct * 100.0
                ));
            }

            if state.peak_capital > 0.0 {
                let drawdown_pct = loss_from_peak / state.peak_capital;
                if drawdown_pct >= self.config.max_drawdown_pct {
                    trip_reasons.push(format!(
                        "drawdown {:.2}% >= limit {:.2}%",
                        drawdown_pct * 100.0,
                        self.config.max_drawdown_pct * 100.0
                    ));
                }
            }

            if state.consecutive_losses >= self.config.consecutive_loss_limit {
                trip_reasons.push(format!("{} consecutive losing trades", state.consecutive_losses));
            }

            self.store.save_circuit_breaker_state(&state).await?;
        }

        if !trip_reasons.is_empty() {
            self.trip(trip_reasons.join("; "), now).await?;
        }

        Ok(())
    }

    /// Reports one slippage event (a filled leg whose slippage exceeded the
    /// Order Orchestrator's alert threshold) and trips at the daily limit.
    pub async fn record_slippage_event(&self, now: DateTime<Utc>) -> Result<()> {
        let should_trip;

        {
            let mut state = self.state.write().await;
            Self::roll_day_if_needed(&mut state, now.date_naive());
            state.daily_slippage_event_count += 1;
            should_trip = state.daily_slippage_event_count >= self.config.slippage_event_daily_limit;
            self.store.save_circuit_breaker_state(&state).await?;
        }

        if should_trip {
            self.trip(format!("{} slippage events today", self.config.slippage_event_daily_limit), now).await?;
        }

        Ok(())
    }

    /// Checks the manual kill-switch file and trips if present and not
    /// already tripped.
    pub async fn check_kill_switch_and_trip(&self, now: DateTime<Utc>) -> Result<()> {
        if std::path::Path::new(&self.config.kill_switch_file).exists() && !self.is_tripped(now).await {
            self.trip("manual kill switch file present".to_string(), now).await?;
        }
        Ok(())
    }

    /// Trips the breaker for a condition observed outside the trade/slippage/
    /// kill-switch signals this module tracks itself (e.g. the controller
    /// reporting repeated analysis-cycle failures). No-op if already tripped.
    pub async fn trip_for_reason(&self, reason: String, now: DateTime<Utc>) -> Result<()> {
        if !self.is_tripped(now).await {
            self.trip(reason, now).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MemoryStore {
        saved: Mutex<Option<CircuitBreakerState>>,
    }

    #[async_trait]
    impl CircuitBreakerStore for MemoryStore {
        async fn load_circuit_breaker_state(&self) -> Result<Option<CircuitBreakerState>> {
            Ok(self.saved.lock().unwrap().clone())
        }

        async fn save_circuit_breaker_state(&self, state: &CircuitBreakerState) -> Result<()> {
            *self.saved.lock().unwrap() = Some(state.clone());
            Ok(())
        }
    }

    fn test_config() -> Config {
        std::env::set_var("VG_DRY_RUN", "true");
        crate::config::loader::load_config().expect("config loads")
    }

    #[tokio::test]
    async fn fresh_breaker_is_not_tripped() {
        let store = Arc::new(MemoryStore { saved: Mutex::new(None) });
        let breaker = CircuitBreaker::load(Arc::new(test_config()), store).await.unwrap();
        assert!(!breaker.is_tripped(Utc::now()).await);
    }

    #[tokio::test]
    async fn three_consecutive_losses_trip_the_breaker() {
        let store = Arc::new(MemoryStore { saved: Mutex::new(None) });
        let config = Arc::new(test_config());
        let breaker = CircuitBreaker::load(config, store).await.unwrap();
        let now = Utc::now();

        breaker.record_trade_result(-1000.0, 999_000.0, now).await.unwrap();
        breaker.record_trade_result(-1000.0, 998_000.0, now).await.unwrap();
        assert!(!breaker.is_tripped(now).await);
        breaker.record_trade_result(-1000.0, 997_000.0, now).await.unwrap();

        assert!(breaker.is_tripped(now).await);
    }

    #[tokio::test]
    async fn winning_trade_resets_consecutive_loss_counter() {
        let store = Arc::new(MemoryStore { saved: Mutex::new(None) });
        let config = Arc::new(test_config());
        let breaker = CircuitBreaker::load(config, store).await.unwrap();
        let now = Utc::now();

        breaker.record_trade_result(-1000.0, 999_000.0, now).await.unwrap();
        breaker.record_trade_result(500.0, 999_500.0, now).await.unwrap();
        assert_eq!(breaker.state().await.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn slippage_events_trip_at_daily_limit() {
        let store = Arc::new(MemoryStore { saved: Mutex::new(None) });
        let config = Arc::new(test_config());
        let breaker = CircuitBreaker::load(config, store).await.unwrap();
        let now = Utc::now();

        for _ in 0..4 {
            breaker.record_slippage_event(now).await.unwrap();
        }
        assert!(!breaker.is_tripped(now).await);
        breaker.record_slippage_event(now).await.unwrap();
        assert!(breaker.is_tripped(now).await);
    }

    #[tokio::test]
    async fn auto_reset_clears_trip_after_window() {
        let store = Arc::new(MemoryStore { saved: Mutex::new(None) });
        let config = Arc::new(test_config());
        let breaker = CircuitBreaker::load(config, store).await.unwrap();
        let now = Utc::now();

        breaker.record_trade_result(-1000.0, 900_000.0, now).await.unwrap();
        breaker.record_trade_result(-1000.0, 890_000.0, now).await.unwrap();
        breaker.record_trade_result(-1000.0, 880_000.0, now).await.unwrap();
        assert!(breaker.is_tripped(now).await);

        let later = now + Duration::hours(25);
        breaker.maybe_auto_reset(later).await.unwrap();
        assert!(!breaker.is_tripped(later).await);
    }
}
