//! Notification Sink (C14): best-effort outbound alerting, ported from the
//! teacher's `utils/telegram.py` onto the event-bus pub/sub the rest of the
//! crate already uses instead of being called inline from each component.
//! A send failure is logged at `warn` and swallowed; this sink never hands
//! an error back to its caller.
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::warn;

use crate::config::Config;
use crate::events::event_bus::EventBus;
use crate::events::types::{Event, EventPayload, EventType};

const TELEGRAM_MIN_INTERVAL: StdDuration = StdDuration::from_millis(1000);

pub struct NotificationSink {
    client: reqwest::Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
    last_send: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl NotificationSink {
    pub fn new(config: &Config) -> Self {
        NotificationSink {
            client: reqwest::Client::new(),
            bot_token: config.notify_bot_token.clone(),
            chat_id: config.notify_chat_id.clone(),
            last_send: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    /// Sends one message, rate-limited to one per second. Never returns an
    /// error; failures are logged and discarded.
    pub async fn send(&self, message: &str) {
        let (Some(bot_token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return;
        };

        {
            let mut last_send = self.last_send.lock().await;
            if let Some(last) = *last_send {
                let elapsed = last.elapsed();
                if elapsed < TELEGRAM_MIN_INTERVAL {
                    tokio::time::sleep(TELEGRAM_MIN_INTERVAL - elapsed).await;
                }
            }
            *last_send = Some(tokio::time::Instant::now());
        }

        let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": format!("*VOLGUARD*\n{message}"),
            "parse_mode": "Markdown",
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.post(&url).json(&body).timeout(StdDuration::from_secs(5)).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => warn!(status = %resp.status(), attempt, "telegram send rejected"),
                Err(e) => warn!(error = %e, attempt, "telegram send failed"),
            }
            if attempt >= 3 {
                warn!("giving up on telegram alert after 3 attempts");
                return;
            }
            tokio::time::sleep(StdDuration::from_secs(2u64.pow(attempt - 1))).await;
        }
    }

    fn format_event(event: &Event) -> Option<String> {
        match &event.payload {
            EventPayload::CircuitBreakerTripped { reason, trip_until } => {
                Some(format!("\u{1f6a8} circuit breaker tripped: {reason} (until {trip_until})"))
            }
            EventPayload::CircuitBreakerReset { at } => Some(format!("\u{2705} circuit breaker reset at {at}")),
            EventPayload::ManualInterventionRequired { trade_id, instrument_key, reason } => {
                Some(format!("\u{1f6a8} manual intervention required on {trade_id} / {instrument_key}: {reason}"))
            }
            EventPayload::TradeClosed { trade_id, exit_reason, realized_pnl } => {
                Some(format!("\u{1f4b0} trade {trade_id} closed ({exit_reason}), realized pnl {realized_pnl:.2}"))
            }
            EventPayload::TradeExecutionFailed { reason } => Some(format!("\u{274c} trade execution failed: {reason}")),
            EventPayload::KillSwitchActivated { reason, manual } => {
                Some(format!("\u{1f6a8} kill switch activated ({}): {reason}", if *manual { "manual" } else { "automatic" }))
            }
            _ => None,
        }
    }

    /// Registers handlers on the event bus for the event types this sink
    /// alerts on. Call once during bootstrap, before `start_processing`.
    pub async fn attach(self: Arc<Self>, bus: &EventBus) {
        for event_type in [
            EventType::CircuitBreakerTripped,
            EventType::CircuitBreakerReset,
            EventType::ManualInterventionRequired,
            EventType::TradeClosed,
            EventType::TradeExecutionFailed,
            EventType::KillSwitchActivated,
        ] {
            let sink = Arc::clone(&self);
            bus.subscribe(
                event_type,
                Arc::new(move |event: Event| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        if let Some(message) = Self::format_event(&event) {
                            sink.send(&message).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(bot_token: Option<&str>, chat_id: Option<&str>) -> Config {
        std::env::set_var("VG_DRY_RUN", "true");
        let mut config = crate::config::loader::load_config().expect("config loads");
        config.notify_bot_token = bot_token.map(str::to_string);
        config.notify_chat_id = chat_id.map(str::to_string);
        config
    }

    #[test]
    fn unconfigured_sink_is_reported_as_such() {
        let config = test_config(None, None);
        let sink = NotificationSink::new(&config);
        assert!(!sink.is_configured());
    }

    #[test]
    fn configured_sink_is_reported_as_such() {
        let config = test_config(Some("token"), Some("chat"));
        let sink = NotificationSink::new(&config);
        assert!(sink.is_configured());
    }

    #[test]
    fn unhandled_event_types_format_to_none() {
        let event = Event::new(EventType::LogInitialized, EventPayload::LogInitialized { log_level: "info".to_string() });
        assert!(NotificationSink::format_event(&event).is_none());
    }

    #[test]
    fn circuit_breaker_trip_formats_a_message() {
        let event = Event::new(
            EventType::CircuitBreakerTripped,
            EventPayload::CircuitBreakerTripped { reason: "daily loss limit".to_string(), trip_until: chrono::Utc::now() },
        );
        let message = NotificationSink::format_event(&event).expect("formats");
        assert!(message.contains("daily loss limit"));
    }
}
