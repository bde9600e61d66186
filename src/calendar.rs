//! Calendar (C4): economic-event fetch and veto/square-off classification.
//! Keyword lists and the 48-hour square-off threshold are preserved verbatim
//! from `original_source/core/calendar.py`.
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use serde::Deserialize;
use tracing::warn;

use crate::error::Result;
use crate::types::{EconomicEvent, EventImpactClass, EventImportance};

const VETO_KEYWORDS: &[&str] = &[
    "RBI Monetary Policy",
    "RBI Policy",
    "Reserve Bank of India",
    "Repo Rate Decision",
    "MPC Meeting",
    "FOMC",
    "Federal Reserve Meeting",
    "Fed Meeting",
    "Federal Funds Rate Decision",
];

const HIGH_IMPACT_KEYWORDS: &[&str] =
    &["GDP", "Gross Domestic Product", "NFP", "Non-Farm Payroll", "CPI", "Consumer Price Index", "Union Budget", "Budget Speech"];

const MEDIUM_IMPACT_KEYWORDS: &[&str] = &["PMI", "Manufacturing PMI", "Services PMI", "Industrial Production", "Retail Sales"];

const SQUARE_OFF_WINDOW_HOURS: i64 = 48;

#[derive(Debug, Deserialize)]
struct CalendarResponse {
    result: Vec<CalendarItem>,
}

#[derive(Debug, Deserialize)]
struct CalendarItem {
    title: String,
    country: String,
    date: i64,
    importance: i32,
}

fn classify(title: &str) -> (EventImportance, EventImpactClass) {
    if VETO_KEYWORDS.iter().any(|k| title.contains(k)) {
        (EventImportance::High, EventImpactClass::Veto)
    } else if HIGH_IMPACT_KEYWORDS.iter().any(|k| title.contains(k)) {
        (EventImportance::High, EventImpactClass::HighImpact)
    } else if MEDIUM_IMPACT_KEYWORDS.iter().any(|k| title.contains(k)) {
        (EventImportance::Medium, EventImpactClass::MediumImpact)
    } else {
        (EventImportance::Low, EventImpactClass::Negligible)
    }
}

pub struct CalendarClient {
    http: reqwest::Client,
    feed_url: String,
}

impl CalendarClient {
    pub fn new(feed_url: String) -> Self {
        CalendarClient { http: reqwest::Client::new(), feed_url }
    }

    /// Fetches events in the next `days_ahead` days. A fetch failure is
    /// logged and returns an empty list rather than erroring — no calendar
    /// data available means no veto is known, which the risk gate already
    /// treats conservatively via other checks.
    pub async fn fetch_events(&self, days_ahead: i64) -> Vec<EconomicEvent> {
        match self.fetch_events_inner(days_ahead).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "calendar fetch failed, proceeding with no known events");
                Vec::new()
            }
        }
    }

    async fn fetch_events_inner(&self, days_ahead: i64) -> Result<Vec<EconomicEvent>> {
        let from_ts = Utc::now().timestamp();
        let to_ts = (Utc::now() + Duration::days(days_ahead)).timestamp();

        let response = self
            .http
            .get(&self.feed_url)
            .query(&[
                ("from", from_ts.to_string()),
                ("to", to_ts.to_string()),
                ("countries", "IN,US".to_string()),
                ("importance", "1,2,3".to_string()),
            ])
            .header("User-Agent", "Mozilla/5.0")
            .send()
            .await?;

        let body: CalendarResponse = response.json().await?;

        let mut events: Vec<EconomicEvent> = body
            .result
            .into_iter()
            .filter(|item| item.date > 0)
            .map(|item| {
                let (importance, impact) = classify(&item.title);
                EconomicEvent {
                    title: item.title,
                    country: item.country,
                    importance,
                    impact,
                    event_time: DateTime::<Utc>::from_timestamp(item.date, 0).unwrap_or_else(Utc::now),
                }
            })
            .collect();

        events.sort_by_key(|e| e.event_time);
        Ok(events)
    }
}

/// Veto risk summary: whether a veto event is upcoming, its title, whether
/// square-off is required (within 48h), hours until it fires, and (when
/// square-off is required) the suggested time to have flattened by.
#[derive(Debug, Clone)]
pub struct VetoRisk {
    pub has_veto: bool,
    pub event_title: Option<String>,
    pub event_time: Option<DateTime<Utc>>,
    pub square_off_needed: bool,
    pub hours_until: Option<f64>,
    pub suggested_square_off_time: Option<DateTime<Utc>>,
}

/// Within 24h of the event the suggestion is event time minus 2h; beyond that
/// (but still inside the 48h square-off window) it's 14:00 IST on the prior
/// trading day.
fn suggested_square_off_time(event_time: DateTime<Utc>, hours_until: f64) -> Option<DateTime<Utc>> {
    if hours_until <= 24.0 {
        return Some(event_time - Duration::hours(2));
    }
    let event_date_ist = event_time.with_timezone(&Kolkata).date_naive();
    let prior = crate::time::previous_trading_day(event_date_ist);
    Kolkata
        .with_ymd_and_hms(prior.year(), prior.month(), prior.day(), 14, 0, 0)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

pub fn analyze_veto_risk(events: &[EconomicEvent], now: DateTime<Utc>) -> VetoRisk {
    let nearest = events
        .iter()
        .filter(|e| e.impact == EventImpactClass::Veto && e.event_time > now)
        .min_by_key(|e| e.event_time);

    match nearest {
        None => {
            VetoRisk { has_veto: false, event_title: None, event_time: None, square_off_needed: false, hours_until: None, suggested_square_off_time: None }
        }
        Some(event) => {
            let hours_until = (event.event_time - now).num_minutes() as f64 / 60.0;
            let square_off_needed = hours_until <= SQUARE_OFF_WINDOW_HOURS as f64;
            VetoRisk {
                has_veto: true,
                event_title: Some(event.title.clone()),
                event_time: Some(event.event_time),
                square_off_needed,
                hours_until: Some(hours_until),
                suggested_square_off_time: if square_off_needed { suggested_square_off_time(event.event_time, hours_until) } else { None },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(title: &str, impact: EventImpactClass, hours_from_now: i64) -> EconomicEvent {
        EconomicEvent {
            title: title.to_string(),
            country: "IN".to_string(),
            importance: EventImportance::High,
            impact,
            event_time: Utc::now() + Duration::hours(hours_from_now),
        }
    }

    #[test]
    fn classify_rbi_policy_as_veto() {
        let (_, impact) = classify("RBI Monetary Policy Statement");
        assert_eq!(impact, EventImpactClass::Veto);
    }

    #[test]
    fn classify_pmi_as_medium_impact() {
        let (_, impact) = classify("Manufacturing PMI Flash");
        assert_eq!(impact, EventImpactClass::MediumImpact);
    }

    #[test]
    fn veto_within_48h_requires_square_off() {
        let events = vec![event("FOMC Statement", EventImpactClass::Veto, 30)];
        let risk = analyze_veto_risk(&events, Utc::now());
        assert!(risk.has_veto);
        assert!(risk.square_off_needed);
    }

    #[test]
    fn veto_beyond_48h_does_not_require_square_off() {
        let events = vec![event("FOMC Statement", EventImpactClass::Veto, 96)];
        let risk = analyze_veto_risk(&events, Utc::now());
        assert!(risk.has_veto);
        assert!(!risk.square_off_needed);
    }

    #[test]
    fn no_veto_events_returns_false() {
        let events = vec![event("CPI Release", EventImpactClass::HighImpact, 10)];
        let risk = analyze_veto_risk(&events, Utc::now());
        assert!(!risk.has_veto);
    }
}
