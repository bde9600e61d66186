//! Participant flow feed (C4 companion): FII/DII net futures positioning for
//! the Regime Engine's external-flow input. Grounded in
//! `original_source/core/participant.py`'s NSE archives CSV fetch with
//! weekday fallback across candidate dates; the original has no options-side
//! breakdown, so `fii_net_options`/`dii_net_options` stay zero here too.
use chrono::{Datelike, Duration, Utc, Weekday};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::types::ExternalMetrics;

const BASE_URL: &str = "https://archives.nseindia.com/content/nsccl/fao_participant_oi_";
const MAX_CANDIDATE_DATES: usize = 5;
const MAX_CANDIDATE_ATTEMPTS: usize = 10;
const CACHE_TTL_HOURS: i64 = 6;

#[derive(Debug, Deserialize)]
struct ParticipantRow {
    #[serde(rename = "FutureIndex")]
    future_index: String,
    #[serde(rename = "ClientType")]
    client_type: String,
    #[serde(rename = "LongQtyContracts")]
    long_qty_contracts: f64,
    #[serde(rename = "ShortQtyContracts")]
    short_qty_contracts: f64,
}

fn candidate_dates(now: chrono::NaiveDate) -> Vec<String> {
    let mut dates = Vec::new();
    let mut current = now;
    let mut attempts = 0;
    while dates.len() < MAX_CANDIDATE_DATES && attempts < MAX_CANDIDATE_ATTEMPTS {
        if !matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(current.format("%d%m%Y").to_string());
        }
        current -= Duration::days(1);
        attempts += 1;
    }
    dates
}

fn process_participant_data(csv_text: &str) -> Option<(f64, f64)> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(csv_text.as_bytes());
    let mut fii_long = 0.0;
    let mut fii_short = 0.0;
    let mut dii_long = 0.0;
    let mut dii_short = 0.0;
    let mut matched_any = false;

    for result in reader.deserialize::<ParticipantRow>() {
        let Ok(row) = result else { continue };
        if !row.future_index.to_uppercase().contains("NIFTY") {
            continue;
        }
        matched_any = true;
        match row.client_type.as_str() {
            "Client" => {
                fii_long += row.long_qty_contracts;
                fii_short += row.short_qty_contracts;
            }
            "DII" => {
                dii_long += row.long_qty_contracts;
                dii_short += row.short_qty_contracts;
            }
            _ => {}
        }
    }

    if !matched_any {
        return None;
    }

    Some((fii_long - fii_short, dii_long - dii_short))
}

pub struct ParticipantDataClient {
    http: reqwest::Client,
    cache: RwLock<Option<(ExternalMetrics, chrono::DateTime<Utc>)>>,
}

impl ParticipantDataClient {
    pub fn new() -> Self {
        ParticipantDataClient { http: reqwest::Client::new(), cache: RwLock::new(None) }
    }

    async fn fetch_oi_csv(&self, date_str: &str) -> Option<String> {
        let url = format!("{BASE_URL}{date_str}.csv");
        match self.http.get(&url).header("User-Agent", "Mozilla/5.0").send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
            Ok(resp) => {
                warn!(status = %resp.status(), date = date_str, "participant data fetch rejected");
                None
            }
            Err(e) => {
                warn!(error = %e, date = date_str, "participant data fetch failed");
                None
            }
        }
    }

    async fn fetch_smart(&self) -> ExternalMetrics {
        for date_str in candidate_dates(Utc::now().date_naive()) {
            if let Some(csv_text) = self.fetch_oi_csv(&date_str).await {
                if let Some((fii_net, dii_net)) = process_participant_data(&csv_text) {
                    info!(date = date_str, fii_net, dii_net, "fetched FII/DII participant data");
                    return ExternalMetrics {
                        fii_net_futures: fii_net,
                        fii_net_options: 0.0,
                        dii_net_futures: dii_net,
                        dii_net_options: 0.0,
                        data_relevance: true,
                    };
                }
            }
        }

        warn!("could not fetch FII/DII participant data for any candidate date, using neutral defaults");
        ExternalMetrics { fii_net_futures: 0.0, fii_net_options: 0.0, dii_net_futures: 0.0, dii_net_options: 0.0, data_relevance: false }
    }

    /// Returns the cached participant flow snapshot, refreshing it if older
    /// than the cache TTL (NSE publishes this archive once per trading day).
    pub async fn fetch_external_metrics(&self) -> ExternalMetrics {
        {
            let cache = self.cache.read().await;
            if let Some((metrics, fetched_at)) = &*cache {
                if (Utc::now() - *fetched_at).num_hours() < CACHE_TTL_HOURS {
                    return metrics.clone();
                }
            }
        }

        let metrics = self.fetch_smart().await;
        *self.cache.write().await = Some((metrics.clone(), Utc::now()));
        metrics
    }
}

impl Default for ParticipantDataClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_dates_skips_weekends() {
        let saturday = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let dates = candidate_dates(saturday);
        assert_eq!(dates.len(), MAX_CANDIDATE_DATES);
        assert!(!dates.contains(&"01062024".to_string()));
    }

    #[test]
    fn processes_nifty_futures_rows_by_client_type() {
        let csv_text = "FutureIndex,ClientType,LongQtyContracts,ShortQtyContracts\n\
                         NIFTY,Client,10000,8000\n\
                         NIFTY,DII,3000,5000\n\
                         BANKNIFTY,Client,999999,1\n";
        let (fii_net, dii_net) = process_participant_data(csv_text).expect("parses");
        assert_eq!(fii_net, 2000.0);
        assert_eq!(dii_net, -2000.0);
    }

    #[test]
    fn no_nifty_rows_returns_none() {
        let csv_text = "FutureIndex,ClientType,LongQtyContracts,ShortQtyContracts\n\
                         BANKNIFTY,Client,1000,500\n";
        assert!(process_participant_data(csv_text).is_none());
    }

    #[test]
    fn malformed_csv_returns_none() {
        assert!(process_participant_data("not,a,valid,header\ngarbage").is_none());
    }
}
