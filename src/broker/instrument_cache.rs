//! Instrument master cache, keyed by broker token for O(1) lookups. The
//! teacher's version held a concrete `AngelOneClient`; this one is downloaded
//! once at startup from a configured URL, independent of which `BrokerGateway`
//! is wired in for order/quote traffic.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Result, TradingError};
use crate::types::{Instrument, OptionType};

#[derive(Debug, Deserialize)]
struct RawInstrument {
    token: String,
    symbol: String,
    name: String,
    expiry: String,
    strike: String,
    lotsize: String,
    instrumenttype: String,
    exch_seg: String,
    tick_size: String,
}

pub struct InstrumentCache {
    master_url: String,
    http: reqwest::Client,
    instruments: Arc<RwLock<Vec<Instrument>>>,
    token_map: Arc<RwLock<HashMap<String, Instrument>>>,
    last_updated: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl InstrumentCache {
    pub fn new(master_url: String) -> Self {
        InstrumentCache {
            master_url,
            http: reqwest::Client::new(),
            instruments: Arc::new(RwLock::new(Vec::new())),
            token_map: Arc::new(RwLock::new(HashMap::new())),
            last_updated: Arc::new(RwLock::new(None)),
        }
    }

    /// Downloads and caches the instrument master from the configured URL.
    pub async fn refresh(&self) -> Result<()> {
        info!("downloading instrument master");

        let body = self.http.get(&self.master_url).send().await?.text().await?;
        let raw: Vec<RawInstrument> = serde_json::from_str(&body)?;

        let instruments: Vec<Instrument> = raw
            .into_iter()
            .filter_map(|r| {
                Some(Instrument {
                    token: r.token,
                    symbol: r.symbol,
                    name: r.name,
                    expiry: r.expiry,
                    strike: r.strike.parse().ok()?,
                    lotsize: r.lotsize.parse().ok()?,
                    instrument_type: r.instrumenttype,
                    exch_seg: r.exch_seg,
                    tick_size: r.tick_size.parse().unwrap_or(0.05),
                })
            })
            .collect();

        let mut token_map = HashMap::new();
        for inst in &instruments {
            token_map.insert(inst.token.clone(), inst.clone());
            token_map.insert(inst.symbol.clone(), inst.clone());
        }

        *self.instruments.write().await = instruments.clone();
        *self.token_map.write().await = token_map;
        *self.last_updated.write().await = Some(Utc::now());

        info!(count = instruments.len(), "cached instruments");
        Ok(())
    }

    pub async fn get_nifty_token(&self) -> Result<String> {
        let instruments = self.instruments.read().await;
        instruments
            .iter()
            .find(|i| i.name == "NIFTY" && i.instrument_type == "OPTIDX")
            .or_else(|| instruments.iter().find(|i| i.symbol.starts_with("NIFTY") && i.instrument_type == "INDEX"))
            .map(|i| i.token.clone())
            .ok_or_else(|| TradingError::InstrumentNotFound("NIFTY underlying not found".to_string()))
    }

    pub async fn find_option_token(
        &self,
        underlying: &str,
        strike: i32,
        option_type: OptionType,
        expiry: Option<NaiveDate>,
    ) -> Result<(String, String)> {
        let instruments = self.instruments.read().await;

        let mut candidates: Vec<&Instrument> = instruments
            .iter()
            .filter(|i| {
                i.name == underlying
                    && i.strike as i32 == strike
                    && i.exch_seg == "NFO"
                    && i.symbol.ends_with(option_type.as_str())
            })
            .collect();

        if candidates.is_empty() {
            return Err(TradingError::InstrumentNotFound(format!(
                "no option found: {underlying} {strike} {}",
                option_type.as_str()
            )));
        }

        if let Some(target_expiry) = expiry {
            candidates.retain(|i| {
                NaiveDate::parse_from_str(&i.expiry, "%d%b%Y").map(|d| d == target_expiry).unwrap_or(false)
            });
        } else {
            candidates.sort_by_key(|i| i.expiry.clone());
        }

        let instrument = candidates.first().ok_or_else(|| {
            TradingError::InstrumentNotFound(format!("no matching expiry: {underlying} {strike} {}", option_type.as_str()))
        })?;

        Ok((instrument.token.clone(), instrument.symbol.clone()))
    }

    pub async fn get_by_token(&self, token: &str) -> Option<Instrument> {
        self.token_map.read().await.get(token).cloned()
    }

    pub async fn get_by_symbol(&self, symbol: &str) -> Option<Instrument> {
        self.token_map.read().await.get(symbol).cloned()
    }

    /// All NIFTY option contracts, optionally filtered to one expiry, sorted by strike.
    pub async fn get_nifty_options_chain(&self, expiry: Option<NaiveDate>) -> Vec<Instrument> {
        let instruments = self.instruments.read().await;

        let mut options: Vec<Instrument> =
            instruments.iter().filter(|i| i.name == "NIFTY" && i.exch_seg == "NFO").cloned().collect();

        if let Some(target_expiry) = expiry {
            options.retain(|i| {
                NaiveDate::parse_from_str(&i.expiry, "%d%b%Y").map(|d| d == target_expiry).unwrap_or(false)
            });
        }

        options.sort_by_key(|i| i.strike as i32);
        options
    }

    pub async fn needs_refresh(&self) -> bool {
        match *self.last_updated.read().await {
            None => true,
            Some(last) => (Utc::now() - last).num_hours() >= 24,
        }
    }

    pub async fn size(&self) -> usize {
        self.instruments.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_cache_needs_refresh() {
        let cache = InstrumentCache::new("https://example.invalid/master.json".to_string());
        assert!(cache.needs_refresh().await);
        assert_eq!(cache.size().await, 0);
    }
}
