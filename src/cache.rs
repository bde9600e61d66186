//! Market Data Cache (C2): the single shared quote/Greeks store for Analytics,
//! Strategy Builder, and Position Monitor. Follows the teacher's
//! `Arc<RwLock<HashMap<_>>>` sharing pattern (e.g. `broker/instrument_cache.rs`)
//! rather than introducing a new concurrency primitive.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::{Result, TradingError};
use crate::types::{GreeksData, InstrumentKey};

#[derive(Debug, Clone)]
pub struct CachedQuote {
    pub greeks: GreeksData,
    pub age_sec: i64,
}

pub struct MarketDataCache {
    quotes: RwLock<HashMap<InstrumentKey, GreeksData>>,
    subscribed: RwLock<HashSet<InstrumentKey>>,
    config: Arc<Config>,
}

impl MarketDataCache {
    pub fn new(config: Arc<Config>) -> Self {
        MarketDataCache { quotes: RwLock::new(HashMap::new()), subscribed: RwLock::new(HashSet::new()), config }
    }

    pub async fn update(&self, key: InstrumentKey, greeks: GreeksData) {
        self.quotes.write().await.insert(key, greeks);
    }

    /// Returns the cached quote with its age, or `Stale`/`MissingData` if it is
    /// absent or older than the configured staleness window.
    pub async fn get(&self, key: &InstrumentKey) -> Result<CachedQuote> {
        let quotes = self.quotes.read().await;
        let greeks = quotes.get(key).ok_or_else(|| TradingError::MissingData(key.clone()))?;

        let age = Utc::now() - greeks.timestamp;
        if age > self.config.quote_stale_after() {
            return Err(TradingError::Stale(format!("{key} quote is {}s old", age.num_seconds())));
        }

        Ok(CachedQuote { greeks: greeks.clone(), age_sec: age.num_seconds() })
    }

    /// Like `get`, but returns the value even if stale, with its age — used by
    /// callers that only need to report staleness rather than refuse on it.
    pub async fn get_with_age(&self, key: &InstrumentKey) -> Option<CachedQuote> {
        let quotes = self.quotes.read().await;
        quotes.get(key).map(|g| CachedQuote { greeks: g.clone(), age_sec: (Utc::now() - g.timestamp).num_seconds() })
    }

    /// Replaces the subscription set atomically; callers diff the return value
    /// against their own bookkeeping to decide whether to re-subscribe upstream.
    pub async fn set_subscriptions(&self, keys: HashSet<InstrumentKey>) -> HashSet<InstrumentKey> {
        let mut subscribed = self.subscribed.write().await;
        let previous = subscribed.clone();
        *subscribed = keys;
        previous
    }

    pub async fn subscriptions(&self) -> HashSet<InstrumentKey> {
        self.subscribed.read().await.clone()
    }

    pub async fn remove(&self, key: &InstrumentKey) {
        self.quotes.write().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.quotes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_config;

    fn greeks_now() -> GreeksData {
        GreeksData { delta: 0.3, theta: -2.0, gamma: 0.01, vega: 5.0, iv: 0.14, ltp: 120.0, oi: 1000, timestamp: Utc::now() }
    }

    fn test_config() -> Arc<Config> {
        std::env::set_var("VG_DRY_RUN", "true");
        Arc::new(load_config().expect("config loads in test env"))
    }

    #[tokio::test]
    async fn fresh_quote_is_returned() {
        let cache = MarketDataCache::new(test_config());
        cache.update("12345".to_string(), greeks_now()).await;
        assert!(cache.get(&"12345".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn stale_quote_is_rejected() {
        let cache = MarketDataCache::new(test_config());
        let mut g = greeks_now();
        g.timestamp = Utc::now() - chrono::Duration::seconds(120);
        cache.update("12345".to_string(), g).await;
        assert!(matches!(cache.get(&"12345".to_string()).await, Err(TradingError::Stale(_))));
    }

    #[tokio::test]
    async fn missing_quote_is_missing_data() {
        let cache = MarketDataCache::new(test_config());
        assert!(matches!(cache.get(&"unknown".to_string()).await, Err(TradingError::MissingData(_))));
    }
}
