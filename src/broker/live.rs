//! Live broker gateway: HTTP REST + TOTP login against a configurable broker
//! endpoint, plus a streaming Greeks feed. Generalized from a single hardcoded
//! vendor (`angel_one.rs`/`websocket.rs`) to `config.broker_base_url`.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::tokens::{TokenManager, Tokens};
use crate::broker::{BrokerGateway, ChainRow, InstrumentCache, OrderStatusSnapshot};
use crate::config::Config;
use crate::error::{Result, TradingError};
use crate::types::{Bar, GreeksData, InstrumentKey, OptionLeg, OptionType, OrderStatus, OrderType};
use crate::utils::rate_limiter::RateLimiter;

const RETRY_BACKOFF: [u64; 3] = [1, 2, 4];

#[derive(Debug, Serialize)]
struct LoginRequest {
    #[serde(rename = "clientcode")]
    client_code: String,
    password: String,
    totp: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: bool,
    message: String,
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(rename = "jwtToken")]
    jwt_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    #[serde(rename = "feedToken")]
    feed_token: String,
}

#[derive(Debug, Serialize)]
struct OrderRequest {
    variety: String,
    #[serde(rename = "tradingsymbol")]
    trading_symbol: String,
    #[serde(rename = "symboltoken")]
    symbol_token: String,
    #[serde(rename = "transactiontype")]
    transaction_type: String,
    exchange: String,
    #[serde(rename = "ordertype")]
    order_type: String,
    #[serde(rename = "producttype")]
    product_type: String,
    duration: String,
    price: String,
    quantity: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    status: bool,
    message: String,
    #[serde(rename = "errorcode")]
    error_code: Option<String>,
    data: Option<OrderResponseData>,
}

#[derive(Debug, Deserialize)]
struct OrderResponseData {
    #[serde(rename = "orderid")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderBookResponse {
    status: bool,
    data: Option<Vec<OrderBookEntry>>,
}

#[derive(Debug, Deserialize)]
struct OrderBookEntry {
    #[serde(rename = "orderid")]
    order_id: String,
    status: String,
    #[serde(rename = "filledshares")]
    filled_shares: String,
    #[serde(rename = "averageprice")]
    average_price: String,
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    status: bool,
    message: String,
    data: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct LtpResponse {
    status: bool,
    message: String,
    data: Option<LtpData>,
}

#[derive(Debug, Deserialize)]
struct LtpData {
    ltp: f64,
}

#[derive(Debug, Deserialize)]
struct ChainQuoteResponse {
    status: bool,
    data: Option<Vec<ChainQuoteRow>>,
}

#[derive(Debug, Deserialize)]
struct ChainQuoteRow {
    #[serde(rename = "symboltoken")]
    symbol_token: String,
    ltp: f64,
    #[serde(default)]
    bid: f64,
    #[serde(default)]
    ask: f64,
    #[serde(default)]
    #[serde(rename = "opnInterest")]
    open_interest: i64,
    #[serde(default)]
    iv: f64,
    #[serde(default)]
    delta: f64,
    #[serde(default)]
    theta: f64,
    #[serde(default)]
    gamma: f64,
    #[serde(default)]
    vega: f64,
}

#[derive(Debug, Deserialize)]
struct MarginResponse {
    status: bool,
    data: Option<MarginData>,
}

#[derive(Debug, Deserialize)]
struct MarginData {
    #[serde(rename = "totalMarginRequired")]
    total_margin_required: f64,
}

#[derive(Debug, Deserialize)]
struct FundsResponse {
    status: bool,
    data: Option<FundsData>,
}

#[derive(Debug, Deserialize)]
struct FundsData {
    #[serde(rename = "availablecash")]
    available_cash: String,
}

pub struct LiveBrokerGateway {
    client: Client,
    token_manager: Arc<TokenManager>,
    instrument_cache: Arc<InstrumentCache>,
    config: Arc<Config>,
    orders_limiter: RateLimiter,
    market_data_limiter: RateLimiter,
    historical_limiter: RateLimiter,
}

impl LiveBrokerGateway {
    pub fn new(
        token_manager: Arc<TokenManager>,
        instrument_cache: Arc<InstrumentCache>,
        config: Arc<Config>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        let orders_limiter = RateLimiter::new(config.rate_limit_orders);
        let market_data_limiter = RateLimiter::new(config.rate_limit_market_data);
        let historical_limiter = RateLimiter::new(config.rate_limit_historical);

        LiveBrokerGateway { client, token_manager, instrument_cache, config, orders_limiter, market_data_limiter, historical_limiter }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.broker_base_url, path)
    }

    fn generate_totp(&self) -> Result<String> {
        use hmac::{Hmac, Mac};
        use sha1::Sha1;
        use std::time::{SystemTime, UNIX_EPOCH};

        type HmacSha1 = Hmac<Sha1>;

        let secret = base32::decode(base32::Alphabet::RFC4648 { padding: false }, &self.config.broker_totp_secret)
            .ok_or_else(|| TradingError::AuthenticationFailed("invalid TOTP secret".to_string()))?;

        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let time_step = timestamp / 30;

        let mut mac = HmacSha1::new_from_slice(&secret)
            .map_err(|e| TradingError::AuthenticationFailed(format!("HMAC error: {e}")))?;
        mac.update(&time_step.to_be_bytes());
        let hash = mac.finalize().into_bytes();

        let offset = (hash[hash.len() - 1] & 0x0f) as usize;
        let code = u32::from_be_bytes([
            hash[offset] & 0x7f,
            hash[offset + 1],
            hash[offset + 2],
            hash[offset + 3],
        ]);

        Ok(format!("{:06}", code % 1_000_000))
    }

    fn calculate_token_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        use chrono::TimeZone;
        use chrono_tz::Asia::Kolkata;

        let now_ist = now.with_timezone(&Kolkata);
        let today_330am = Kolkata
            .with_ymd_and_hms(now_ist.year(), now_ist.month(), now_ist.day(), 3, 30, 0)
            .unwrap();

        let expiry_ist = if now_ist < today_330am { today_330am } else { today_330am + chrono::Duration::days(1) };
        expiry_ist.with_timezone(&Utc)
    }

    pub async fn login(&self) -> Result<Tokens> {
        info!("attempting broker login");

        let totp = self.generate_totp()?;
        let login_req = LoginRequest {
            client_code: self.config.broker_client_code.clone(),
            password: self.config.broker_password.clone(),
            totp,
        };

        let response = self
            .client
            .post(self.url("/rest/auth/login/v1/loginByPassword"))
            .header("Content-Type", "application/json")
            .json(&login_req)
            .send()
            .await?;

        let body = response.text().await?;
        let login_response: LoginResponse = serde_json::from_str(&body)
            .map_err(|e| TradingError::AuthenticationFailed(format!("parse error: {e}")))?;

        if !login_response.status {
            return Err(TradingError::AuthenticationFailed(login_response.message));
        }

        let data = login_response
            .data
            .ok_or_else(|| TradingError::AuthenticationFailed("no data in login response".to_string()))?;

        let now = Utc::now();
        let expiry = self.calculate_token_expiry(now);

        let tokens = Tokens {
            jwt_token: data.jwt_token,
            feed_token: data.feed_token,
            jwt_expiry: expiry,
            feed_expiry: expiry,
            refresh_token: Some(data.refresh_token),
        };

        self.token_manager.set_tokens(tokens.clone()).await?;
        info!(expiry = %expiry, "login successful");
        Ok(tokens)
    }

    async fn ensure_tokens(&self) -> Result<Tokens> {
        match self.token_manager.get_tokens().await {
            Some(t) if !t.is_jwt_expired() => Ok(t),
            _ => self.login().await,
        }
    }

    /// Runs `f` against fresh tokens, re-logging in once and retrying on `AuthExpired`,
    /// and retrying transient failures with the teacher's fixed 1s/2s/4s backoff.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Tokens) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut auth_retried = false;
        let mut last_err = None;

        for (attempt, delay) in RETRY_BACKOFF.iter().enumerate() {
            let tokens = match self.ensure_tokens().await {
                Ok(t) => t,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            match op(tokens).await {
                Ok(v) => return Ok(v),
                Err(TradingError::AuthExpired(msg)) if !auth_retried => {
                    auth_retried = true;
                    warn!(reason = %msg, "auth expired, re-logging in");
                    self.login().await?;
                }
                Err(e) if e.is_recoverable() => {
                    debug!(attempt, delay, error = %e, "transient broker error, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(*delay)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| TradingError::Transient("retries exhausted".to_string())))
    }
}

#[async_trait]
impl BrokerGateway for LiveBrokerGateway {
    async fn place_order(&self, leg: &OptionLeg, limit_price: f64) -> Result<String> {
        self.orders_limiter.acquire().await;
        let instrument = self
            .instrument_cache
            .get_by_token(&leg.instrument_key)
            .await
            .ok_or_else(|| TradingError::InstrumentNotFound(leg.instrument_key.clone()))?;

        self.with_retry(|tokens| {
            let instrument = instrument.clone();
            let leg = leg.clone();
            async move {
                let order_req = OrderRequest {
                    variety: "NORMAL".to_string(),
                    trading_symbol: instrument.symbol.clone(),
                    symbol_token: leg.instrument_key.clone(),
                    transaction_type: leg.side.as_str().to_string(),
                    exchange: "NFO".to_string(),
                    order_type: OrderType::Limit.as_str().to_string(),
                    product_type: "CARRYFORWARD".to_string(),
                    duration: "DAY".to_string(),
                    price: format!("{limit_price:.2}"),
                    quantity: leg.quantity.to_string(),
                };

                let response = self
                    .client
                    .post(self.url("/rest/secure/order/v1/placeOrder"))
                    .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                    .header("Content-Type", "application/json")
                    .json(&order_req)
                    .send()
                    .await?;

                let status = response.status();
                let body = response.text().await?;
                if status == reqwest::StatusCode::UNAUTHORIZED {
                    return Err(TradingError::AuthExpired("order placement 401".to_string()));
                }

                let order_response: OrderResponse = serde_json::from_str(&body)
                    .map_err(|e| TradingError::OrderPlacementFailed(format!("parse error: {e}")))?;

                if !order_response.status {
                    return Err(TradingError::Rejected(format!(
                        "{} (code: {})",
                        order_response.message,
                        order_response.error_code.unwrap_or_default()
                    )));
                }

                let order_id = order_response
                    .data
                    .ok_or_else(|| TradingError::OrderPlacementFailed("no order id in response".to_string()))?
                    .order_id;

                info!(order_id = %order_id, leg = %leg.instrument_key, "order placed");
                Ok(order_id)
            }
        })
        .await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatusSnapshot> {
        self.with_retry(|tokens| {
            let order_id = order_id.to_string();
            async move {
                let response = self
                    .client
                    .get(self.url("/rest/secure/order/v1/getOrderBook"))
                    .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                    .send()
                    .await?;

                let body = response.text().await?;
                let book: OrderBookResponse = serde_json::from_str(&body)?;

                if !book.status {
                    return Err(TradingError::OrderNotFound(order_id));
                }

                let entry = book
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .find(|e| e.order_id == order_id)
                    .ok_or_else(|| TradingError::OrderNotFound(order_id.clone()))?;

                let status = match entry.status.to_lowercase().as_str() {
                    "complete" => OrderStatus::Filled,
                    "open" | "open pending" | "pending" => OrderStatus::Submitted,
                    "partially filled" => OrderStatus::PartiallyFilled,
                    "cancelled" => OrderStatus::Cancelled,
                    "rejected" => OrderStatus::Rejected,
                    other => {
                        warn!(status = other, "unrecognized order status");
                        OrderStatus::Submitted
                    }
                };

                Ok(OrderStatusSnapshot {
                    status,
                    filled_qty: entry.filled_shares.parse().unwrap_or(0),
                    avg_price: entry.average_price.parse().unwrap_or(0.0),
                })
            }
        })
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.orders_limiter.acquire().await;
        self.with_retry(|tokens| {
            let order_id = order_id.to_string();
            async move {
                let payload = serde_json::json!({ "variety": "NORMAL", "orderid": order_id });
                let response = self
                    .client
                    .post(self.url("/rest/secure/order/v1/cancelOrder"))
                    .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                    .json(&payload)
                    .send()
                    .await?;

                if !response.status().is_success() {
                    return Err(TradingError::Transient(format!("cancel failed: {}", response.status())));
                }
                Ok(())
            }
        })
        .await
    }

    async fn get_ltp(&self, key: &InstrumentKey) -> Result<f64> {
        self.market_data_limiter.acquire().await;
        self.with_retry(|tokens| {
            let key = key.clone();
            async move {
                let payload = serde_json::json!({ "exchange": "NFO", "symboltoken": key });
                let response = self
                    .client
                    .post(self.url("/rest/secure/order/v1/getLtpData"))
                    .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                    .json(&payload)
                    .send()
                    .await?;

                let body = response.text().await?;
                let ltp_response: LtpResponse = serde_json::from_str(&body)?;

                if !ltp_response.status {
                    return Err(TradingError::Stale(ltp_response.message));
                }

                Ok(ltp_response.data.ok_or_else(|| TradingError::MissingData("no LTP data".to_string()))?.ltp)
            }
        })
        .await
    }

    async fn get_option_chain(&self, expiry: NaiveDate) -> Result<Vec<ChainRow>> {
        self.market_data_limiter.acquire().await;
        let instruments = self.instrument_cache.get_nifty_options_chain(Some(expiry)).await;
        if instruments.is_empty() {
            return Err(TradingError::MissingData(format!("no chain instruments for expiry {expiry}")));
        }

        let tokens_list: Vec<String> = instruments.iter().map(|i| i.token.clone()).collect();

        let quotes: Vec<ChainQuoteRow> = self
            .with_retry(|tokens| {
                let tokens_list = tokens_list.clone();
                async move {
                    let payload = serde_json::json!({ "exchange": "NFO", "symboltoken": tokens_list });
                    let response = self
                        .client
                        .post(self.url("/rest/secure/market/v1/quote"))
                        .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                        .json(&payload)
                        .send()
                        .await?;

                    let body = response.text().await?;
                    let parsed: ChainQuoteResponse = serde_json::from_str(&body)?;
                    if !parsed.status {
                        return Err(TradingError::MissingData("chain quote fetch failed".to_string()));
                    }
                    Ok(parsed.data.unwrap_or_default())
                }
            })
            .await?;

        let by_token: std::collections::HashMap<String, ChainQuoteRow> =
            quotes.into_iter().map(|q| (q.symbol_token.clone(), q)).collect();

        let rows = instruments
            .into_iter()
            .filter_map(|inst| {
                let q = by_token.get(&inst.token)?;
                let option_type = if inst.symbol.ends_with("CE") { OptionType::Call } else { OptionType::Put };
                Some(ChainRow {
                    instrument_key: inst.token.clone(),
                    strike: inst.strike as i32,
                    option_type,
                    expiry,
                    ltp: q.ltp,
                    bid: q.bid,
                    ask: q.ask,
                    oi: q.open_interest,
                    iv: q.iv,
                    delta: q.delta,
                    theta: q.theta,
                    gamma: q.gamma,
                    vega: q.vega,
                    lot_size: inst.lotsize,
                })
            })
            .collect();

        Ok(rows)
    }

    async fn get_historical_candles(&self, key: &InstrumentKey, interval: &str, days: u32) -> Result<Vec<Bar>> {
        self.historical_limiter.acquire().await;
        let to_date = Utc::now();
        let from_date = to_date - chrono::Duration::days(days as i64);

        self.with_retry(|tokens| {
            let key = key.clone();
            let interval = interval.to_string();
            async move {
                let payload = serde_json::json!({
                    "exchange": "NFO",
                    "symboltoken": key,
                    "interval": interval,
                    "fromdate": from_date.format("%Y-%m-%d %H:%M").to_string(),
                    "todate": to_date.format("%Y-%m-%d %H:%M").to_string(),
                });

                let response = self
                    .client
                    .post(self.url("/rest/secure/historical/v1/getCandleData"))
                    .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                    .json(&payload)
                    .send()
                    .await?;

                let body = response.text().await?;
                let candle_response: CandleResponse = serde_json::from_str(&body)?;

                if !candle_response.status {
                    return Err(TradingError::MissingData(candle_response.message));
                }

                let data = candle_response.data.ok_or_else(|| TradingError::MissingData("no candle data".to_string()))?;

                let bars = data
                    .iter()
                    .filter_map(|candle| {
                        if candle.len() < 6 {
                            return None;
                        }
                        let ts_str = candle[0].replace("+0530", "").trim().to_string();
                        let naive_dt = NaiveDateTime::parse_from_str(&ts_str, "%Y-%m-%d %H:%M:%S").ok()?;
                        Some(Bar {
                            timestamp: DateTime::<Utc>::from_naive_utc_and_offset(naive_dt, Utc),
                            open: candle[1].parse().ok()?,
                            high: candle[2].parse().ok()?,
                            low: candle[3].parse().ok()?,
                            close: candle[4].parse().ok()?,
                            volume: candle[5].parse().ok()?,
                        })
                    })
                    .collect();

                Ok(bars)
            }
        })
        .await
    }

    async fn required_margin(&self, legs: &[OptionLeg]) -> Result<f64> {
        let positions: Vec<_> = legs
            .iter()
            .map(|l| {
                serde_json::json!({
                    "exchange": "NFO",
                    "symboltoken": l.instrument_key,
                    "transactiontype": l.side.as_str(),
                    "quantity": l.quantity,
                    "producttype": "CARRYFORWARD",
                })
            })
            .collect();

        self.with_retry(|tokens| {
            let positions = positions.clone();
            async move {
                let payload = serde_json::json!({ "positions": positions });
                let response = self
                    .client
                    .post(self.url("/rest/secure/margin/v1/batch"))
                    .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                    .json(&payload)
                    .send()
                    .await?;

                let body = response.text().await?;
                let margin: MarginResponse = serde_json::from_str(&body)?;
                if !margin.status {
                    return Err(TradingError::MissingData("margin fetch failed".to_string()));
                }
                Ok(margin.data.ok_or_else(|| TradingError::MissingData("no margin data".to_string()))?.total_margin_required)
            }
        })
        .await
    }

    async fn available_funds(&self) -> Result<f64> {
        self.with_retry(|tokens| async move {
            let response = self
                .client
                .get(self.url("/rest/secure/user/v1/getRMS"))
                .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                .send()
                .await?;

            let body = response.text().await?;
            let funds: FundsResponse = serde_json::from_str(&body)?;
            if !funds.status {
                return Err(TradingError::MissingData("funds fetch failed".to_string()));
            }
            funds
                .data
                .ok_or_else(|| TradingError::MissingData("no funds data".to_string()))?
                .available_cash
                .parse()
                .map_err(|_| TradingError::MissingData("unparseable available cash".to_string()))
        })
        .await
    }

    async fn exit_all_positions(&self) -> Result<()> {
        self.with_retry(|tokens| async move {
            let response = self
                .client
                .post(self.url("/rest/secure/order/v1/cancelAllOrder"))
                .header("Authorization", format!("Bearer {}", tokens.jwt_token))
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(TradingError::Transient(format!("exit_all_positions failed: {}", response.status())));
            }
            Ok(())
        })
        .await
    }

    async fn subscribe_greeks(
        &self,
        keys: Vec<InstrumentKey>,
    ) -> Result<mpsc::UnboundedReceiver<(InstrumentKey, GreeksData)>> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::protocol::Message;

        let tokens = self.ensure_tokens().await?;
        let ws_url = format!(
            "{}?clientCode={}&feedToken={}&apiKey={}",
            self.config.broker_base_url.replace("https://", "wss://").replace("http://", "ws://"),
            self.config.broker_client_code,
            tokens.feed_token,
            self.config.broker_api_key,
        );

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| TradingError::Transient(format!("websocket connect failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe_req = serde_json::json!({
            "correlationID": "greeks-stream",
            "action": 1,
            "params": { "mode": 3, "tokenList": [{ "exchangeType": 2, "tokens": keys }] }
        });
        write
            .send(Message::Text(subscribe_req.to_string()))
            .await
            .map_err(|e| TradingError::Transient(format!("subscribe failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(row) = serde_json::from_str::<ChainQuoteRow>(&text) {
                            let greeks = GreeksData {
                                delta: row.delta,
                                theta: row.theta,
                                gamma: row.gamma,
                                vega: row.vega,
                                iv: row.iv,
                                ltp: row.ltp,
                                oi: row.open_interest,
                                timestamp: Utc::now(),
                            };
                            if tx.send((row.symbol_token, greeks)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(rx)
    }
}
