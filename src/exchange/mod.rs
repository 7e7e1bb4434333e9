// =============================================================================
// Exchange Adapter — venue-agnostic trading surface
// =============================================================================
//
// Everything the engine needs from a spot venue, behind one trait. The
// reconciliation and collector loops only ever talk to `dyn Exchange`; adding
// a second venue means writing one more implementation of this file, nothing
// upstream changes.
// =============================================================================

pub mod binance;
pub mod rate_limit;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{BalanceInfo, Candle, MarketLimits, OpenOrder, Side, Trade};

/// Error taxonomy the engine reacts to directly (spec §7). Anything else
/// bubbles up as `Transient` and is retried on the next cycle.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("insufficient funds for {symbol}: {detail}")]
    InsufficientFunds { symbol: String, detail: String },

    #[error("rate limited, retry after cooldown: {detail}")]
    RateLimited { detail: String },

    #[error("order not found: {detail}")]
    OrderNotFound { detail: String },

    #[error("precision/filter rejection for {symbol}: {detail}")]
    Precision { symbol: String, detail: String },

    #[error("transient adapter error: {0}")]
    Transient(#[from] anyhow::Error),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Venue-agnostic spot trading surface. All prices/amounts are plain `f64`;
/// callers are responsible for rounding through `price_to_precision` /
/// `amount_to_precision` before placing an order.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Server time in milliseconds, used only to verify connectivity at
    /// startup — never trusted for signing (that uses local wall time).
    async fn fetch_time(&self) -> AdapterResult<i64>;

    /// Free/locked balances for every asset with a non-zero balance.
    async fn fetch_balance(&self) -> AdapterResult<Vec<BalanceInfo>>;

    /// Last traded price for `symbol`.
    async fn fetch_ticker(&self, symbol: &str) -> AdapterResult<f64>;

    /// Last traded price for every symbol in `symbols`, batched where the
    /// venue supports it.
    async fn fetch_tickers(&self, symbols: &[String]) -> AdapterResult<Vec<(String, f64)>>;

    async fn fetch_candles(&self, symbol: &str, interval: &str, limit: u32) -> AdapterResult<Vec<Candle>>;

    /// Trades for `symbol`, most recent first. `since_id` limits the query
    /// to trades after a previously-seen venue trade id, when supported.
    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> AdapterResult<Vec<Trade>>;

    async fn fetch_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>>;

    async fn place_limit(&self, symbol: &str, side: Side, price: f64, amount: f64) -> AdapterResult<OpenOrder>;

    async fn place_market(&self, symbol: &str, side: Side, amount: f64) -> AdapterResult<Trade>;

    /// Cancel one order. A venue reporting "order not found" is treated as
    /// success by the caller — the desired end state already holds.
    async fn cancel(&self, symbol: &str, order_id: &str) -> AdapterResult<()>;

    async fn cancel_all(&self, symbol: &str) -> AdapterResult<()>;

    /// Price/amount precision and minimum order size for `symbol`, fetched
    /// once and cached by the implementation.
    async fn market(&self, symbol: &str) -> AdapterResult<MarketLimits>;

    fn price_to_precision(&self, limits: &MarketLimits, price: f64) -> f64 {
        crate::types::round_to_precision(price, limits.price_precision)
    }

    fn amount_to_precision(&self, limits: &MarketLimits, amount: f64) -> f64 {
        crate::types::floor_to_precision(amount, limits.amount_precision)
    }
}
