// =============================================================================
// Shared types used across the grid trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// A single OHLCV candle as returned by `fetch_candles`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Buy or sell, as used throughout the ladder, trade ledger, and adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// First-time setup behaviour for a freshly materialized grid (spec §4.3 Step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    Wait,
    Buy1,
    Buy2,
}

impl Default for StartMode {
    fn default() -> Self {
        Self::Wait
    }
}

/// Overall lifecycle state of an engine instance.
///
/// `Stopped -> Running -> Paused -> Running -> Stopping -> Stopped`, driven
/// only by the explicit commands `launch` / `pause` / `resume` / `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Stopped,
    Running,
    Paused,
    Stopping,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// A mirrored open order as last observed on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub status: String,
}

/// A single trade pulled from the venue's my-trades feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Venue-assigned trade id — unique per symbol/venue, the ledger's key.
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
    /// Fee already normalized to quote currency.
    pub fee_in_quote: f64,
    /// Milliseconds since epoch, as returned by the venue.
    pub timestamp: i64,
    #[serde(default)]
    pub buy_id: Option<i64>,
}

/// Venue price/amount precision and minimum-order limits for a symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketLimits {
    pub price_precision: u32,
    pub amount_precision: u32,
    pub min_amount: f64,
    pub min_cost: f64,
}

impl Default for MarketLimits {
    fn default() -> Self {
        Self {
            price_precision: 2,
            amount_precision: 6,
            min_amount: 0.0,
            min_cost: 0.0,
        }
    }
}

/// Round `value` down to `precision` decimal places (used for amounts —
/// never round amounts up, or a placement could exceed the free balance).
pub fn floor_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).floor() / factor
}

/// Round `value` to the nearest `precision` decimal places (used for prices).
pub fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "FDUSD", "BTC", "ETH", "BNB"];

/// Best-effort quote asset for a concatenated `BASEQUOTE` symbol (no venue
/// metadata consulted). Falls back to `USDC` when nothing matches.
pub fn quote_asset_of(symbol: &str) -> &str {
    for q in KNOWN_QUOTES {
        if symbol.ends_with(q) && symbol.len() > q.len() {
            return q;
        }
    }
    "USDC"
}

pub fn base_asset_of(symbol: &str) -> &str {
    let quote = quote_asset_of(symbol);
    &symbol[..symbol.len() - quote.len()]
}

/// Whether `asset` is a stablecoin counted at face value (1:1 quote) when
/// summing total equity, rather than priced against a `{asset}USDT` ticker.
pub fn is_stable_quote(asset: &str) -> bool {
    matches!(asset, "USDT" | "USDC" | "BUSD" | "FDUSD")
}

#[cfg(test)]
mod symbol_tests {
    use super::*;

    #[test]
    fn quote_asset_of_matches_known_suffixes() {
        assert_eq!(quote_asset_of("BTCUSDT"), "USDT");
        assert_eq!(quote_asset_of("ETHBTC"), "BTC");
        assert_eq!(quote_asset_of("WEIRDCOIN"), "USDC");
    }

    #[test]
    fn base_asset_of_strips_the_quote_suffix() {
        assert_eq!(base_asset_of("BTCUSDT"), "BTC");
        assert_eq!(base_asset_of("ETHBTC"), "ETH");
    }
}
