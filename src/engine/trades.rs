// =============================================================================
// Trade ingestion and alerting (spec §4.3 "Trade ingestion and alerting")
// =============================================================================
//
// Folds a newly-discovered venue trade into the ledger exactly once, assigns
// or links its `buy_id`, and renders the human-readable alert the collector
// loop hands to the notifier. Kept free of exchange/network calls so it can
// be driven directly from tests.
// =============================================================================

use anyhow::Result;

use crate::app_state::AppState;
use crate::config::GridStrategy;
use crate::pnl;
use crate::store::Store;
use crate::types::{Side, Trade};

/// Returns the alert text to emit, or `None` if the trade was a duplicate
/// (already processed this run) or predates the current session start.
pub fn ingest_trade(
    state: &AppState,
    store: &Store,
    strategy: &GridStrategy,
    symbol: &str,
    trade: &Trade,
) -> Result<Option<String>> {
    if !state.mark_trade_processed(symbol, &trade.id) {
        return Ok(None);
    }

    let session_start = *state.session_start.read();
    if session_start > 0.0 && (trade.timestamp as f64 / 1000.0) < session_start {
        return Ok(None);
    }

    store.save_trade(trade)?;
    state.increment_session_trades(symbol);

    let buy_id = match trade.side {
        Side::Buy => Some(store.assign_id_to_trade_if_missing(&trade.id)?),
        Side::Sell => match store.find_linked_buy_id(symbol, trade.price, strategy.grid_spread)? {
            Some(id) => {
                store.set_trade_buy_id(&trade.id, id)?;
                Some(id)
            }
            None => None,
        },
    };

    Ok(Some(alert_text(strategy, symbol, trade, buy_id)))
}

fn alert_text(strategy: &GridStrategy, symbol: &str, trade: &Trade, buy_id: Option<i64>) -> String {
    match trade.side {
        Side::Buy => {
            let tag = buy_id.map(|id| format!(" #{id}")).unwrap_or_default();
            format!(
                "<b>BUY</b> {symbol}{tag}\nPrice: {:.8}\nAmount: {:.8}\nCost: {:.2}",
                trade.price, trade.amount, trade.cost
            )
        }
        Side::Sell => {
            let profit = pnl::sell_profit_estimate(trade.price, trade.amount, strategy.grid_spread, trade.fee_in_quote);
            let tag = buy_id.map(|id| format!("#{id}")).unwrap_or_else(|| "unlinked".to_string());
            format!(
                "<b>SELL</b> {symbol} (linked {tag})\nPrice: {:.8}\nAmount: {:.8}\nEst. profit: {:+.2}",
                trade.price, trade.amount, profit
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::sync::Arc;

    fn harness() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("bot.db")).unwrap());
        (AppState::new(AppConfig::default(), store, dir.path().join("config.json")), dir)
    }

    fn trade(id: &str, side: Side, price: f64, ts: i64) -> Trade {
        Trade {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            price,
            amount: 0.01,
            cost: price * 0.01,
            fee_in_quote: 0.01,
            timestamp: ts,
            buy_id: None,
        }
    }

    #[test]
    fn ingesting_same_trade_twice_is_a_noop_second_time() {
        let (state, _dir) = harness();
        let strategy = GridStrategy::default();
        let t = trade("t1", Side::Buy, 99.6, 1_000_000);

        let first = ingest_trade(&state, &state.store, &strategy, "BTCUSDT", &t).unwrap();
        assert!(first.is_some());
        let second = ingest_trade(&state, &state.store, &strategy, "BTCUSDT", &t).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn sell_links_to_prior_buy_within_tolerance() {
        let (state, _dir) = harness();
        let strategy = GridStrategy {
            grid_spread: 1.0,
            ..GridStrategy::default()
        };

        let buy = trade("buy1", Side::Buy, 99.60, 1_000_000);
        let alert = ingest_trade(&state, &state.store, &strategy, "BTCUSDT", &buy).unwrap().unwrap();
        assert!(alert.contains("BUY"));

        let sell = trade("sell1", Side::Sell, 100.60, 2_000_000);
        let alert = ingest_trade(&state, &state.store, &strategy, "BTCUSDT", &sell).unwrap().unwrap();
        assert!(alert.contains("SELL"));
        assert!(!alert.contains("unlinked"));
    }

    #[test]
    fn trade_before_session_start_is_skipped() {
        let (state, _dir) = harness();
        state.reset_session(5_000.0);
        let strategy = GridStrategy::default();
        let t = trade("old", Side::Buy, 100.0, 1_000_000);
        let result = ingest_trade(&state, &state.store, &strategy, "BTCUSDT", &t).unwrap();
        assert!(result.is_none());
    }
}
