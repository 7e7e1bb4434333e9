// =============================================================================
// PnL Accountant — session and archived profit/loss arithmetic
// =============================================================================
//
// Pure functions only; the store owns the cash-flow/qty-delta aggregation
// (`Store::get_stats`) and the archived-history sum (`Store::get_accumulated_pnl`).
// This module turns those numbers into the quantities spec §4.4 names:
// live per-symbol session PnL, global per-symbol PnL, the best-coin selector,
// and the informational sell-profit estimate used in trade alerts.
// =============================================================================

use std::collections::HashMap;

/// Live per-symbol PnL for the current session:
/// `cash_flow + net_base_quantity_delta * current_price`.
pub fn live_session_pnl(cash_flow: f64, qty_delta: f64, current_price: f64) -> f64 {
    cash_flow + qty_delta * current_price
}

/// Global per-symbol PnL: archived history sum plus the live session PnL.
pub fn global_pnl(archived_history_sum: f64, live_session_pnl: f64) -> f64 {
    archived_history_sum + live_session_pnl
}

/// Symbol with the maximum cash-flow over the requested window. Ties break
/// on first-seen order (the order `cash_flow_per_coin` was built in, which
/// for a `HashMap` is insertion-stable only via an explicit ordered key
/// list — callers that care about stable tie-breaking should pass
/// `ordered_symbols` reflecting the active-pairs sequence).
pub fn best_coin(cash_flow_per_coin: &HashMap<String, f64>, ordered_symbols: &[String]) -> Option<String> {
    let mut best: Option<(&str, f64)> = None;
    for symbol in ordered_symbols {
        let Some(&cf) = cash_flow_per_coin.get(symbol) else { continue };
        match best {
            Some((_, best_cf)) if cf <= best_cf => {}
            _ => best = Some((symbol.as_str(), cf)),
        }
    }
    best.map(|(s, _)| s.to_string())
}

/// Informational sell-profit estimate shown in trade alerts — never used
/// for accounting (spec §4.4). `spread_pct` is the grid's spread percentage
/// (e.g. `1.0` for 1%); `fee_in_quote` is the sell trade's own fee, charged
/// against both legs of the round-trip (hence the `2 *`).
pub fn sell_profit_estimate(sell_price: f64, amount: f64, spread_pct: f64, fee_in_quote: f64) -> f64 {
    let theoretical_entry = sell_price / (1.0 + spread_pct / 100.0);
    let gross = (sell_price - theoretical_entry) * amount;
    let net = gross - 2.0 * fee_in_quote;
    net.max(0.0)
}

/// The theoretical buy price a sell at `sell_price` would be linking back
/// to, given `spread_pct` — the anchor `find_linked_buy_id` searches ±1%
/// around (spec §3, §8 boundary scenario 5).
pub fn theoretical_entry_price(sell_price: f64, spread_pct: f64) -> f64 {
    sell_price / (1.0 + spread_pct / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_pnl_combines_cash_flow_and_marked_position() {
        let pnl = live_session_pnl(10.0, 2.0, 50.0);
        assert_eq!(pnl, 10.0 + 2.0 * 50.0);
    }

    #[test]
    fn global_pnl_adds_archived_and_live() {
        assert_eq!(global_pnl(100.0, 25.0), 125.0);
    }

    #[test]
    fn best_coin_picks_max_cash_flow() {
        let mut cf = HashMap::new();
        cf.insert("BTCUSDT".to_string(), 10.0);
        cf.insert("ETHUSDT".to_string(), 25.0);
        let ordered = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        assert_eq!(best_coin(&cf, &ordered).as_deref(), Some("ETHUSDT"));
    }

    #[test]
    fn best_coin_ties_break_on_first_seen() {
        let mut cf = HashMap::new();
        cf.insert("BTCUSDT".to_string(), 10.0);
        cf.insert("ETHUSDT".to_string(), 10.0);
        let ordered = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        assert_eq!(best_coin(&cf, &ordered).as_deref(), Some("BTCUSDT"));
    }

    #[test]
    fn best_coin_empty_map_is_none() {
        let cf = HashMap::new();
        assert_eq!(best_coin(&cf, &["BTCUSDT".to_string()]), None);
    }

    #[test]
    fn sell_profit_estimate_floors_at_zero() {
        // theoretical entry = 100 / 1.01 = 99.0099..., gross ~ 0.99, fee eats it.
        let profit = sell_profit_estimate(100.0, 1.0, 1.0, 10.0);
        assert_eq!(profit, 0.0);
    }

    #[test]
    fn sell_profit_estimate_positive_case() {
        let profit = sell_profit_estimate(101.0, 1.0, 1.0, 0.01);
        let theoretical = 101.0 / 1.01;
        let expected = ((101.0 - theoretical) * 1.0 - 0.02).max(0.0);
        assert!((profit - expected).abs() < 1e-9);
    }

    #[test]
    fn theoretical_entry_price_matches_spec_example() {
        // Boundary scenario 5: sell at 100.60, spread 1% -> target ~99.60396
        let target = theoretical_entry_price(100.60, 1.0);
        assert!((target - 99.60396039603961).abs() < 1e-6);
    }
}
