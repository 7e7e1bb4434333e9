// =============================================================================
// Collector loop — market data refresh, trade ingestion, periodic snapshots
// (spec §4.3 "Collector loop")
// =============================================================================
//
// Runs independently of the reconciliation loop at its own cadence. Gated on
// `AppState::is_running()` — while paused the cadence timers still advance
// (a pause must not stall balance history), matching the original bot's
// "skip only the per-symbol body while paused" behavior.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Timelike;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::engine::trades;
use crate::types::EngineState;

const PRUNE_INTERVAL: Duration = Duration::from_secs(86_400);
const PNL_BACKUP_INTERVAL: Duration = Duration::from_secs(30);
const ACTIVE_VENUE_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const INACTIVE_VENUE_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(180);
const INTER_SYMBOL_PACE: Duration = Duration::from_secs(1);
const DAILY_REPORT_HOUR: u32 = 8;
const MY_TRADES_LIMIT: u32 = 10;
const CANDLES_LIMIT: u32 = 500;

pub async fn run(state: Arc<AppState>) {
    let mut last_prune = Instant::now();
    let mut last_pnl_backup = Instant::now();
    let mut last_active_snapshot = Instant::now() - ACTIVE_VENUE_SNAPSHOT_INTERVAL;
    let mut last_inactive_snapshot = Instant::now() - INACTIVE_VENUE_SNAPSHOT_INTERVAL;
    let mut last_daily_report_date: Option<chrono::NaiveDate> = None;

    loop {
        if matches!(state.engine_state(), EngineState::Stopped) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        if matches!(state.engine_state(), EngineState::Paused) {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        if last_prune.elapsed() >= PRUNE_INTERVAL {
            maintain_database(&state);
            last_prune = Instant::now();
        }

        if last_pnl_backup.elapsed() >= PNL_BACKUP_INTERVAL {
            backup_session_pnl(&state);
            last_pnl_backup = Instant::now();
        }

        maybe_emit_daily_report(&state, &mut last_daily_report_date).await;

        let symbols = state.config.read().enabled_symbols();
        for symbol in &symbols {
            if !state.is_running() {
                break;
            }
            collect_symbol(&state, symbol).await;
            tokio::time::sleep(INTER_SYMBOL_PACE).await;
        }

        if last_active_snapshot.elapsed() >= ACTIVE_VENUE_SNAPSHOT_INTERVAL {
            snapshot_active_venue(&state).await;
            last_active_snapshot = Instant::now();
        }

        if last_inactive_snapshot.elapsed() >= INACTIVE_VENUE_SNAPSHOT_INTERVAL {
            crate::scheduler::snapshot_inactive_venues(&state).await;
            last_inactive_snapshot = Instant::now();
        }
    }
}

fn maintain_database(state: &AppState) {
    let days_keep = state.config.read().system.days_keep;
    match state.store.prune_old_data(days_keep) {
        Ok((trades, balances)) if trades > 0 || balances > 0 => {
            info!(trades, balances, "pruned old data");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "database maintenance failed"),
    }
}

fn backup_session_pnl(state: &AppState) {
    let session_start = *state.session_start.read();
    let Ok(stats) = state.store.get_stats(session_start) else { return };
    for symbol in state.config.read().enabled_symbols() {
        let Some(price) = state.price_of(&symbol) else { continue };
        let cash_flow = *stats.cash_flow_per_coin.get(&symbol).unwrap_or(&0.0);
        let qty_delta = *stats.qty_delta_per_coin.get(&symbol).unwrap_or(&0.0);
        let value = crate::pnl::live_session_pnl(cash_flow, qty_delta, price);
        let _ = state.store.update_pnl_backup(&symbol, value);
    }
}

async fn maybe_emit_daily_report(state: &AppState, last_report_date: &mut Option<chrono::NaiveDate>) {
    let now = chrono::Local::now();
    if now.hour() != DAILY_REPORT_HOUR {
        return;
    }
    let today = now.date_naive();
    if *last_report_date == Some(today) {
        return;
    }

    let since = now_secs() - 86_400.0;
    let Ok(stats) = state.store.get_stats(since) else { return };
    let total_profit: f64 = stats.cash_flow_per_coin.values().sum();
    let icon = if total_profit >= 0.0 { "\u{1F7E2}" } else { "\u{1F534}" };

    let text = format!(
        "\u{1F4C5} <b>DAILY REPORT (24h)</b>\n--------------------------------\n{icon} <b>Profit: {total_profit:+.2}</b>\nTrades: {}\nTop coin: {}\n--------------------------------",
        stats.total_trades, stats.best_coin
    );
    state.notifier().notify(&text).await;
    *last_report_date = Some(today);
}

async fn collect_symbol(state: &AppState, symbol: &str) {
    let Some(exchange) = state.exchange() else { return };

    let price = match exchange.fetch_ticker(symbol).await {
        Ok(p) => p,
        Err(e) => {
            warn!(symbol, error = %e, "collector: fetch_ticker failed");
            return;
        }
    };
    state.update_price(symbol, price);

    let candles = exchange.fetch_candles(symbol, "1h", CANDLES_LIMIT).await.unwrap_or_default();
    if let Err(e) = state.store.update_market_snapshot(symbol, price, &candles) {
        warn!(symbol, error = %e, "collector: update_market_snapshot failed");
    }

    let open_orders = exchange.fetch_open_orders(symbol).await.unwrap_or_default();
    let levels = state.get_desired_levels(symbol);
    if let Err(e) = state.store.update_grid_status(symbol, &open_orders, &levels) {
        warn!(symbol, error = %e, "collector: update_grid_status failed");
    }

    let new_trades = match exchange.fetch_my_trades(symbol, MY_TRADES_LIMIT).await {
        Ok(t) => t,
        Err(e) => {
            warn!(symbol, error = %e, "collector: fetch_my_trades failed");
            return;
        }
    };

    let strategy = {
        let config = state.config.read();
        config
            .pairs
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|pair| config.strategy_for(pair))
            .unwrap_or_default()
    };

    for trade in &new_trades {
        match trades::ingest_trade(state, &state.store, &strategy, symbol, trade) {
            Ok(Some(alert)) => state.notifier().notify(&alert).await,
            Ok(None) => {}
            Err(e) => warn!(symbol, error = %e, "trade ingestion failed"),
        }
    }
}

async fn snapshot_active_venue(state: &AppState) {
    let Some(key) = state.active_venue_key() else { return };
    let Some(exchange) = state.exchange() else { return };

    let equity = match exchange.fetch_balance().await {
        Ok(balances) => {
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
                if let Ok(price) = exchange.fetch_ticker(&symbol).await {
                    total += qty * price;
                }
            }
            total
        }
        Err(e) => {
            warn!(error = %e, "collector: active venue balance fetch failed");
            return;
        }
    };

    if equity > 0.0 {
        if let Err(e) = state.store.log_balance_snapshot(equity, &key) {
            warn!(error = %e, "collector: log_balance_snapshot failed");
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
