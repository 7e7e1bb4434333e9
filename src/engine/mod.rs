// =============================================================================
// Grid Engine — the trading orchestrator (spec §4.3)
// =============================================================================
//
// Owns the state machine (`launch` / `pause` / `resume` / `stop`) and the two
// loops that share `AppState`: the reconciliation loop (ladder placement) and
// the collector loop (market data refresh, trade ingestion, PnL backup,
// periodic snapshots). Both are spawned once at startup and gate their cycle
// body on `AppState::engine_state()` rather than being torn down and rebuilt
// on every `launch`/`stop`.
// =============================================================================

pub mod collector;
pub mod ladder;
pub mod trades;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::app_state::AppState;
use crate::config::{AppConfig, ConfigWatcher, GridStrategy};
use crate::exchange::{AdapterError, Exchange};
use crate::types::{base_asset_of, is_stable_quote, EngineState, OpenOrder, Side, StartMode};

const DUST_THRESHOLD_QUOTE: f64 = 5.0;
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(120);

pub struct GridEngine {
    pub state: Arc<AppState>,
}

impl GridEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    /// `Stopped -> Running` (spec §4.3 state machine). No-op if already running.
    #[instrument(skip(self))]
    pub async fn launch(&self) -> Result<()> {
        if self.state.is_running() {
            return Ok(());
        }

        let exchange = self.state.exchange().context("no exchange connected")?;
        let symbols = self.state.config.read().enabled_symbols();

        let equity = self.calculate_total_equity(&exchange).await.unwrap_or(0.0);
        let now = now_secs();

        self.state.store.set_session_start_balance(equity)?;
        self.state.store.set_global_start_balance_if_not_exists(equity)?;
        self.capture_initial_snapshots(&exchange, &symbols).await;

        if self.state.store.archive_session_stats()? {
            info!("archived previous session's PnL backup");
        }

        self.state.reset_session(now);
        self.state.store.set_session_start_time(now)?;

        for symbol in &symbols {
            if let Err(e) = exchange.cancel_all(symbol).await {
                warn!(symbol, error = %e, "best-effort cancel-all at launch failed");
            }
        }

        self.state.set_engine_state(EngineState::Running);
        info!(symbols = symbols.len(), equity, "engine launched");
        Ok(())
    }

    pub fn pause(&self) {
        if self.state.engine_state() == EngineState::Running {
            self.state.set_engine_state(EngineState::Paused);
        }
    }

    pub fn resume(&self) {
        if self.state.engine_state() == EngineState::Paused {
            self.state.set_engine_state(EngineState::Running);
        }
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if self.state.engine_state() == EngineState::Stopped {
            return Ok(());
        }
        self.state.set_engine_state(EngineState::Stopping);
        self.flush_pnl_backup().await;
        self.state.set_engine_state(EngineState::Stopped);
        info!("engine stopped");
        Ok(())
    }

    async fn capture_initial_snapshots(&self, exchange: &Arc<dyn Exchange>, symbols: &[String]) {
        for symbol in symbols {
            let base = base_asset_of(symbol);
            let (Ok(price), Ok(balances)) = (exchange.fetch_ticker(symbol).await, exchange.fetch_balance().await) else {
                continue;
            };
            if let Some(b) = balances.iter().find(|b| b.asset == base) {
                let value = (b.free + b.locked) * price;
                let _ = self.state.store.set_coin_initial_balance(symbol, value);
                let _ = self.state.store.set_coin_session_start(symbol, now_secs());
            }
        }
    }

    /// Sums free+locked balances, pricing non-stable assets against
    /// `{asset}USDT`. Also refreshes `AppState::balances`.
    pub async fn calculate_total_equity(&self, exchange: &Arc<dyn Exchange>) -> Result<f64> {
        let balances = exchange.fetch_balance().await.context("fetch_balance failed")?;
        let mut total = 0.0;
        for b in &balances {
            let qty = b.free + b.locked;
            if qty <= 0.0 {
                continue;
            }
            if is_stable_quote(&b.asset) {
                total += qty;
                continue;
            }
            let symbol = format!("{}USDT", b.asset);
            if let Ok(price) = exchange.fetch_ticker(&symbol).await {
                total += qty * price;
            }
        }
        *self.state.balances.write() = balances;
        Ok(total)
    }

    async fn flush_pnl_backup(&self) {
        let symbols = self.state.config.read().enabled_symbols();
        let session_start = *self.state.session_start.read();
        let Ok(stats) = self.state.store.get_stats(session_start) else {
            return;
        };
        for symbol in symbols {
            let Some(price) = self.state.price_of(&symbol) else { continue };
            let cash_flow = *stats.cash_flow_per_coin.get(&symbol).unwrap_or(&0.0);
            let qty_delta = *stats.qty_delta_per_coin.get(&symbol).unwrap_or(&0.0);
            let value = crate::pnl::live_session_pnl(cash_flow, qty_delta, price);
            let _ = self.state.store.update_pnl_backup(&symbol, value);
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation loop
    // -------------------------------------------------------------------------

    pub fn spawn_reconciliation_loop(self: Arc<Self>, config_path: std::path::PathBuf) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut watcher = ConfigWatcher::new(config_path);
            watcher.mark_seen();

            loop {
                match self.state.engine_state() {
                    EngineState::Stopping => break,
                    EngineState::Running => {}
                    _ => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                }

                if let Some(new_config) = watcher.check_and_reload() {
                    self.handle_smart_reload(new_config).await;
                }

                let (symbols, delay) = {
                    let config = self.state.config.read();
                    (config.enabled_symbols(), config.system.cycle_delay)
                };

                for symbol in &symbols {
                    if self.state.engine_state() != EngineState::Running {
                        break;
                    }
                    if let Err(e) = self.reconcile_symbol(symbol).await {
                        error!(symbol = %symbol, error = %e, "reconciliation failed");
                        self.state.push_error(Some(symbol), e.to_string());
                        self.state.mark_reconcile_error(e.to_string());
                        if matches!(e.downcast_ref::<AdapterError>(), Some(AdapterError::RateLimited { .. })) {
                            warn!("rate limited, cooling down for 120s");
                            tokio::time::sleep(RATE_LIMIT_COOLDOWN).await;
                        }
                        continue;
                    }
                }
                self.state.mark_reconcile_ok();

                tokio::time::sleep(Duration::from_secs(delay.max(1))).await;
            }
        })
    }

    /// The per-symbol heart of the engine: spec §4.3 Steps 1-6.
    #[instrument(skip(self), fields(symbol = %symbol))]
    async fn reconcile_symbol(&self, symbol: &str) -> Result<()> {
        let exchange = self.state.exchange().context("no exchange connected")?;
        let strategy = {
            let config = self.state.config.read();
            let pair = config
                .pairs
                .iter()
                .find(|p| &p.symbol == symbol)
                .context("pair not configured")?;
            config.strategy_for(pair)
        };

        let limits = exchange.market(symbol).await?;
        let price = exchange.fetch_ticker(symbol).await?;
        self.state.update_price(symbol, price);

        // Step 1 — first-time setup.
        if !self.state.store.get_symbol_setup_done(symbol)? {
            match strategy.start_mode {
                StartMode::Buy1 => {
                    let amount = exchange.amount_to_precision(&limits, strategy.amount_per_grid / price);
                    exchange.place_market(symbol, Side::Buy, amount).await.ok();
                }
                StartMode::Buy2 => {
                    let amount = exchange.amount_to_precision(&limits, 2.0 * strategy.amount_per_grid / price);
                    exchange.place_market(symbol, Side::Buy, amount).await.ok();
                }
                StartMode::Wait => {}
            }
            self.state.store.set_symbol_setup_done(symbol, true)?;
            return Ok(());
        }

        // Step 2 — inventory guard.
        let balances = exchange.fetch_balance().await?;
        let base = base_asset_of(symbol);
        let base_balance = balances.iter().find(|b| b.asset == base);
        let base_value = base_balance.map(|b| (b.free + b.locked) * price).unwrap_or(0.0);
        if base_value < DUST_THRESHOLD_QUOTE {
            let quote = balances.iter().find(|b| b.asset == crate::types::quote_asset_of(symbol));
            let free_quote = quote.map(|b| b.free).unwrap_or(0.0);
            if free_quote >= strategy.amount_per_grid {
                let amount = exchange.amount_to_precision(&limits, strategy.amount_per_grid / price);
                exchange.place_market(symbol, Side::Buy, amount).await.ok();
            }
            return Ok(());
        }

        // Step 3 — materialize levels if absent.
        let mut levels = self.state.get_desired_levels(symbol);
        if levels.is_empty() {
            levels = ladder::materialize_levels(price, strategy.grid_spread, strategy.grids_quantity, limits.price_precision);
            self.state.set_desired_levels(symbol, levels.clone());
        }

        let open_orders = exchange.fetch_open_orders(symbol).await?;

        // Step 4 — trailing up.
        if strategy.trailing_enabled {
            if let Some((new_levels, dropped)) = ladder::trail_up(&levels, price, strategy.grid_spread, limits.price_precision) {
                if let Some(order) = ladder::find_order_at_level(&open_orders, dropped, |o: &OpenOrder| o.price) {
                    exchange.cancel(symbol, &order.order_id).await.ok();
                }
                self.state.set_desired_levels(symbol, new_levels);
                self.state.notifier().notify(&format!("<b>TRAIL UP</b> {symbol}\nDropped: {dropped:.8}")).await;
                return Ok(());
            }
        }

        // Step 5 — per-level placement.
        let last_buy_price = self.state.store.get_last_buy_price(symbol)?;
        for &level in &levels {
            let Some(side) = ladder::target_side_for_level(level, price, strategy.grid_spread) else {
                continue;
            };

            if side == Side::Sell && last_buy_price > 0.0 {
                let floor = ladder::anti_wash_floor(last_buy_price, strategy.grid_spread);
                if level < floor {
                    continue;
                }
            }

            if let Some(existing) = ladder::find_order_at_level(&open_orders, level, |o: &OpenOrder| o.price) {
                if existing.side == side {
                    continue;
                }
                exchange.cancel(symbol, &existing.order_id).await.ok();
            }

            let mut amount = exchange.amount_to_precision(&limits, strategy.amount_per_grid / level);
            if amount < limits.min_amount || amount * level < limits.min_cost {
                continue;
            }

            match side {
                Side::Buy => {
                    let free_quote = balances
                        .iter()
                        .find(|b| b.asset == crate::types::quote_asset_of(symbol))
                        .map(|b| b.free)
                        .unwrap_or(0.0);
                    if free_quote < amount * level {
                        continue;
                    }
                }
                Side::Sell => {
                    let reserved = self.state.reserved_for(symbol);
                    let free_base = base_balance.map(|b| b.free).unwrap_or(0.0) - reserved;
                    if free_base < 0.99 * amount {
                        continue;
                    }
                    if free_base < amount {
                        amount = exchange.amount_to_precision(&limits, free_base);
                    }
                }
            }

            match exchange.place_limit(symbol, side, level, amount).await {
                Ok(_) => {}
                Err(AdapterError::InsufficientFunds { .. }) | Err(AdapterError::Precision { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // Step 6 — orphan cleanup.
        for order in &open_orders {
            if ladder::is_orphan(order.price, &levels) {
                exchange.cancel(symbol, &order.order_id).await.ok();
            }
        }

        let refreshed_orders = exchange.fetch_open_orders(symbol).await.unwrap_or(open_orders);
        self.state.store.update_grid_status(symbol, &refreshed_orders, &levels)?;

        Ok(())
    }

    /// Smart config reload (spec §4.3). A testnet flip resets the whole
    /// session; otherwise only the symbol diff is applied.
    async fn handle_smart_reload(&self, new_config: AppConfig) {
        let old_testnet = self.state.config.read().system.use_testnet;
        let new_testnet = new_config.system.use_testnet;

        if old_testnet != new_testnet {
            info!("testnet flag flipped, resetting session");
            if let Some(exchange) = self.state.exchange() {
                for symbol in new_config.enabled_symbols() {
                    exchange.cancel_all(&symbol).await.ok();
                }
            }
            self.state.desired_levels.write().clear();
            self.state.reserved_inventory.write().clear();
            let equity = match self.state.exchange() {
                Some(exchange) => self.calculate_total_equity(&exchange).await.unwrap_or(0.0),
                None => 0.0,
            };
            let now = now_secs();
            let _ = self.state.store.set_session_start_balance(equity);
            let _ = self.state.store.set_global_start_balance_if_not_exists(equity);
            if let Some(exchange) = self.state.exchange() {
                self.capture_initial_snapshots(&exchange, &new_config.enabled_symbols()).await;
            }
            self.state.reset_session(now);
            let _ = self.state.store.set_session_start_time(now);
        } else {
            let old_symbols: std::collections::HashSet<String> = self.state.config.read().enabled_symbols().into_iter().collect();
            let new_symbols: std::collections::HashSet<String> = new_config.enabled_symbols().into_iter().collect();

            for removed in old_symbols.difference(&new_symbols) {
                if let Some(exchange) = self.state.exchange() {
                    exchange.cancel_all(removed).await.ok();
                }
                self.state.desired_levels.write().remove(removed);
            }
            // Added pairs are simply marked for materialization on the next
            // cycle (`get_desired_levels` returns empty until then).
        }

        *self.state.config.write() = new_config;
        self.state.increment_version();
    }

    // -------------------------------------------------------------------------
    // Collector loop
    // -------------------------------------------------------------------------

    pub fn spawn_collector_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            collector::run(self.state.clone()).await;
        })
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
