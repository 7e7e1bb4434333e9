// =============================================================================
// Central Application State — Grid Trading Engine
// =============================================================================
//
// The single source of truth shared between the reconciliation loop, the
// collector loop, the background scheduler, and the HTTP API. All mutable
// collections live behind `parking_lot::RwLock`; a lock-free version counter
// lets callers detect state changes cheaply.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::AppConfig;
use crate::exchange::Exchange;
use crate::notifier::{LogNotifier, Notifier};
use crate::store::Store;
use crate::types::{BalanceInfo, EngineState};

/// A recorded error event for the status log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub symbol: Option<String>,
    pub at: String,
}

const MAX_RECENT_ERRORS: usize = 50;

/// Central engine state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub state_version: AtomicU64,

    pub engine_state: RwLock<EngineState>,
    pub config: RwLock<AppConfig>,

    /// Per-symbol ladder of prices the engine wants resting orders at.
    pub desired_levels: RwLock<HashMap<String, Vec<f64>>>,

    /// Base-asset quantity earmarked per symbol for orders already placed,
    /// so the funding check never double-counts the same balance.
    pub reserved_inventory: RwLock<HashMap<String, f64>>,

    /// Venue trade ids already folded into ladder state this run, per
    /// symbol — an in-memory fast path in front of the store's own
    /// `INSERT OR IGNORE` idempotence.
    pub processed_trade_ids: RwLock<HashMap<String, HashSet<String>>>,

    pub session_trade_counts: RwLock<HashMap<String, u64>>,

    /// Unix seconds the current run (the period since `launch`) began.
    pub session_start: RwLock<f64>,

    pub balances: RwLock<Vec<BalanceInfo>>,
    pub last_prices: RwLock<HashMap<String, f64>>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub last_reconcile_ok: RwLock<Option<Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    pub start_time: Instant,

    pub store: Arc<Store>,

    /// The currently connected venue, if any. `None` until a credential set
    /// has been activated via the exchanges API.
    pub exchange: RwLock<Option<Arc<dyn Exchange>>>,

    /// Name of the venue row `exchange` was built from — lets the background
    /// scheduler (spec §4.5) recognize which configured venue the engine
    /// already owns and skip its 60s snapshot path for it.
    pub active_venue_key: RwLock<Option<String>>,

    pub notifier: RwLock<Arc<dyn Notifier>>,

    /// Path of the JSON file `config` was loaded from — the reconciliation
    /// loop's hot-reload watcher and the `/api/v1/config` write path both
    /// need this, so it's kept here rather than threaded separately.
    pub config_path: PathBuf,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<Store>, config_path: PathBuf) -> Self {
        Self {
            state_version: AtomicU64::new(1),

            engine_state: RwLock::new(EngineState::Stopped),
            config: RwLock::new(config),

            desired_levels: RwLock::new(HashMap::new()),
            reserved_inventory: RwLock::new(HashMap::new()),
            processed_trade_ids: RwLock::new(HashMap::new()),
            session_trade_counts: RwLock::new(HashMap::new()),
            session_start: RwLock::new(0.0),

            balances: RwLock::new(Vec::new()),
            last_prices: RwLock::new(HashMap::new()),

            recent_errors: RwLock::new(Vec::new()),

            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),

            start_time: Instant::now(),

            store,
            exchange: RwLock::new(None),
            active_venue_key: RwLock::new(None),
            notifier: RwLock::new(Arc::new(LogNotifier)),
            config_path,
        }
    }

    pub fn exchange(&self) -> Option<Arc<dyn Exchange>> {
        self.exchange.read().clone()
    }

    pub fn set_exchange(&self, exchange: Option<Arc<dyn Exchange>>, venue_key: Option<String>) {
        *self.exchange.write() = exchange;
        *self.active_venue_key.write() = venue_key;
        self.increment_version();
    }

    pub fn active_venue_key(&self) -> Option<String> {
        self.active_venue_key.read().clone()
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.read().clone()
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.write() = notifier;
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    pub fn engine_state(&self) -> EngineState {
        *self.engine_state.read()
    }

    pub fn set_engine_state(&self, state: EngineState) {
        *self.engine_state.write() = state;
        self.increment_version();
    }

    pub fn is_running(&self) -> bool {
        self.engine_state() == EngineState::Running
    }

    // -------------------------------------------------------------------------
    // Error log
    // -------------------------------------------------------------------------

    pub fn push_error(&self, symbol: Option<&str>, message: impl Into<String>) {
        let record = ErrorRecord {
            message: message.into(),
            symbol: symbol.map(|s| s.to_string()),
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // -------------------------------------------------------------------------
    // Per-symbol ladder state
    // -------------------------------------------------------------------------

    pub fn get_desired_levels(&self, symbol: &str) -> Vec<f64> {
        self.desired_levels.read().get(symbol).cloned().unwrap_or_default()
    }

    pub fn set_desired_levels(&self, symbol: &str, levels: Vec<f64>) {
        self.desired_levels.write().insert(symbol.to_string(), levels);
        self.increment_version();
    }

    pub fn reserved_for(&self, symbol: &str) -> f64 {
        *self.reserved_inventory.read().get(symbol).unwrap_or(&0.0)
    }

    pub fn set_reserved_for(&self, symbol: &str, amount: f64) {
        self.reserved_inventory.write().insert(symbol.to_string(), amount);
    }

    /// Records `trade_id` as handled for `symbol`. Returns `true` if this is
    /// the first time it's been seen this run (i.e. it should be acted on).
    pub fn mark_trade_processed(&self, symbol: &str, trade_id: &str) -> bool {
        let mut map = self.processed_trade_ids.write();
        let set = map.entry(symbol.to_string()).or_default();
        set.insert(trade_id.to_string())
    }

    pub fn increment_session_trades(&self, symbol: &str) {
        let mut counts = self.session_trade_counts.write();
        *counts.entry(symbol.to_string()).or_insert(0) += 1;
    }

    pub fn session_trade_count(&self, symbol: &str) -> u64 {
        *self.session_trade_counts.read().get(symbol).unwrap_or(&0)
    }

    // -------------------------------------------------------------------------
    // Reconcile health
    // -------------------------------------------------------------------------

    pub fn mark_reconcile_ok(&self) {
        *self.last_reconcile_ok.write() = Some(Instant::now());
        *self.last_reconcile_error.write() = None;
    }

    pub fn mark_reconcile_error(&self, err: impl Into<String>) {
        *self.last_reconcile_error.write() = Some(err.into());
    }

    pub fn update_price(&self, symbol: &str, price: f64) {
        self.last_prices.write().insert(symbol.to_string(), price);
    }

    pub fn price_of(&self, symbol: &str) -> Option<f64> {
        self.last_prices.read().get(symbol).copied()
    }

    /// Reset per-run bookkeeping (levels, reserved inventory, processed-trade
    /// sets, session counters) — called when the engine (re)launches.
    pub fn reset_session(&self, session_start: f64) {
        self.desired_levels.write().clear();
        self.reserved_inventory.write().clear();
        self.processed_trade_ids.write().clear();
        self.session_trade_counts.write().clear();
        *self.session_start.write() = session_start;
        self.increment_version();
    }

    // -------------------------------------------------------------------------
    // Snapshot builder
    // -------------------------------------------------------------------------

    pub fn build_snapshot(&self) -> EngineSnapshot {
        let config = self.config.read();
        let symbols = config.enabled_symbols();

        let mut per_symbol = HashMap::new();
        for symbol in &symbols {
            per_symbol.insert(
                symbol.clone(),
                SymbolSnapshot {
                    last_price: self.price_of(symbol).unwrap_or(0.0),
                    grid_levels: self.get_desired_levels(symbol),
                    reserved_base: self.reserved_for(symbol),
                    session_trades: self.session_trade_count(symbol),
                },
            );
        }

        EngineSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            engine_state: self.engine_state().to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            session_start: *self.session_start.read(),
            symbols: per_symbol,
            balances: self.balances.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            reconcile_last_ok_age_s: self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs()),
            reconcile_last_error: self.last_reconcile_error.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types — the `GET /api/v1/status` payload
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub engine_state: String,
    pub uptime_secs: u64,
    pub session_start: f64,
    pub symbols: HashMap<String, SymbolSnapshot>,
    pub balances: Vec<BalanceInfo>,
    pub recent_errors: Vec<ErrorRecord>,
    pub reconcile_last_ok_age_s: Option<u64>,
    pub reconcile_last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolSnapshot {
    pub last_price: f64,
    pub grid_levels: Vec<f64>,
    pub reserved_base: f64,
    pub session_trades: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("bot.db")).unwrap());
        (AppState::new(AppConfig::default(), store, dir.path().join("config.json")), dir)
    }

    #[test]
    fn mark_trade_processed_is_once_only() {
        let (s, _dir) = state();
        assert!(s.mark_trade_processed("BTCUSDT", "t1"));
        assert!(!s.mark_trade_processed("BTCUSDT", "t1"));
        assert!(s.mark_trade_processed("ETHUSDT", "t1"));
    }

    #[test]
    fn reset_session_clears_per_run_state() {
        let (s, _dir) = state();
        s.set_desired_levels("BTCUSDT", vec![100.0, 101.0]);
        s.set_reserved_for("BTCUSDT", 50.0);
        s.mark_trade_processed("BTCUSDT", "t1");
        s.increment_session_trades("BTCUSDT");

        s.reset_session(12345.0);

        assert!(s.get_desired_levels("BTCUSDT").is_empty());
        assert_eq!(s.reserved_for("BTCUSDT"), 0.0);
        assert_eq!(s.session_trade_count("BTCUSDT"), 0);
        assert!(s.mark_trade_processed("BTCUSDT", "t1"));
    }

    #[test]
    fn engine_state_transitions_bump_version() {
        let (s, _dir) = state();
        let before = s.current_state_version();
        s.set_engine_state(EngineState::Running);
        assert!(s.current_state_version() > before);
        assert!(s.is_running());
    }
}
