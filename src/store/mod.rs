// =============================================================================
// Persistent Store — embedded relational database for all engine state
// =============================================================================
//
// Durable storage and read queries for market snapshots, grid status per
// symbol, the trade ledger, balance history, PnL backup/history, exchange
// credentials (encrypted), and a small key/value area for counters.
//
// Holds no business logic except deduplication of balance snapshots
// (`log_balance_snapshot`). Every operation opens a fresh connection with a
// 30s busy timeout and WAL journaling; multi-statement operations commit as
// one transaction. `VACUUM` never runs inside a transaction — `prune_old_data`
// reopens a dedicated autocommit connection for it.
// =============================================================================

pub mod crypto;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::types::{Candle, OpenOrder, Side, Trade};
use crypto::EncryptionKey;

/// Everything `get_pair_data` assembles for one symbol's detail view.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PairData {
    pub price: f64,
    pub candles: Vec<Candle>,
    pub open_orders: Vec<OpenOrder>,
    pub grid_levels: Vec<f64>,
    pub trades: Vec<Trade>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExchangeInfo {
    pub name: String,
    pub has_credentials: bool,
    pub is_active: bool,
    pub use_testnet: bool,
    pub venue_type: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: Option<String>,
    pub use_testnet: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionStats {
    pub total_trades: u64,
    pub best_coin: String,
    pub trades_per_coin: HashMap<String, u64>,
    pub cash_flow_per_coin: HashMap<String, f64>,
    pub qty_delta_per_coin: HashMap<String, f64>,
}

/// Minimum gap (seconds) or equity delta required to accept a new balance
/// snapshot row — spec §4.2 / §8 boundary scenario 6.
const BALANCE_MIN_INTERVAL_SECS: f64 = 50.0;
const BALANCE_MIN_DELTA: f64 = 0.01;

pub struct Store {
    db_path: PathBuf,
    key: EncryptionKey,
}

impl Store {
    /// Open (creating if absent) the database at `db_path`, resolving the
    /// credential-encryption key relative to `db_path`'s parent directory.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        }
        let key = EncryptionKey::load_or_generate(
            db_path.parent().unwrap_or_else(|| Path::new(".")),
        )?;

        let store = Self { db_path, key };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open database {}", self.db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS market_data (
                symbol TEXT PRIMARY KEY, price REAL, candles_json TEXT, updated_at REAL
            );
            CREATE TABLE IF NOT EXISTS grid_status (
                symbol TEXT PRIMARY KEY, open_orders_json TEXT, grid_levels_json TEXT,
                updated_at REAL, setup_done INTEGER DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS trade_history (
                id TEXT PRIMARY KEY, symbol TEXT, side TEXT, price REAL, amount REAL,
                cost REAL, fee_in_quote REAL, timestamp INTEGER, buy_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS balance_history (
                timestamp REAL NOT NULL, equity REAL, exchange TEXT NOT NULL DEFAULT 'default',
                PRIMARY KEY (timestamp, exchange)
            );
            CREATE TABLE IF NOT EXISTS bot_info (key TEXT PRIMARY KEY, value TEXT);
            CREATE TABLE IF NOT EXISTS pnl_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT, symbol TEXT, pnl_value REAL, timestamp REAL
            );
            CREATE TABLE IF NOT EXISTS pnl_backup (
                symbol TEXT PRIMARY KEY, pnl_value REAL, updated_at REAL
            );
            CREATE TABLE IF NOT EXISTS exchanges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                api_key TEXT, secret_key TEXT, passphrase TEXT,
                is_active INTEGER DEFAULT 1,
                use_testnet INTEGER DEFAULT 0,
                venue_type TEXT DEFAULT 'binance',
                created_at REAL, updated_at REAL
            );",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO bot_info (key, value) VALUES ('next_buy_id', '1')",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO bot_info (key, value) VALUES ('first_run', ?1)",
            params![now_ts().to_string()],
        )?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market data / grid status
    // -------------------------------------------------------------------------

    pub fn update_market_snapshot(&self, symbol: &str, price: f64, candles: &[Candle]) -> Result<()> {
        let conn = self.conn()?;
        let candles_json = serde_json::to_string(candles)?;
        conn.execute(
            "INSERT OR REPLACE INTO market_data (symbol, price, candles_json, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![symbol, price, candles_json, now_ts()],
        )?;
        Ok(())
    }

    /// Update the mirrored open-order set and desired levels for `symbol`,
    /// preserving whatever `setup_done` value is already on record.
    pub fn update_grid_status(&self, symbol: &str, orders: &[OpenOrder], levels: &[f64]) -> Result<()> {
        let conn = self.conn()?;
        let setup_done: i64 = conn
            .query_row(
                "SELECT setup_done FROM grid_status WHERE symbol=?1",
                params![symbol],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let orders_json = serde_json::to_string(orders)?;
        let levels_json = serde_json::to_string(levels)?;
        conn.execute(
            "INSERT OR REPLACE INTO grid_status (symbol, open_orders_json, grid_levels_json, updated_at, setup_done)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![symbol, orders_json, levels_json, now_ts(), setup_done],
        )?;
        Ok(())
    }

    pub fn set_symbol_setup_done(&self, symbol: &str, done: bool) -> Result<()> {
        let conn = self.conn()?;
        let val = if done { 1 } else { 0 };
        let rows = conn.execute(
            "UPDATE grid_status SET setup_done=?1 WHERE symbol=?2",
            params![val, symbol],
        )?;
        if rows == 0 {
            conn.execute(
                "INSERT INTO grid_status (symbol, setup_done, updated_at) VALUES (?1, ?2, ?3)",
                params![symbol, val, now_ts()],
            )?;
        }
        Ok(())
    }

    pub fn get_symbol_setup_done(&self, symbol: &str) -> Result<bool> {
        let conn = self.conn()?;
        let val: Option<i64> = conn
            .query_row(
                "SELECT setup_done FROM grid_status WHERE symbol=?1",
                params![symbol],
                |r| r.get(0),
            )
            .optional()?;
        Ok(val.unwrap_or(0) != 0)
    }

    pub fn get_pair_data(&self, symbol: &str) -> Result<PairData> {
        let conn = self.conn()?;

        let market: Option<(f64, String)> = conn
            .query_row(
                "SELECT price, candles_json FROM market_data WHERE symbol=?1",
                params![symbol],
                |r| Ok((r.get(0)?, r.get(1).unwrap_or_default())),
            )
            .optional()?;

        let grid: Option<String> = conn
            .query_row(
                "SELECT grid_levels_json FROM grid_status WHERE symbol=?1",
                params![symbol],
                |r| r.get(0),
            )
            .optional()?;

        let open_orders_json: Option<String> = conn
            .query_row(
                "SELECT open_orders_json FROM grid_status WHERE symbol=?1",
                params![symbol],
                |r| r.get(0),
            )
            .optional()?;

        let mut stmt = conn.prepare(
            "SELECT id, symbol, side, price, amount, cost, fee_in_quote, timestamp, buy_id
             FROM trade_history WHERE symbol=?1 ORDER BY timestamp DESC LIMIT 50",
        )?;
        let trades = stmt
            .query_map(params![symbol], row_to_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PairData {
            price: market.as_ref().map(|m| m.0).unwrap_or(0.0),
            candles: market
                .and_then(|m| serde_json::from_str(&m.1).ok())
                .unwrap_or_default(),
            open_orders: open_orders_json
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            grid_levels: grid
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            trades,
        })
    }

    pub fn get_all_prices(&self) -> Result<HashMap<String, f64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT symbol, price FROM market_data")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    pub fn get_all_stored_grids(&self) -> Result<HashMap<String, Vec<f64>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT symbol, grid_levels_json FROM grid_status")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (symbol, json) = row?;
            if let Some(json) = json {
                if let Ok(levels) = serde_json::from_str::<Vec<f64>>(&json) {
                    out.insert(symbol, levels);
                }
            }
        }
        Ok(out)
    }

    pub fn get_all_active_orders(&self) -> Result<Vec<(String, OpenOrder)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT symbol, open_orders_json FROM grid_status")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (symbol, json) = row?;
            if let Some(json) = json {
                if let Ok(orders) = serde_json::from_str::<Vec<OpenOrder>>(&json) {
                    for o in orders {
                        out.push((symbol.clone(), o));
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn clear_orders_cache(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE grid_status SET open_orders_json = '[]'", [])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trade ledger
    // -------------------------------------------------------------------------

    /// Idempotent on venue trade id (`INSERT OR IGNORE`). The fee has already
    /// been normalized to quote by the caller.
    pub fn save_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO trade_history
             (id, symbol, side, price, amount, cost, fee_in_quote, timestamp, buy_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.id,
                trade.symbol,
                trade.side.to_string(),
                trade.price,
                trade.amount,
                trade.cost,
                trade.fee_in_quote,
                trade.timestamp,
                trade.buy_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_last_buy_price(&self, symbol: &str) -> Result<f64> {
        let conn = self.conn()?;
        let price: Option<f64> = conn
            .query_row(
                "SELECT price FROM trade_history WHERE symbol=?1 AND side='buy' ORDER BY timestamp DESC LIMIT 1",
                params![symbol],
                |r| r.get(0),
            )
            .optional()?;
        Ok(price.unwrap_or(0.0))
    }

    /// Atomically increments and returns `next_buy_id`; wraps 1000 -> 1.
    pub fn next_buy_id(&self) -> Result<i64> {
        let conn = self.conn()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT value FROM bot_info WHERE key='next_buy_id'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        let current_id: i64 = current.and_then(|s| s.parse().ok()).unwrap_or(1);
        let assigned = current_id;
        let next = if current_id + 1 > 1000 { 1 } else { current_id + 1 };
        conn.execute(
            "INSERT OR REPLACE INTO bot_info (key, value) VALUES ('next_buy_id', ?1)",
            params![next.to_string()],
        )?;
        Ok(assigned)
    }

    /// On a buy trade, return its pre-existing `buy_id`, or mint and assign a
    /// new one via `next_buy_id` if none is set yet.
    pub fn assign_id_to_trade_if_missing(&self, trade_id: &str) -> Result<i64> {
        let existing: Option<i64> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT buy_id FROM trade_history WHERE id=?1",
                params![trade_id],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten()
        };
        if let Some(id) = existing {
            return Ok(id);
        }

        let new_id = self.next_buy_id()?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE trade_history SET buy_id=?1 WHERE id=?2",
            params![new_id, trade_id],
        )?;
        Ok(new_id)
    }

    /// Persists the `buy_id` linkage found by `find_linked_buy_id` onto a
    /// sell's own trade row.
    pub fn set_trade_buy_id(&self, trade_id: &str, buy_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE trade_history SET buy_id=?1 WHERE id=?2",
            params![buy_id, trade_id],
        )?;
        Ok(())
    }

    /// Selects the most recent buy on `symbol` whose price lies within ±1%
    /// of `sell_price / (1 + spread_pct/100)`.
    pub fn find_linked_buy_id(&self, symbol: &str, sell_price: f64, spread_pct: f64) -> Result<Option<i64>> {
        let target = sell_price / (1.0 + spread_pct / 100.0);
        let min_p = target * 0.99;
        let max_p = target * 1.01;
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT buy_id FROM trade_history
                 WHERE symbol=?1 AND side='buy' AND price >= ?2 AND price <= ?3
                 ORDER BY timestamp DESC LIMIT 1",
                params![symbol, min_p, max_p],
                |r| r.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Balance history
    // -------------------------------------------------------------------------

    /// Rejects the write if the last row for `exchange` is within
    /// `MIN_INTERVAL` seconds AND differs by `<= MIN_DELTA`. Returns whether a
    /// row was actually inserted.
    pub fn log_balance_snapshot(&self, equity: f64, exchange: &str) -> Result<bool> {
        let conn = self.conn()?;
        let current_ts = now_ts();

        let last: Option<(f64, f64)> = conn
            .query_row(
                "SELECT timestamp, equity FROM balance_history WHERE exchange=?1 ORDER BY timestamp DESC LIMIT 1",
                params![exchange],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        if let Some((last_ts, last_eq)) = last {
            if (current_ts - last_ts) < BALANCE_MIN_INTERVAL_SECS
                && (equity - last_eq).abs() <= BALANCE_MIN_DELTA
            {
                return Ok(false);
            }
        }

        conn.execute(
            "INSERT INTO balance_history (timestamp, equity, exchange) VALUES (?1, ?2, ?3)",
            params![current_ts, equity, exchange],
        )?;
        Ok(true)
    }

    pub fn get_balance_history(&self, from_ts: f64, exchange: Option<&str>) -> Result<Vec<(f64, f64)>> {
        let conn = self.conn()?;
        let rows = match exchange {
            Some(ex) => {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, equity FROM balance_history WHERE timestamp >= ?1 AND exchange=?2 ORDER BY timestamp ASC",
                )?;
                stmt.query_map(params![from_ts, ex], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, equity FROM balance_history WHERE timestamp >= ?1 ORDER BY timestamp ASC",
                )?;
                stmt.query_map(params![from_ts], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    pub fn get_last_balance_snapshot(&self, exchange: &str) -> Result<Option<(f64, f64)>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT timestamp, equity FROM balance_history WHERE exchange=?1 ORDER BY timestamp DESC LIMIT 1",
                params![exchange],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn clear_balance_history(&self, exchange: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        match exchange {
            Some(ex) => conn.execute("DELETE FROM balance_history WHERE exchange=?1", params![ex])?,
            None => conn.execute("DELETE FROM balance_history", [])?,
        };
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PnL backup / history
    // -------------------------------------------------------------------------

    pub fn update_pnl_backup(&self, symbol: &str, value: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO pnl_backup (symbol, pnl_value, updated_at) VALUES (?1, ?2, ?3)",
            params![symbol, value, now_ts()],
        )?;
        Ok(())
    }

    /// Moves non-zero backup rows into history, then truncates the backup.
    /// Returns `true` iff at least one row was moved.
    pub fn archive_session_stats(&self) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows: Vec<(String, f64)> = {
            let mut stmt = tx.prepare("SELECT symbol, pnl_value FROM pnl_backup")?;
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        if rows.is_empty() {
            return Ok(false);
        }

        info!(symbols = rows.len(), "archiving previous session's PnL backup");
        let ts = now_ts();
        for (symbol, pnl) in &rows {
            if *pnl != 0.0 {
                tx.execute(
                    "INSERT INTO pnl_history (symbol, pnl_value, timestamp) VALUES (?1, ?2, ?3)",
                    params![symbol, pnl, ts],
                )?;
            }
        }
        tx.execute("DELETE FROM pnl_backup", [])?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_accumulated_pnl(&self, symbol: &str) -> Result<f64> {
        let conn = self.conn()?;
        let sum: Option<f64> = conn.query_row(
            "SELECT SUM(pnl_value) FROM pnl_history WHERE symbol=?1",
            params![symbol],
            |r| r.get(0),
        )?;
        Ok(sum.unwrap_or(0.0))
    }

    pub fn reset_global_pnl_history(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM pnl_history", [])?;
        conn.execute("DELETE FROM pnl_backup", [])?;
        Ok(())
    }

    pub fn reset_global_pnl_for_symbol(&self, symbol: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM pnl_history WHERE symbol=?1", params![symbol])?;
        conn.execute("DELETE FROM pnl_backup WHERE symbol=?1", params![symbol])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Session / counters bookkeeping (bot_info key/value area)
    // -------------------------------------------------------------------------

    fn get_kv(&self, conn: &Connection, key: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row("SELECT value FROM bot_info WHERE key=?1", params![key], |r| r.get(0))
            .optional()?)
    }

    fn set_kv(&self, conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO bot_info (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_first_run_timestamp(&self) -> Result<f64> {
        let conn = self.conn()?;
        Ok(self
            .get_kv(&conn, "first_run")?
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(now_ts))
    }

    pub fn set_session_start_time(&self, ts: f64) -> Result<()> {
        let conn = self.conn()?;
        self.set_kv(&conn, "session_start_time", &ts.to_string())
    }

    pub fn get_session_start_time(&self) -> Result<f64> {
        let conn = self.conn()?;
        Ok(self
            .get_kv(&conn, "session_start_time")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0))
    }

    pub fn set_session_start_balance(&self, value: f64) -> Result<()> {
        let conn = self.conn()?;
        self.set_kv(&conn, "session_start_balance", &value.to_string())
    }

    pub fn get_session_start_balance(&self) -> Result<f64> {
        let conn = self.conn()?;
        Ok(self
            .get_kv(&conn, "session_start_balance")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0))
    }

    pub fn set_global_start_balance_if_not_exists(&self, value: f64) -> Result<()> {
        let conn = self.conn()?;
        if self.get_kv(&conn, "global_start_balance")?.is_none() {
            self.set_kv(&conn, "global_start_balance", &value.to_string())?;
        }
        Ok(())
    }

    pub fn get_global_start_balance(&self) -> Result<f64> {
        let conn = self.conn()?;
        Ok(self
            .get_kv(&conn, "global_start_balance")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0))
    }

    pub fn set_coin_session_start(&self, symbol: &str, ts: f64) -> Result<()> {
        let conn = self.conn()?;
        self.set_kv(&conn, &format!("session_start_{symbol}"), &ts.to_string())
    }

    pub fn get_coin_session_start(&self, symbol: &str) -> Result<f64> {
        let conn = self.conn()?;
        Ok(self
            .get_kv(&conn, &format!("session_start_{symbol}"))?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0))
    }

    fn get_coins_initial_equity(&self, conn: &Connection) -> Result<HashMap<String, f64>> {
        Ok(self
            .get_kv(conn, "coins_initial_equity")?
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default())
    }

    pub fn set_coin_initial_balance(&self, symbol: &str, value_quote: f64) -> Result<()> {
        let conn = self.conn()?;
        let mut data = self.get_coins_initial_equity(&conn)?;
        data.insert(symbol.to_string(), value_quote);
        self.set_kv(&conn, "coins_initial_equity", &serde_json::to_string(&data)?)
    }

    pub fn get_coin_initial_balance(&self, symbol: &str) -> Result<f64> {
        let conn = self.conn()?;
        Ok(self
            .get_coins_initial_equity(&conn)?
            .get(symbol)
            .copied()
            .unwrap_or(0.0))
    }

    pub fn reset_coin_initial_balances(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM bot_info WHERE key='coins_initial_equity'", [])?;
        Ok(())
    }

    /// Manual balance-ledger adjustment (deposit/withdrawal accounting):
    /// shifts both the global and the session start balances by `delta`.
    pub fn adjust_balance_history(&self, delta: f64) -> Result<()> {
        let conn = self.conn()?;
        let glob = self.get_kv(&conn, "global_start_balance")?.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
        self.set_kv(&conn, "global_start_balance", &(glob + delta).to_string())?;
        let sess = self.get_kv(&conn, "session_start_balance")?.and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
        self.set_kv(&conn, "session_start_balance", &(sess + delta).to_string())?;
        Ok(())
    }

    pub fn adjust_coin_initial_balance(&self, symbol: &str, delta: f64) -> Result<()> {
        let conn = self.conn()?;
        let mut data = self.get_coins_initial_equity(&conn)?;
        let current = data.get(symbol).copied().unwrap_or(0.0);
        data.insert(symbol.to_string(), current + delta);
        self.set_kv(&conn, "coins_initial_equity", &serde_json::to_string(&data)?)
    }

    pub fn clear_session_data(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM bot_info WHERE key='session_start_time'", [])?;
        conn.execute("DELETE FROM bot_info WHERE key='session_start_balance'", [])?;
        conn.execute("DELETE FROM bot_info WHERE key LIKE 'session_start_%'", [])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stats (session PnL accounting inputs)
    // -------------------------------------------------------------------------

    pub fn get_stats(&self, from_ts_secs: f64) -> Result<SessionStats> {
        let conn = self.conn()?;
        let from_ms = (from_ts_secs * 1000.0) as i64;

        let mut stmt = conn.prepare(
            "SELECT symbol, side, cost, fee_in_quote, amount, timestamp FROM trade_history WHERE timestamp >= ?1",
        )?;
        let rows: Vec<(String, String, f64, f64, f64, i64)> = stmt
            .query_map(params![from_ms], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut coin_sessions = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT key, value FROM bot_info WHERE key LIKE 'session_start_%'")?;
            let kv = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
            for pair in kv {
                let (k, v) = pair?;
                if let Some(sym) = k.strip_prefix("session_start_") {
                    if let Ok(ts) = v.parse::<f64>() {
                        coin_sessions.insert(sym.to_string(), ts);
                    }
                }
            }
        }

        let mut cash_flow = HashMap::new();
        let mut qty_delta = HashMap::new();
        let mut per_coin = HashMap::new();
        let mut total = 0u64;

        for (symbol, side, cost, fee, amount, ts) in rows {
            if let Some(&session_start) = coin_sessions.get(&symbol) {
                if from_ts_secs > 0.0 && session_start > 0.0 && (ts as f64) < session_start * 1000.0 {
                    continue;
                }
            }
            total += 1;
            let signed = if side == "sell" { cost } else { -cost };
            let net = signed - fee;
            *cash_flow.entry(symbol.clone()).or_insert(0.0) += net;
            let delta = if side == "buy" { amount } else { -amount };
            *qty_delta.entry(symbol.clone()).or_insert(0.0) += delta;
            *per_coin.entry(symbol).or_insert(0u64) += 1;
        }

        // Deterministic tie-break: the `pnl` accountant's selector wants an
        // explicit symbol ordering rather than trusting HashMap iteration
        // order, so sort the symbols that actually traded in this window.
        let mut symbols_seen: Vec<String> = cash_flow.keys().cloned().collect();
        symbols_seen.sort();
        let best_coin = crate::pnl::best_coin(&cash_flow, &symbols_seen).unwrap_or_else(|| "-".to_string());

        Ok(SessionStats {
            total_trades: total,
            best_coin,
            trades_per_coin: per_coin,
            cash_flow_per_coin: cash_flow,
            qty_delta_per_coin: qty_delta,
        })
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Deletes rows older than `days_keep` from trades and balance history,
    /// then reclaims space via `VACUUM` on a dedicated autocommit connection
    /// — never inside the deleting transaction.
    pub fn prune_old_data(&self, days_keep: u32) -> Result<(usize, usize)> {
        let cutoff_secs = now_ts() - (days_keep as f64 * 86400.0);
        let cutoff_ms = (cutoff_secs * 1000.0) as i64;

        let (deleted_trades, deleted_balance) = {
            let conn = self.conn()?;
            let trades = conn.execute("DELETE FROM trade_history WHERE timestamp < ?1", params![cutoff_ms])?;
            let balance = conn.execute("DELETE FROM balance_history WHERE timestamp < ?1", params![cutoff_secs])?;
            (trades, balance)
        };

        if deleted_trades > 0 || deleted_balance > 0 {
            if let Err(e) = self.vacuum() {
                warn!(error = %e, "VACUUM failed (non-critical)");
            }
        }

        Ok((deleted_trades, deleted_balance))
    }

    fn vacuum(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    pub fn reset_all_statistics(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM trade_history", [])?;
        tx.execute("DELETE FROM balance_history", [])?;
        tx.execute("UPDATE grid_status SET setup_done=0", [])?;
        tx.execute("DELETE FROM pnl_history", [])?;
        tx.execute("DELETE FROM pnl_backup", [])?;
        tx.execute(
            "DELETE FROM bot_info WHERE key IN ('first_run','global_start_balance','session_start_balance','coins_initial_equity','next_buy_id')",
            [],
        )?;
        let now = now_ts().to_string();
        tx.execute("INSERT INTO bot_info (key, value) VALUES ('first_run', ?1)", params![now])?;
        tx.execute("INSERT INTO bot_info (key, value) VALUES ('next_buy_id', '1')", [])?;
        tx.execute("DELETE FROM bot_info WHERE key='session_start_time'", [])?;
        tx.execute("DELETE FROM bot_info WHERE key LIKE 'session_start_%'", [])?;
        tx.commit()?;
        Ok(())
    }

    pub fn clear_all_trades_history(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM trade_history", [])?;
        conn.execute("DELETE FROM pnl_history", [])?;
        conn.execute("DELETE FROM pnl_backup", [])?;
        Ok(())
    }

    pub fn delete_trades_for_symbol(&self, symbol: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM trade_history WHERE symbol=?1", params![symbol])?;
        conn.execute("DELETE FROM pnl_backup WHERE symbol=?1", params![symbol])?;
        conn.execute("DELETE FROM pnl_history WHERE symbol=?1", params![symbol])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exchange credentials (encrypted at rest)
    // -------------------------------------------------------------------------

    pub fn save_exchange(
        &self,
        name: &str,
        api_key: &str,
        secret_key: &str,
        passphrase: Option<&str>,
        use_testnet: bool,
        venue_type: &str,
    ) -> Result<()> {
        let enc_api = self.key.encrypt(api_key.trim())?;
        let enc_secret = self.key.encrypt(secret_key.trim())?;
        let enc_pass = passphrase
            .filter(|p| !p.is_empty())
            .map(|p| self.key.encrypt(p.trim()))
            .transpose()?;

        let conn = self.conn()?;
        let now = now_ts();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM exchanges WHERE name=?1", params![name], |r| r.get(0))
            .optional()?;

        if exists.is_some() {
            conn.execute(
                "UPDATE exchanges SET api_key=?1, secret_key=?2, passphrase=?3, use_testnet=?4, venue_type=?5, updated_at=?6 WHERE name=?7",
                params![enc_api, enc_secret, enc_pass, use_testnet as i64, venue_type, now, name],
            )?;
        } else {
            conn.execute(
                "INSERT INTO exchanges (name, api_key, secret_key, passphrase, is_active, use_testnet, venue_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?7)",
                params![name, enc_api, enc_secret, enc_pass, use_testnet as i64, venue_type, now],
            )?;
        }
        info!(name, "exchange credentials saved");
        Ok(())
    }

    pub fn get_exchanges(&self) -> Result<Vec<ExchangeInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, api_key, secret_key, is_active, use_testnet, venue_type FROM exchanges ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ExchangeInfo {
                    name: r.get(0)?,
                    has_credentials: r.get::<_, Option<String>>(1)?.is_some()
                        && r.get::<_, Option<String>>(2)?.is_some(),
                    is_active: r.get::<_, i64>(3)? != 0,
                    use_testnet: r.get::<_, i64>(4)? != 0,
                    venue_type: r.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_exchange_credentials(&self, name: &str) -> Result<Option<ExchangeCredentials>> {
        let conn = self.conn()?;
        let row: Option<(String, String, Option<String>, i64)> = conn
            .query_row(
                "SELECT api_key, secret_key, passphrase, use_testnet FROM exchanges WHERE name=?1",
                params![name],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;

        let Some((enc_api, enc_secret, enc_pass, use_testnet)) = row else {
            return Ok(None);
        };

        let api_key = self.key.decrypt(&enc_api);
        let secret_key = self.key.decrypt(&enc_secret);

        let (Some(api_key), Some(secret_key)) = (api_key, secret_key) else {
            anyhow::bail!("could not decrypt credentials for exchange {name}");
        };

        Ok(Some(ExchangeCredentials {
            api_key,
            secret_key,
            passphrase: enc_pass.and_then(|p| self.key.decrypt(&p)),
            use_testnet: use_testnet != 0,
        }))
    }

    pub fn delete_exchange(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM exchanges WHERE name=?1", params![name])?;
        Ok(())
    }
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let side_str: String = row.get(2)?;
    Ok(Trade {
        id: row.get(0)?,
        symbol: row.get(1)?,
        side: if side_str == "sell" { Side::Sell } else { Side::Buy },
        price: row.get(3)?,
        amount: row.get(4)?,
        cost: row.get(5)?,
        fee_in_quote: row.get(6)?,
        timestamp: row.get(7)?,
        buy_id: row.get(8)?,
    })
}

fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("bot.db")).unwrap();
        (store, dir)
    }

    fn sample_trade(id: &str, symbol: &str, side: Side, price: f64, ts: i64) -> Trade {
        Trade {
            id: id.to_string(),
            symbol: symbol.to_string(),
            side,
            price,
            amount: 1.0,
            cost: price,
            fee_in_quote: 0.0,
            timestamp: ts,
            buy_id: None,
        }
    }

    #[test]
    fn save_trade_is_idempotent_on_venue_trade_id() {
        let (store, _dir) = test_store();
        let t = sample_trade("t1", "BTCUSDT", Side::Buy, 100.0, 1000);
        store.save_trade(&t).unwrap();
        store.save_trade(&t).unwrap();

        let data = store.get_pair_data("BTCUSDT").unwrap();
        assert_eq!(data.trades.len(), 1);
    }

    #[test]
    fn next_buy_id_wraps_at_1000() {
        let (store, _dir) = test_store();
        // Drive the counter up to 1000 then confirm wraparound to 1.
        for expected in 1..=999 {
            assert_eq!(store.next_buy_id().unwrap(), expected);
        }
        assert_eq!(store.next_buy_id().unwrap(), 1000);
        assert_eq!(store.next_buy_id().unwrap(), 1);
    }

    #[test]
    fn find_linked_buy_id_within_one_percent_tolerance() {
        let (store, _dir) = test_store();
        let mut buy = sample_trade("b1", "BTCUSDT", Side::Buy, 99.60, 1000);
        buy.buy_id = Some(42);
        store.save_trade(&buy).unwrap();

        // target = 100.60 / 1.01 = 99.60396...
        let linked = store.find_linked_buy_id("BTCUSDT", 100.60, 1.0).unwrap();
        assert_eq!(linked, Some(42));
    }

    #[test]
    fn find_linked_buy_id_none_outside_tolerance() {
        let (store, _dir) = test_store();
        let mut buy = sample_trade("b1", "BTCUSDT", Side::Buy, 80.0, 1000);
        buy.buy_id = Some(7);
        store.save_trade(&buy).unwrap();

        let linked = store.find_linked_buy_id("BTCUSDT", 100.60, 1.0).unwrap();
        assert_eq!(linked, None);
    }

    #[test]
    fn balance_snapshot_dedup_rejects_close_and_small() {
        let (store, _dir) = test_store();
        assert!(store.log_balance_snapshot(1000.00, "ex").unwrap());
        // Immediately after, tiny delta => rejected.
        assert!(!store.log_balance_snapshot(1000.005, "ex").unwrap());
        // Same instant but bigger delta => accepted.
        assert!(store.log_balance_snapshot(1000.02, "ex").unwrap());
    }

    #[test]
    fn archive_session_stats_moves_only_nonzero_rows() {
        let (store, _dir) = test_store();
        store.update_pnl_backup("BTCUSDT", 5.0).unwrap();
        store.update_pnl_backup("ETHUSDT", 0.0).unwrap();

        let moved = store.archive_session_stats().unwrap();
        assert!(moved);

        assert_eq!(store.get_accumulated_pnl("BTCUSDT").unwrap(), 5.0);
        assert_eq!(store.get_accumulated_pnl("ETHUSDT").unwrap(), 0.0);
    }

    #[test]
    fn archive_empty_backup_is_noop() {
        let (store, _dir) = test_store();
        assert!(!store.archive_session_stats().unwrap());
    }

    #[test]
    fn credential_roundtrip_never_exposes_ciphertext() {
        let (store, _dir) = test_store();
        store
            .save_exchange("binance", "my-api-key", "my-secret", None, false, "binance")
            .unwrap();

        let creds = store.get_exchange_credentials("binance").unwrap().unwrap();
        assert_eq!(creds.api_key, "my-api-key");
        assert_eq!(creds.secret_key, "my-secret");

        let listed = store.get_exchanges().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].has_credentials);
    }

    #[test]
    fn prune_old_data_removes_stale_rows() {
        let (store, _dir) = test_store();
        let old_ts_ms = ((now_ts() - 40.0 * 86400.0) * 1000.0) as i64;
        store.save_trade(&sample_trade("old", "BTCUSDT", Side::Buy, 10.0, old_ts_ms)).unwrap();
        store.save_trade(&sample_trade("new", "BTCUSDT", Side::Buy, 11.0, (now_ts() * 1000.0) as i64)).unwrap();

        let (deleted_trades, _deleted_balance) = store.prune_old_data(30).unwrap();
        assert_eq!(deleted_trades, 1);

        let data = store.get_pair_data("BTCUSDT").unwrap();
        assert_eq!(data.trades.len(), 1);
        assert_eq!(data.trades[0].id, "new");
    }
}
