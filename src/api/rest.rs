// =============================================================================
// REST API — read/query and command surface (spec §6)
// =============================================================================
//
// All endpoints live under `/api/v1/`. `/api/v1/health` is public; everything
// else requires a valid Bearer token via `AuthBearer`. Credential endpoints
// never echo back secret material — only a short fingerprint of what's
// stored, derived from a hash of the name and venue type.
//
// CORS is permissive — this surface is meant to sit behind a reverse proxy
// that terminates TLS and restricts origins.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::{AppState, EngineSnapshot};
use crate::engine::GridEngine;
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::Exchange;
use crate::store::{ExchangeInfo, PairData, SessionStats};
use crate::types::Side;

#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<AppState>,
    pub engine: Arc<GridEngine>,
}

pub fn router(app: Arc<AppState>, engine: Arc<GridEngine>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let state = ApiState { app, engine };

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/account", get(account))
        .route("/api/v1/stats/session", get(stats_session))
        .route("/api/v1/stats/global", get(stats_global))
        .route("/api/v1/strategies/top", get(top_strategies))
        .route("/api/v1/balances/history", get(balance_history))
        .route("/api/v1/pairs/:symbol", get(pair_detail))
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/config", post(set_config))
        .route("/api/v1/exchanges", get(list_exchanges))
        .route("/api/v1/exchanges", post(connect_exchange))
        .route("/api/v1/exchanges/:name", axum::routing::delete(disconnect_exchange))
        .route("/api/v1/control/launch", post(control_launch))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/stop", post(control_stop))
        .route("/api/v1/control/cancel-all", post(control_cancel_all))
        .route("/api/v1/control/liquidate", post(control_liquidate))
        .route("/api/v1/control/close-position", post(control_close_position))
        .route("/api/v1/control/snapshot-equity", post(control_snapshot_equity))
        .route("/api/v1/control/reset-statistics", post(control_reset_statistics))
        .route("/api/v1/control/adjust-balance", post(control_adjust_balance))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Shared response shapes
// =============================================================================

#[derive(Serialize)]
struct CommandResponse {
    status: &'static str,
    message: String,
}

impl CommandResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self { status: "ok", message: message.into() }
    }
}

fn err_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(CommandResponse { status: "error", message: message.into() })).into_response()
}

// =============================================================================
// Public
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.app.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Reads
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<ApiState>) -> Json<EngineSnapshot> {
    Json(state.app.build_snapshot())
}

#[derive(Serialize)]
struct AccountResponse {
    engine_state: String,
    active_venue: Option<String>,
    connected: bool,
    session_start: f64,
    uptime_secs: u64,
}

async fn account(_auth: AuthBearer, State(state): State<ApiState>) -> Json<AccountResponse> {
    Json(AccountResponse {
        engine_state: state.app.engine_state().to_string(),
        active_venue: state.app.active_venue_key(),
        connected: state.app.exchange().is_some(),
        session_start: *state.app.session_start.read(),
        uptime_secs: state.app.start_time.elapsed().as_secs(),
    })
}

async fn stats_session(_auth: AuthBearer, State(state): State<ApiState>) -> Result<Json<SessionStats>, axum::response::Response> {
    let since = *state.app.session_start.read();
    state
        .app
        .store
        .get_stats(since)
        .map(Json)
        .map_err(|e| err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn stats_global(_auth: AuthBearer, State(state): State<ApiState>) -> Result<Json<SessionStats>, axum::response::Response> {
    state
        .app
        .store
        .get_stats(0.0)
        .map(Json)
        .map_err(|e| err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Serialize)]
struct StrategyRoi {
    symbol: String,
    initial_balance: f64,
    accumulated_pnl: f64,
    annualized_roi_pct: f64,
}

/// Ranks enabled pairs by annualized ROI: accumulated PnL over each symbol's
/// own initial balance, scaled from its elapsed session length to a year.
async fn top_strategies(_auth: AuthBearer, State(state): State<ApiState>) -> Json<Vec<StrategyRoi>> {
    let symbols = state.app.config.read().enabled_symbols();
    let now = now_secs();

    let mut rows: Vec<StrategyRoi> = symbols
        .into_iter()
        .filter_map(|symbol| {
            let initial = state.app.store.get_coin_initial_balance(&symbol).unwrap_or(0.0);
            if initial <= 0.0 {
                return None;
            }
            let pnl = state.app.store.get_accumulated_pnl(&symbol).unwrap_or(0.0);
            let started = state.app.store.get_coin_session_start(&symbol).unwrap_or(now);
            let elapsed = (now - started).max(3600.0);
            let roi = pnl / initial;
            let annualized = roi * (365.0 * 86_400.0 / elapsed) * 100.0;
            Some(StrategyRoi {
                symbol,
                initial_balance: initial,
                accumulated_pnl: pnl,
                annualized_roi_pct: annualized,
            })
        })
        .collect();

    rows.sort_by(|a, b| b.annualized_roi_pct.partial_cmp(&a.annualized_roi_pct).unwrap_or(std::cmp::Ordering::Equal));
    Json(rows)
}

#[derive(Deserialize)]
struct BalanceHistoryQuery {
    since: Option<f64>,
    exchange: Option<String>,
}

async fn balance_history(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Query(q): Query<BalanceHistoryQuery>,
) -> Result<Json<Vec<(f64, f64)>>, axum::response::Response> {
    let since = q.since.unwrap_or(0.0);
    state
        .app
        .store
        .get_balance_history(since, q.exchange.as_deref())
        .map(Json)
        .map_err(|e| err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn pair_detail(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> Result<Json<PairData>, axum::response::Response> {
    state
        .app
        .store
        .get_pair_data(&symbol)
        .map(Json)
        .map_err(|e| err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn get_config(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.app.config.read().clone())
}

async fn set_config(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Json(new_config): Json<crate::config::AppConfig>,
) -> axum::response::Response {
    for pair in &new_config.pairs {
        let strategy = new_config.strategy_for(pair);
        if let Err(e) = strategy.validate() {
            return err_response(StatusCode::BAD_REQUEST, format!("invalid strategy for {}: {e}", pair.symbol));
        }
    }

    let path = &state.app.config_path;
    if let Err(e) = new_config.save(path) {
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to save config: {e}"));
    }

    *state.app.config.write() = new_config;
    state.app.increment_version();
    Json(CommandResponse::ok("configuration saved")).into_response()
}

// =============================================================================
// Exchange credentials
// =============================================================================

#[derive(Serialize)]
struct ExchangeView {
    name: String,
    has_credentials: bool,
    is_active: bool,
    use_testnet: bool,
    venue_type: String,
    fingerprint: Option<String>,
}

fn fingerprint_of(info: &ExchangeInfo) -> Option<String> {
    if !info.has_credentials {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(info.name.as_bytes());
    hasher.update(info.venue_type.as_bytes());
    let digest = hasher.finalize();
    Some(hex::encode(&digest[..4]))
}

async fn list_exchanges(_auth: AuthBearer, State(state): State<ApiState>) -> Result<Json<Vec<ExchangeView>>, axum::response::Response> {
    state
        .app
        .store
        .get_exchanges()
        .map(|rows| {
            Json(
                rows.iter()
                    .map(|r| ExchangeView {
                        name: r.name.clone(),
                        has_credentials: r.has_credentials,
                        is_active: r.is_active,
                        use_testnet: r.use_testnet,
                        venue_type: r.venue_type.clone(),
                        fingerprint: fingerprint_of(r),
                    })
                    .collect(),
            )
        })
        .map_err(|e| err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Deserialize)]
struct ConnectExchangeRequest {
    name: String,
    api_key: String,
    secret_key: String,
    passphrase: Option<String>,
    use_testnet: bool,
    #[serde(default = "default_venue_type")]
    venue_type: String,
}

fn default_venue_type() -> String {
    "binance".to_string()
}

async fn connect_exchange(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Json(req): Json<ConnectExchangeRequest>,
) -> axum::response::Response {
    if let Err(e) = state.app.store.save_exchange(
        &req.name,
        &req.api_key,
        &req.secret_key,
        req.passphrase.as_deref(),
        req.use_testnet,
        &req.venue_type,
    ) {
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to save credentials: {e}"));
    }

    if state.app.is_running() {
        return Json(CommandResponse::ok("credentials saved; stop the engine before switching the active venue")).into_response();
    }

    let symbols = state.app.config.read().enabled_symbols();
    let adapter = BinanceAdapter::connect(req.api_key, req.secret_key, req.use_testnet, symbols).await;
    let key = if req.use_testnet { format!("{}-testnet", req.name) } else { req.name.clone() };
    state.app.set_exchange(Some(adapter as Arc<dyn Exchange>), Some(key.clone()));

    info!(venue = %key, "exchange connected");
    Json(CommandResponse::ok(format!("connected to {key}"))).into_response()
}

async fn disconnect_exchange(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> axum::response::Response {
    if let Err(e) = state.app.store.delete_exchange(&name) {
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    if state.app.active_venue_key().map(|k| k.starts_with(&name)).unwrap_or(false) {
        state.app.set_exchange(None, None);
    }

    Json(CommandResponse::ok(format!("disconnected {name}"))).into_response()
}

// =============================================================================
// Commands
// =============================================================================

async fn control_launch(_auth: AuthBearer, State(state): State<ApiState>) -> axum::response::Response {
    match state.engine.launch().await {
        Ok(()) => Json(CommandResponse::ok("engine launched")).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn control_pause(_auth: AuthBearer, State(state): State<ApiState>) -> axum::response::Response {
    state.engine.pause();
    Json(CommandResponse::ok("engine paused")).into_response()
}

async fn control_resume(_auth: AuthBearer, State(state): State<ApiState>) -> axum::response::Response {
    state.engine.resume();
    Json(CommandResponse::ok("engine resumed")).into_response()
}

async fn control_stop(_auth: AuthBearer, State(state): State<ApiState>) -> axum::response::Response {
    match state.engine.stop().await {
        Ok(()) => Json(CommandResponse::ok("engine stopped")).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn control_cancel_all(_auth: AuthBearer, State(state): State<ApiState>) -> axum::response::Response {
    let Some(exchange) = state.app.exchange() else {
        return err_response(StatusCode::BAD_REQUEST, "no exchange connected");
    };
    let symbols = state.app.config.read().enabled_symbols();
    let mut failed = Vec::new();
    for symbol in &symbols {
        if let Err(e) = exchange.cancel_all(symbol).await {
            warn!(symbol, error = %e, "cancel-all failed");
            failed.push(symbol.clone());
        }
    }
    if failed.is_empty() {
        Json(CommandResponse::ok("all open orders cancelled")).into_response()
    } else {
        err_response(StatusCode::BAD_GATEWAY, format!("failed for: {}", failed.join(", ")))
    }
}

/// Market-sells every base-asset balance across enabled pairs back to quote,
/// after cancelling resting orders — the manual-liquidation escape hatch.
async fn control_liquidate(_auth: AuthBearer, State(state): State<ApiState>) -> axum::response::Response {
    let Some(exchange) = state.app.exchange() else {
        return err_response(StatusCode::BAD_REQUEST, "no exchange connected");
    };
    let symbols = state.app.config.read().enabled_symbols();

    for symbol in &symbols {
        exchange.cancel_all(symbol).await.ok();
    }

    let balances = match exchange.fetch_balance().await {
        Ok(b) => b,
        Err(e) => return err_response(StatusCode::BAD_GATEWAY, format!("fetch_balance failed: {e}")),
    };

    let mut sold = Vec::new();
    for symbol in &symbols {
        let base = crate::types::base_asset_of(symbol);
        let Some(bal) = balances.iter().find(|b| b.asset == base) else { continue };
        if bal.free <= 0.0 {
            continue;
        }
        let Ok(limits) = exchange.market(symbol).await else { continue };
        let amount = exchange.amount_to_precision(&limits, bal.free);
        if amount < limits.min_amount {
            continue;
        }
        if exchange.place_market(symbol, Side::Sell, amount).await.is_ok() {
            sold.push(symbol.clone());
        }
    }

    Json(CommandResponse::ok(format!("liquidated: {}", sold.join(", ")))).into_response()
}

#[derive(Deserialize)]
struct ClosePositionRequest {
    symbol: String,
    buy_id: i64,
}

/// Cancels resting orders for the symbol and market-sells whatever base
/// quantity `buy_id` represents, closing one grid position by hand.
async fn control_close_position(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Json(req): Json<ClosePositionRequest>,
) -> axum::response::Response {
    let Some(exchange) = state.app.exchange() else {
        return err_response(StatusCode::BAD_REQUEST, "no exchange connected");
    };

    let pair_data = match state.app.store.get_pair_data(&req.symbol) {
        Ok(d) => d,
        Err(e) => return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let amount: f64 = pair_data
        .trades
        .iter()
        .filter(|t| t.buy_id == Some(req.buy_id) && t.side == Side::Buy)
        .map(|t| t.amount)
        .sum();

    if amount <= 0.0 {
        return err_response(StatusCode::NOT_FOUND, format!("no open buy found for id {}", req.buy_id));
    }

    exchange.cancel_all(&req.symbol).await.ok();

    let limits = match exchange.market(&req.symbol).await {
        Ok(l) => l,
        Err(e) => return err_response(StatusCode::BAD_GATEWAY, e.to_string()),
    };
    let amount = exchange.amount_to_precision(&limits, amount);

    match exchange.place_market(&req.symbol, Side::Sell, amount).await {
        Ok(_) => Json(CommandResponse::ok(format!("closed position #{}", req.buy_id))).into_response(),
        Err(e) => err_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn control_snapshot_equity(_auth: AuthBearer, State(state): State<ApiState>) -> axum::response::Response {
    let Some(exchange) = state.app.exchange() else {
        return err_response(StatusCode::BAD_REQUEST, "no exchange connected");
    };
    let Some(key) = state.app.active_venue_key() else {
        return err_response(StatusCode::BAD_REQUEST, "no active venue key");
    };

    match state.engine.calculate_total_equity(&exchange).await {
        Ok(equity) => {
            let _ = state.app.store.log_balance_snapshot(equity, &key);
            Json(CommandResponse::ok(format!("equity snapshot recorded: {equity:.2}"))).into_response()
        }
        Err(e) => err_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum ResetScope {
    Full,
    ChartOnly,
    Pnl,
    PerCoin,
}

#[derive(Deserialize)]
struct ResetStatisticsRequest {
    scope: ResetScope,
    symbol: Option<String>,
}

async fn control_reset_statistics(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Json(req): Json<ResetStatisticsRequest>,
) -> axum::response::Response {
    let result = match req.scope {
        ResetScope::Full => state
            .app
            .store
            .reset_all_statistics()
            .and_then(|_| state.app.store.clear_all_trades_history())
            .and_then(|_| state.app.store.reset_coin_initial_balances()),
        ResetScope::ChartOnly => state.app.store.clear_orders_cache(),
        ResetScope::Pnl => match &req.symbol {
            Some(symbol) => state.app.store.reset_global_pnl_for_symbol(symbol),
            None => state.app.store.reset_global_pnl_history(),
        },
        ResetScope::PerCoin => match &req.symbol {
            Some(symbol) => state
                .app
                .store
                .delete_trades_for_symbol(symbol)
                .and_then(|_| state.app.store.reset_global_pnl_for_symbol(symbol)),
            None => return err_response(StatusCode::BAD_REQUEST, "symbol required for per_coin reset"),
        },
    };

    match result {
        Ok(()) => {
            state.app.increment_version();
            Json(CommandResponse::ok("statistics reset")).into_response()
        }
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
struct AdjustBalanceRequest {
    delta: f64,
    symbol: Option<String>,
}

async fn control_adjust_balance(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    Json(req): Json<AdjustBalanceRequest>,
) -> axum::response::Response {
    let result = match &req.symbol {
        Some(symbol) => state.app.store.adjust_coin_initial_balance(symbol, req.delta),
        None => state.app.store.adjust_balance_history(req.delta),
    };

    match result {
        Ok(()) => Json(CommandResponse::ok("balance ledger adjusted")).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
