// =============================================================================
// gridbot — Main Entry Point
// =============================================================================
//
// Wires together configuration, persistent storage, the exchange adapter (if
// an active venue is already configured), the grid engine's two loops, the
// always-on background scheduler, and the HTTP API. The engine itself starts
// `Stopped` — launching it is always an explicit operator action via the API.
// =============================================================================

mod api;
mod app_state;
mod config;
mod engine;
mod exchange;
mod notifier;
mod pnl;
mod scheduler;
mod store;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::engine::GridEngine;
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::Exchange;
use crate::store::Store;

fn venue_key(name: &str, use_testnet: bool) -> String {
    if use_testnet {
        format!("{name}-testnet")
    } else {
        name.to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("gridbot starting up");

    let config_path = PathBuf::from(std::env::var("GRIDBOT_CONFIG").unwrap_or_else(|_| "config.json".to_string()));
    let config = match AppConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "no usable config on disk, writing defaults");
            let cfg = AppConfig::default();
            if let Err(e) = cfg.save(&config_path) {
                error!(error = %e, "failed to persist default configuration");
            }
            cfg
        }
    };

    let data_dir = std::env::var("GRIDBOT_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let store = Arc::new(Store::open(PathBuf::from(&data_dir).join("gridbot.db"))?);

    let state = Arc::new(AppState::new(config, store.clone(), config_path.clone()));

    match store.get_exchanges() {
        Ok(exchanges) => {
            if let Some(active) = exchanges.into_iter().find(|e| e.is_active && e.has_credentials) {
                match store.get_exchange_credentials(&active.name) {
                    Ok(Some(creds)) => {
                        let symbols = state.config.read().enabled_symbols();
                        let adapter = BinanceAdapter::connect(creds.api_key, creds.secret_key, creds.use_testnet, symbols).await;
                        let key = venue_key(&active.name, creds.use_testnet);
                        state.set_exchange(Some(adapter as Arc<dyn Exchange>), Some(key.clone()));
                        info!(venue = %key, "connected to previously configured exchange");
                    }
                    Ok(None) => warn!(venue = %active.name, "active exchange row has no usable credentials"),
                    Err(e) => error!(error = %e, venue = %active.name, "failed to decrypt stored credentials"),
                }
            } else {
                info!("no active exchange configured yet — connect one via the API before launching");
            }
        }
        Err(e) => error!(error = %e, "failed to read configured exchanges"),
    }

    let engine = Arc::new(GridEngine::new(state.clone()));

    scheduler::spawn(state.clone());
    engine.clone().spawn_reconciliation_loop(config_path);
    engine.clone().spawn_collector_loop();

    let host = std::env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("WEB_PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("{host}:{port}");

    let api_state = state.clone();
    let api_engine = engine.clone();
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state, api_engine);
        let listener = match tokio::net::TcpListener::bind(&bind_addr_clone).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, addr = %bind_addr_clone, "failed to bind HTTP API");
                return;
            }
        };
        info!(addr = %bind_addr_clone, "HTTP API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP API server stopped");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(e) = engine.stop().await {
        error!(error = %e, "error while stopping engine during shutdown");
    }

    info!("gridbot shut down complete");
    Ok(())
}
