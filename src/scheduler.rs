// =============================================================================
// Background Snapshot Scheduler (spec §4.5)
// =============================================================================
//
// Runs regardless of engine state (even `Stopped`/`Paused`) so balance charts
// for configured-but-inactive venues keep advancing. Shares the 60s/180s
// cadences with the engine's own collector loop but coordinates through
// `AppState::active_venue_key` to avoid double-writing the venue the engine
// already owns: this task always defers the 60s path for that venue to the
// collector (spec §4.5 "must not double-write").
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::app_state::AppState;
use crate::exchange::binance::BinanceAdapter;
use crate::store::ExchangeInfo;

const TICK: Duration = Duration::from_secs(60);
const INACTIVE_VENUE_INTERVAL: Duration = Duration::from_secs(180);

pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { run(state).await })
}

async fn run(state: Arc<AppState>) {
    let mut last_tick = Instant::now() - INACTIVE_VENUE_INTERVAL;
    loop {
        tokio::time::sleep(TICK).await;
        if last_tick.elapsed() < INACTIVE_VENUE_INTERVAL {
            continue;
        }
        snapshot_inactive_venues(&state).await;
        last_tick = Instant::now();
    }
}

/// For every configured venue that is not the engine's own active venue
/// (or the engine isn't running), sample equity via stored credentials and
/// the adapter's static helper. On failure, carries the last snapshot
/// forward unchanged so charts stay continuous.
pub async fn snapshot_inactive_venues(state: &AppState) {
    let venues: Vec<ExchangeInfo> = match state.store.get_exchanges() {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "scheduler: get_exchanges failed");
            return;
        }
    };

    let active_key = if state.is_running() { state.active_venue_key() } else { None };

    for venue in venues {
        let venue_key = if venue.use_testnet {
            format!("{}-testnet", venue.name)
        } else {
            venue.name.clone()
        };

        if Some(&venue_key) == active_key.as_ref() {
            continue;
        }

        if !venue.has_credentials {
            continue;
        }

        let creds = match state.store.get_exchange_credentials(&venue.name) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(e) => {
                warn!(venue = %venue.name, error = %e, "scheduler: credential decrypt failed");
                continue;
            }
        };

        match BinanceAdapter::snapshot_equity(&creds.api_key, &creds.secret_key, creds.use_testnet).await {
            Ok(equity) if equity > 0.0 => {
                if let Err(e) = state.store.log_balance_snapshot(equity, &venue_key) {
                    warn!(venue = %venue_key, error = %e, "scheduler: log_balance_snapshot failed");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(venue = %venue_key, error = %e, "scheduler: snapshot fetch failed, carrying forward last value");
            }
        }
    }
}
