pub mod channel;
pub mod clock;
pub mod coordination;
pub mod db;
pub mod error;
pub mod market;
pub mod state;
pub mod store;

#[cfg(test)]
mod testutil;

use channel::{LocalChannel, TabChannel};
use clock::{Clock, SystemClock};
use coordination::tab::{spawn_tab, TabHandle};
use coordination::types::{CoordinatorArgs, CoordinatorConfig, TabId};
use db::{resolve_db_path, SqliteStore};
use error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const DEFAULT_TAB_COUNT: usize = 3;
const MAX_TAB_COUNT: usize = 32;
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

fn parse_tab_count(raw: Option<String>) -> Result<usize, AppError> {
    let Some(raw) = raw.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
    else {
        return Ok(DEFAULT_TAB_COUNT);
    };
    let count = raw.parse::<usize>()?;
    if !(1..=MAX_TAB_COUNT).contains(&count) {
        return Err(AppError::InvalidArgument(format!(
            "ORDERBOOK_TABS must be between 1 and {MAX_TAB_COUNT}"
        )));
    }
    Ok(count)
}

fn parse_flag(raw: Option<String>) -> Option<bool> {
    let raw = raw?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn host_config_from_env() -> Result<(usize, CoordinatorConfig), AppError> {
    let tab_count = parse_tab_count(std::env::var("ORDERBOOK_TABS").ok())?;
    let config = CoordinatorArgs {
        coin: std::env::var("ORDERBOOK_COIN").ok(),
        mock_mode: parse_flag(std::env::var("ORDERBOOK_MOCK").ok()),
        ..CoordinatorArgs::default()
    }
    .normalize()?;
    Ok((tab_count, config))
}

fn log_status(tabs: &[TabHandle]) {
    for tab in tabs {
        let state = tab.state();
        let book = state.book();
        let spread = state.spread();
        info!(
            tab_id = %tab.id(),
            role = %state.role(),
            phase = state.phase().as_str(),
            leader = ?state.known_leader(),
            best_bid = ?book.best_bid().map(|level| level.price),
            best_ask = ?book.best_ask().map(|level| level.price),
            spread = ?spread.map(|spread| spread.value),
            spread_pct = ?spread.map(|spread| spread.percentage),
            upstream_sessions = state.upstream_sessions(),
            "tab status"
        );
    }
}

pub async fn run() -> Result<(), AppError> {
    let (tab_count, config) = host_config_from_env()?;
    let db_path = resolve_db_path()?;
    let store = Arc::new(SqliteStore::open(&db_path).await?);
    info!(
        db = %db_path.display(),
        tabs = tab_count,
        coin = %config.coin,
        mock = config.mock_mode,
        "starting orderbook coordinator"
    );

    let config = Arc::new(config);
    let channel: Arc<dyn TabChannel> = Arc::new(LocalChannel::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tabs: Vec<TabHandle> = (0..tab_count)
        .map(|_| {
            spawn_tab(
                TabId::generate(),
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::clone(&channel),
                Arc::clone(&clock),
            )
        })
        .collect();

    let mut status_ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    status_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for ctrl-c, shutting down");
                }
                break;
            }
            _ = status_ticker.tick() => log_status(&tabs),
        }
    }

    info!("shutting down tabs");
    for tab in tabs {
        tab.shutdown().await;
    }
    Ok(())
}
