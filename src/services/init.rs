//! Initialization helpers for the application:
//! - database connection + migrations
//! - background worker spawn helpers

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::config::Config;
use crate::services::analytics::AnalyticsAggregator;
use crate::services::scheduler::DeliveryScheduler;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Query parameters and userinfo are dropped. Falls back to removing
/// everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = db_url.find('@') {
            let without_creds = &db_url[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Open the SQLite pool (WAL, busy timeout) and run migrations.
pub async fn init_db(config: &Config) -> Result<sqlx::SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Spawn background workers:
/// - lifecycle sweep, push materialization and analytics refresh
/// - push delivery queue worker
///
/// Each worker listens for a shutdown notification via the broadcast sender.
pub fn spawn_background_workers(
    state: Arc<crate::AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Sweep worker
    if state.config.sweep.enabled {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let scheduler = DeliveryScheduler::new(&state);
            let aggregator = AnalyticsAggregator::new(&state);
            let interval = Duration::from_secs(state.config.sweep.interval_seconds.max(1));

            loop {
                let now = Utc::now().naive_utc();
                match scheduler.sweep(now).await {
                    Ok(report) => tracing::debug!("Sweep finished: {:?}", report),
                    Err(e) => tracing::warn!("Lifecycle sweep failed: {:?}", e),
                }
                if let Err(e) = aggregator.refresh_stale(now).await {
                    tracing::warn!("Analytics refresh failed: {:?}", e);
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Sweep worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    } else {
        tracing::info!("Lifecycle sweep disabled");
    }

    // Push delivery worker
    if state.config.delivery_retry.enabled {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let scheduler = DeliveryScheduler::new(&state);
            let poll = Duration::from_secs(state.config.delivery_retry.poll_interval_seconds.max(1));

            loop {
                if shutdown_rx.try_recv().is_ok() {
                    tracing::info!("Push delivery worker received shutdown signal");
                    break;
                }

                let busy = match scheduler.process_due(Utc::now().naive_utc()).await {
                    Ok(report) => report.claimed > 0,
                    Err(e) => {
                        tracing::warn!("Failed to process due push deliveries: {:?}", e);
                        false
                    }
                };

                // drain a backlog without waiting a full poll interval
                if busy {
                    continue;
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Push delivery worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }));
    } else {
        tracing::info!("Push delivery worker disabled");
    }

    handles
}
