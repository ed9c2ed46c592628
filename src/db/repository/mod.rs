pub mod analytics;
pub mod delivery_ledger;
pub mod delivery_queue;
pub mod notice;
pub mod user;

pub use analytics::NoticeAnalyticsRepository;
pub use delivery_ledger::DeliveryLedgerRepository;
pub use delivery_queue::DeliveryQueueRepository;
pub use notice::NoticeRepository;
pub use user::UserRepository;

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Attempts made for a single ledger write before giving up.
const BUSY_RETRY_ATTEMPTS: u32 = 4;

/// SQLITE_BUSY / SQLITE_LOCKED, including their extended codes.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|c| c.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

/// Run a single-statement write, retrying while the store reports contention.
///
/// Each statement is an atomic upsert, so re-running it after a busy error
/// cannot double-apply. Only when every attempt is rejected does the caller
/// see `ConcurrencyConflict`.
pub(crate) async fn retry_on_busy<T, F, Fut>(what: &str, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempt < BUSY_RETRY_ATTEMPTS => {
                tracing::debug!("{} hit a busy store (attempt {}), retrying", what, attempt);
                tokio::time::sleep(Duration::from_millis(10 * 2u64.pow(attempt))).await;
            }
            Err(e) if is_busy(&e) => {
                return Err(AppError::ConcurrencyConflict(format!("{}: {}", what, e)));
            }
            Err(e) => return Err(AppError::Database(e)),
        }
    }
}
