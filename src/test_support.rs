//! Fixtures shared by unit tests across modules.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use chrono::{NaiveDate, NaiveDateTime, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{
    CallToAction, DisplayFormat, DisplayWindow, Notice, NoticeKind, NoticeRepository,
    NoticeStatus, SegmentationCriteria, Targeting, UpsertUserProfile, UserRepository, UserRole,
};
use crate::error::{AppError, AppResult};
use crate::services::auth::Claims;
use crate::services::push::{PushGateway, PushMessage};
use crate::services::segmentation::SegmentationEngine;
use crate::AppState;

pub const TEST_JWT_SECRET: &str = "test-secret";

/// `2026-03-<day> <hour>:00:00`. March 2nd 2026 is a Monday.
pub fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

/// Migrated in-memory database. A single connection keeps every query on
/// the same memory store.
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Migrated database file under the temp dir, opened the way `init_db`
/// opens production stores (WAL, busy timeout) with several connections, so
/// concurrent writers really contend. Files are removed on drop.
pub struct FileDb {
    pub pool: SqlitePool,
    path: PathBuf,
}

impl FileDb {
    pub async fn new() -> Self {
        let path = std::env::temp_dir().join(format!("notice-engine-{}.db", Uuid::new_v4()));
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Self { pool, path }
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

pub fn test_state(pool: SqlitePool, push: Arc<RecordingPushGateway>) -> Arc<AppState> {
    let mut config = Config::default();
    config.jwt.secret = TEST_JWT_SECRET.to_string();
    Arc::new(AppState {
        db: pool,
        segmentation: SegmentationEngine::new(&config.segmentation),
        push,
        config,
    })
}

/// A live, untargeted informational banner published on March 1st.
pub fn notice_fixture(id: &str) -> Notice {
    Notice {
        id: id.to_string(),
        kind: NoticeKind::Informational,
        display_format: DisplayFormat::Banner,
        title: format!("Notice {}", id),
        body: "Body".to_string(),
        cta: Some(CallToAction {
            label: "Open".to_string(),
            url: "https://example.com/open".to_string(),
        }),
        secondary_cta: None,
        targeting: Targeting::All,
        criteria: SegmentationCriteria::default(),
        publish_at: Some(at(1, 0)),
        expire_at: None,
        display_window: DisplayWindow::Anytime,
        dismissible: true,
        reappears_after_dismiss: false,
        reappearance_interval_seconds: None,
        max_exhibitions: None,
        priority: 0,
        push_enabled: false,
        status: NoticeStatus::Active,
        withdrawn: false,
        withdrawn_at: None,
        targeting_version: 1,
        created_by: "admin".to_string(),
        created_at: at(1, 0),
        updated_at: at(1, 0),
    }
}

pub async fn insert_notice(pool: &SqlitePool, notice: &Notice) {
    NoticeRepository::insert(pool, notice).await.unwrap();
}

/// Active user who last accessed the platform on March 1st at noon.
pub async fn seed_user(
    pool: &SqlitePool,
    id: &str,
    role: UserRole,
    accuracy_rate: f64,
    solved_count: i64,
    plan_ids: &[&str],
) {
    let profile = UpsertUserProfile {
        role,
        is_active: true,
        last_access_at: Some(at(1, 12)),
        accuracy_rate,
        solved_count,
        plan_ids: plan_ids
            .iter()
            .map(|p| p.to_string())
            .collect::<BTreeSet<_>>(),
    };
    UserRepository::upsert_profile(pool, id, profile, at(1, 12))
        .await
        .unwrap();
}

pub fn issue_token(secret: &str, sub: &str, role: UserRole) -> String {
    let now = Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: sub.to_string(),
        role,
        exp: now + 3600,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

/// Push gateway that records every attempt and fails on demand.
pub struct RecordingPushGateway {
    failing: AtomicBool,
    sent: Mutex<Vec<PushMessage>>,
}

impl RecordingPushGateway {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        let gateway = Self::ok();
        gateway.set_failing(true);
        gateway
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every push attempted so far, failed ones included.
    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PushGateway for RecordingPushGateway {
    async fn push(&self, message: &PushMessage) -> AppResult<()> {
        self.sent.lock().unwrap().push(message.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable(
                "push gateway unavailable".to_string(),
            ));
        }
        Ok(())
    }
}
