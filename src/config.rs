use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub delivery_retry: DeliveryRetryConfig,
    pub push: PushConfig,
    pub segmentation: SegmentationConfig,
    pub tracking: TrackingConfig,
    pub sweep: SweepConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// HS256 secret shared with the platform's authentication service.
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for client notice endpoints
    pub events_per_second: u32,
    /// Burst size for client notice endpoints
    pub events_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryRetryConfig {
    /// Whether the push delivery worker is enabled.
    pub enabled: bool,
    /// Backoff before the first retry; attempt `n` waits `base * 2^(n-1)`.
    pub base_backoff_seconds: u64,
    /// Cap for exponential backoff (seconds).
    pub max_backoff_seconds: u64,
    /// Attempts allowed before an entry becomes `exhausted`.
    pub max_attempts: u32,
    /// How often (seconds) the worker polls for due entries.
    pub poll_interval_seconds: u64,
    /// Maximum entries claimed and delivered concurrently per poll.
    pub worker_concurrency: u32,
    /// How long a claimed entry stays invisible to other workers.
    pub lease_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// External push gateway. When unset, pushes are only logged.
    pub webhook_url: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationConfig {
    pub cache_ttl_seconds: u64,
    pub cache_capacity: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Views closer than this to the last counted view are the same logical event.
    pub view_dedup_seconds: i64,
    /// Offset from UTC used to evaluate display-time windows.
    pub display_utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// `pretty` (default) or `json`
    pub format: String,
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL").unwrap_or(defaults.server.frontend_url),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            rate_limit: RateLimitConfig {
                events_per_second: env_or("RATE_LIMIT_EVENTS_PER_SECOND", 10),
                events_burst: env_or("RATE_LIMIT_EVENTS_BURST", 50),
            },
            delivery_retry: DeliveryRetryConfig {
                enabled: env_flag("DELIVERY_RETRY_ENABLED", true),
                base_backoff_seconds: env_or("DELIVERY_RETRY_BASE_BACKOFF_SECONDS", 30u64),
                max_backoff_seconds: env_or("DELIVERY_RETRY_MAX_BACKOFF_SECONDS", 3600u64),
                max_attempts: env_or("DELIVERY_RETRY_MAX_ATTEMPTS", 3u32),
                poll_interval_seconds: env_or("DELIVERY_RETRY_POLL_INTERVAL_SECONDS", 5u64),
                worker_concurrency: env_or("DELIVERY_RETRY_WORKER_CONCURRENCY", 10u32),
                lease_seconds: env_or("DELIVERY_RETRY_LEASE_SECONDS", 60u64),
            },
            push: PushConfig {
                webhook_url: env::var("PUSH_WEBHOOK_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                timeout_seconds: env_or("PUSH_TIMEOUT_SECONDS", 10u64),
            },
            segmentation: SegmentationConfig {
                cache_ttl_seconds: env_or("SEGMENT_CACHE_TTL_SECONDS", 300u64),
                cache_capacity: env_or("SEGMENT_CACHE_CAPACITY", 1000u64),
            },
            tracking: TrackingConfig {
                view_dedup_seconds: env_or("VIEW_DEDUP_SECONDS", 5i64),
                display_utc_offset_minutes: env_or("DISPLAY_UTC_OFFSET_MINUTES", -180i32),
            },
            sweep: SweepConfig {
                enabled: env_flag("SWEEP_ENABLED", true),
                interval_seconds: env_or("SWEEP_INTERVAL_SECONDS", 60u64),
            },
            log: LogConfig {
                format: env::var("LOG_FORMAT").unwrap_or(defaults.log.format),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/notices.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            rate_limit: RateLimitConfig {
                events_per_second: 10,
                events_burst: 50,
            },
            delivery_retry: DeliveryRetryConfig {
                enabled: true,
                base_backoff_seconds: 30,
                max_backoff_seconds: 3600,
                max_attempts: 3,
                poll_interval_seconds: 5,
                worker_concurrency: 10,
                lease_seconds: 60,
            },
            push: PushConfig {
                webhook_url: None,
                timeout_seconds: 10,
            },
            segmentation: SegmentationConfig {
                cache_ttl_seconds: 300,
                cache_capacity: 1000,
            },
            tracking: TrackingConfig {
                view_dedup_seconds: 5,
                display_utc_offset_minutes: -180,
            },
            sweep: SweepConfig {
                enabled: true,
                interval_seconds: 60,
            },
            log: LogConfig {
                format: "pretty".to_string(),
            },
        }
    }
}
