//! Environment-driven configuration
//!
//! Values are read once at startup. A `.env` file is honoured when present.
//! Unparsable values fall back to their defaults; structural problems are
//! reported by [`Config::validate`].

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::ImageFormat;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Postgres connection string. Without it jobs and the queue live in memory.
    pub database_url: Option<String>,
    pub db_max_connections: u32,

    pub storage_root: PathBuf,
    pub max_file_size: u64,
    pub file_ttl: Duration,
    pub orphan_grace_period: Duration,
    pub supported_formats: Vec<ImageFormat>,

    pub job_retention: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_page_size: usize,

    pub max_retries: i32,
    pub worker_concurrency: usize,
    pub vision_service_url: String,
    pub vision_timeout: Duration,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,

    pub publish_attempts: u32,
    pub publish_backoff_base: Duration,
    pub visibility_timeout: Duration,
    pub health_check_interval: Duration,
    pub republish_interval: Duration,

    pub log_format: String,
}

/// Headroom the queue lease must keep over the slowest allowed analysis.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

fn millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_or(key, default))
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
        const FILE_TTL_SECS: u64 = 86_400;
        const JOB_RETENTION_SECS: u64 = 7 * 86_400;
        const ORPHAN_GRACE_PERIOD_SECS: u64 = 900;
        const CLEANUP_INTERVAL_SECS: u64 = 3600;
        const CLEANUP_PAGE_SIZE: usize = 500;
        const MAX_RETRIES: i32 = 3;
        const WORKER_CONCURRENCY: usize = 4;
        const VISION_TIMEOUT_SECS: u64 = 120;
        const RETRY_BACKOFF_BASE_MS: u64 = 1000;
        const RETRY_BACKOFF_MAX_MS: u64 = 16_000;
        const PUBLISH_ATTEMPTS: u32 = 3;
        const PUBLISH_BACKOFF_BASE_MS: u64 = 100;
        const VISIBILITY_TIMEOUT_SECS: u64 = 300;
        const HEALTH_CHECK_INTERVAL_SECS: u64 = 10;
        const REPUBLISH_INTERVAL_SECS: u64 = 5;

        let server_port = env::var("SERVER_PORT")
            .or_else(|_| env::var("PORT"))
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("SERVER_PORT must be a valid number"))?;

        let supported_formats = env::var("SUPPORTED_FORMATS")
            .unwrap_or_else(|_| "jpeg,png,webp,bmp,gif".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<ImageFormat>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port,
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            storage_root: env::var("STORAGE_ROOT")
                .unwrap_or_else(|_| "/tmp/vision_uploads".to_string())
                .into(),
            max_file_size: env_or("MAX_FILE_SIZE", MAX_FILE_SIZE),
            file_ttl: secs("FILE_TTL", FILE_TTL_SECS),
            orphan_grace_period: secs("ORPHAN_GRACE_PERIOD", ORPHAN_GRACE_PERIOD_SECS),
            supported_formats,
            job_retention: secs("JOB_RETENTION", JOB_RETENTION_SECS),
            cleanup_interval: secs("CLEANUP_INTERVAL", CLEANUP_INTERVAL_SECS),
            cleanup_page_size: env_or("CLEANUP_PAGE_SIZE", CLEANUP_PAGE_SIZE),
            max_retries: env_or("MAX_RETRIES", MAX_RETRIES),
            worker_concurrency: env_or("WORKER_CONCURRENCY", WORKER_CONCURRENCY),
            vision_service_url: env::var("VISION_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:2001".to_string()),
            vision_timeout: secs("VISION_TIMEOUT", VISION_TIMEOUT_SECS),
            retry_backoff_base: millis("RETRY_BACKOFF_BASE_MS", RETRY_BACKOFF_BASE_MS),
            retry_backoff_max: millis("RETRY_BACKOFF_MAX_MS", RETRY_BACKOFF_MAX_MS),
            publish_attempts: env_or("PUBLISH_ATTEMPTS", PUBLISH_ATTEMPTS),
            publish_backoff_base: millis("PUBLISH_BACKOFF_BASE_MS", PUBLISH_BACKOFF_BASE_MS),
            visibility_timeout: secs("VISIBILITY_TIMEOUT", VISIBILITY_TIMEOUT_SECS),
            health_check_interval: secs("HEALTH_CHECK_INTERVAL", HEALTH_CHECK_INTERVAL_SECS),
            republish_interval: secs("REPUBLISH_INTERVAL", REPUBLISH_INTERVAL_SECS),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_file_size == 0 {
            return Err(anyhow::anyhow!("MAX_FILE_SIZE must be greater than zero"));
        }
        if self.max_retries < 1 {
            return Err(anyhow::anyhow!("MAX_RETRIES must be at least 1"));
        }
        if self.worker_concurrency == 0 {
            return Err(anyhow::anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }
        if self.cleanup_page_size == 0 {
            return Err(anyhow::anyhow!("CLEANUP_PAGE_SIZE must be at least 1"));
        }
        if self.job_retention < self.file_ttl {
            return Err(anyhow::anyhow!(
                "JOB_RETENTION ({}s) must not be shorter than FILE_TTL ({}s)",
                self.job_retention.as_secs(),
                self.file_ttl.as_secs()
            ));
        }
        if self.visibility_timeout < self.vision_timeout + LEASE_MARGIN {
            return Err(anyhow::anyhow!(
                "VISIBILITY_TIMEOUT ({}s) must exceed VISION_TIMEOUT ({}s) by at least {}s",
                self.visibility_timeout.as_secs(),
                self.vision_timeout.as_secs(),
                LEASE_MARGIN.as_secs()
            ));
        }
        if self.supported_formats.is_empty() {
            return Err(anyhow::anyhow!("SUPPORTED_FORMATS must list at least one format"));
        }
        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }
        if !self.vision_service_url.starts_with("http://")
            && !self.vision_service_url.starts_with("https://")
        {
            return Err(anyhow::anyhow!("VISION_SERVICE_URL must be an http(s) URL"));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
