use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::upload::UploadOptions;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or tunables don't parse.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    pub openai_api_key: String,
    pub port: u16,
    pub rust_log: String,
    /// Redis stream that pipeline events are appended to.
    pub event_stream: String,
    pub recovery: RecoveryConfig,
    pub embedding_model: String,
    pub embedding_dims: usize,
    pub retrieval_top_k: usize,
    pub chunk_max_chars: usize,
    pub upload: UploadOptions,
    /// Directory server-side imports may read from. Imports are refused when unset.
    pub import_root: Option<PathBuf>,
}

/// Tunables for the stuck-video recovery sweep.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
    pub batch_limit: i64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub min_retry_interval_secs: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_limit: 50,
            concurrency: 8,
            max_attempts: crate::pipeline::recovery::MAX_RECOVERY_ATTEMPTS,
            min_retry_interval_secs: crate::pipeline::recovery::MIN_RETRY_INTERVAL_SECS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let defaults = RecoveryConfig::default();
        let upload = UploadOptions::default();

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            openai_api_key: require_env("OPENAI_API_KEY")?,
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            event_stream: std::env::var("EVENT_STREAM")
                .unwrap_or_else(|_| "video-events".to_string()),
            recovery: RecoveryConfig {
                interval_secs: parse_env("RECOVERY_INTERVAL_SECS", defaults.interval_secs)?,
                batch_limit: parse_env("RECOVERY_BATCH_LIMIT", defaults.batch_limit)?,
                concurrency: parse_env("RECOVERY_CONCURRENCY", defaults.concurrency)?,
                max_attempts: parse_env("MAX_RECOVERY_ATTEMPTS", defaults.max_attempts)?,
                min_retry_interval_secs: parse_env(
                    "MIN_RETRY_INTERVAL_SECS",
                    defaults.min_retry_interval_secs,
                )?,
            },
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            embedding_dims: parse_env("EMBEDDING_DIMS", 1536)?,
            retrieval_top_k: parse_env("RETRIEVAL_TOP_K", crate::retrieval::DEFAULT_TOP_K)?,
            chunk_max_chars: parse_env("CHUNK_MAX_CHARS", 1000)?,
            upload: UploadOptions {
                threshold_bytes: parse_env("UPLOAD_THRESHOLD_BYTES", upload.threshold_bytes)?,
                chunk_size_bytes: parse_env("UPLOAD_CHUNK_SIZE_BYTES", upload.chunk_size_bytes)?,
                max_retries: parse_env("UPLOAD_MAX_RETRIES", upload.max_retries)?,
                base_delay: upload.base_delay,
            },
            import_root: std::env::var("IMPORT_ROOT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Defaults with placeholder credentials, for handler tests.
    pub fn for_tests() -> Self {
        Config {
            database_url: "postgres://localhost/vidchat_test".to_string(),
            redis_url: "redis://localhost".to_string(),
            s3_bucket: "vidchat-test".to_string(),
            s3_endpoint: "http://localhost:9000".to_string(),
            aws_access_key_id: "test".to_string(),
            aws_secret_access_key: "test".to_string(),
            anthropic_api_key: "test".to_string(),
            openai_api_key: "test".to_string(),
            port: 8080,
            rust_log: "info".to_string(),
            event_stream: "video-events".to_string(),
            recovery: RecoveryConfig::default(),
            embedding_model: "fake-embedder".to_string(),
            embedding_dims: 2,
            retrieval_top_k: crate::retrieval::DEFAULT_TOP_K,
            chunk_max_chars: 1000,
            upload: UploadOptions::default(),
            import_root: Some(std::env::temp_dir()),
        }
    }
}
