// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// fmltc configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Root directory of the filesystem blob store
    pub blob_root: PathBuf,
    /// Base URL that signed blob URLs are built from
    pub blob_base_url: String,
    /// HMAC key for signed blob URLs
    pub blob_signing_key: String,
    /// Redis URL for the runtime config store (in-memory store when unset)
    pub redis_url: Option<String>,
    /// Wall-clock budget of one action invocation
    pub action_time_budget: Duration,
    /// Memory ceiling of one action invocation, in bytes
    pub active_memory_limit_bytes: u64,
    /// Maximum concurrent action invocations
    pub worker_concurrency: usize,
    /// Base URL of the managed training service
    pub training_api_url: String,
    /// Bearer token for the managed training service
    pub training_api_token: Option<String>,
    /// Project the training jobs are submitted under
    pub project_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FMLTC_DATABASE_URL`: SQLite connection string
    /// - `FMLTC_BLOB_SIGNING_KEY`: HMAC key for signed blob URLs
    ///
    /// Optional (with defaults):
    /// - `FMLTC_BLOB_ROOT` (default: `.data/blobs`)
    /// - `FMLTC_BLOB_BASE_URL` (default: `http://localhost:8080/blobs`)
    /// - `FMLTC_REDIS_URL` (default: unset)
    /// - `FMLTC_ACTION_TIME_BUDGET_SECS` (default: 500)
    /// - `FMLTC_ACTIVE_MEMORY_LIMIT_MB` (default: 2000)
    /// - `FMLTC_WORKER_CONCURRENCY` (default: 4)
    /// - `FMLTC_TRAINING_API_URL` (default: `https://ml.googleapis.com/v1`)
    /// - `FMLTC_TRAINING_API_TOKEN` (default: unset)
    /// - `FMLTC_PROJECT_ID` (default: `fmltc`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FMLTC_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FMLTC_DATABASE_URL"))?;

        let blob_signing_key = std::env::var("FMLTC_BLOB_SIGNING_KEY")
            .map_err(|_| ConfigError::Missing("FMLTC_BLOB_SIGNING_KEY"))?;
        if blob_signing_key.is_empty() {
            return Err(ConfigError::Invalid(
                "FMLTC_BLOB_SIGNING_KEY",
                "must not be empty",
            ));
        }

        let blob_root = PathBuf::from(
            std::env::var("FMLTC_BLOB_ROOT").unwrap_or_else(|_| ".data/blobs".to_string()),
        );
        let blob_base_url = std::env::var("FMLTC_BLOB_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080/blobs".to_string());

        let redis_url = std::env::var("FMLTC_REDIS_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let budget_secs: u64 = std::env::var("FMLTC_ACTION_TIME_BUDGET_SECS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FMLTC_ACTION_TIME_BUDGET_SECS",
                    "must be a positive integer",
                )
            })?;

        let memory_limit_mb: u64 = std::env::var("FMLTC_ACTIVE_MEMORY_LIMIT_MB")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FMLTC_ACTIVE_MEMORY_LIMIT_MB", "must be a positive integer")
            })?;

        let worker_concurrency: usize = std::env::var("FMLTC_WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "FMLTC_WORKER_CONCURRENCY",
                "must be a positive integer",
            ))?;

        let training_api_url = std::env::var("FMLTC_TRAINING_API_URL")
            .unwrap_or_else(|_| "https://ml.googleapis.com/v1".to_string());
        let training_api_token = std::env::var("FMLTC_TRAINING_API_TOKEN").ok();
        let project_id =
            std::env::var("FMLTC_PROJECT_ID").unwrap_or_else(|_| "fmltc".to_string());

        Ok(Self {
            database_url,
            blob_root,
            blob_base_url,
            blob_signing_key,
            redis_url,
            action_time_budget: Duration::from_secs(budget_secs),
            active_memory_limit_bytes: memory_limit_mb * 1024 * 1024,
            worker_concurrency,
            training_api_url,
            training_api_token,
            project_id,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
