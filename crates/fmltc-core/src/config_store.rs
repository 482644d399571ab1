// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime-tunable settings.
//!
//! Limits and admin defaults can be overridden at runtime without a restart.
//! The backend is chosen at startup: [`MemoryConfigStore`] for single-process
//! deployments and tests, [`RedisConfigStore`] when several workers share one
//! set of overrides.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Key/value settings store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a setting. Served from the local view; call [`refresh`] to pick up
    /// changes made by other processes.
    ///
    /// [`refresh`]: ConfigStore::refresh
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a setting.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Reload the local view from the backing store.
    async fn refresh(&self) -> Result<()>;
}

/// In-process settings store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis hash holding all overrides.
const REDIS_HASH_KEY: &str = "fmltc:config";

/// Settings shared through a Redis hash, cached locally.
pub struct RedisConfigStore {
    conn: ConnectionManager,
    cache: RwLock<HashMap<String, String>>,
}

impl RedisConfigStore {
    /// Connect to Redis and load the current overrides.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_error)?;
        let store = Self {
            conn,
            cache: RwLock::new(HashMap::new()),
        };
        store.refresh().await?;
        info!(url = %url, "Connected Redis config store");
        Ok(store)
    }
}

fn redis_error(err: redis::RedisError) -> CoreError {
    CoreError::External {
        service: "redis",
        details: err.to_string(),
    }
}

#[async_trait]
impl ConfigStore for RedisConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Ok(cache.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(REDIS_HASH_KEY, key, value)
            .await
            .map_err(redis_error)?;
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let values: HashMap<String, String> =
            conn.hgetall(REDIS_HASH_KEY).await.map_err(redis_error)?;
        debug!(count = values.len(), "Refreshed config overrides");
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = values;
        Ok(())
    }
}
