// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fmltc-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use fmltc_core::blob::{BlobStore, FsBlobStore};
use fmltc_core::persistence::SqlitePersistence;

/// File-backed store and blob root inside one temp directory.
pub struct TestContext {
    pub store: Arc<SqlitePersistence>,
    pub blobs: Arc<dyn BlobStore>,
    pub database_url: String,
    pub temp_dir: tempfile::TempDir,
}

impl TestContext {
    pub async fn new() -> Result<Self, String> {
        let temp_dir =
            tempfile::TempDir::new().map_err(|e| format!("Failed to create temp dir: {}", e))?;
        let database_url = format!("sqlite:{}", temp_dir.path().join("db/fmltc.db").display());
        let store = SqlitePersistence::connect(&database_url)
            .await
            .map_err(|e| format!("Failed to connect: {}", e))?;
        let blobs = FsBlobStore::new(temp_dir.path().join("blobs"), "http://test/blobs", "k");

        Ok(Self {
            store: Arc::new(store),
            blobs: Arc::new(blobs),
            database_url,
            temp_dir,
        })
    }
}
