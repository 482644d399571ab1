// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared collaborators of prepare functions and handlers.

use std::sync::Arc;
use std::time::Duration;

use fmltc_core::blob::BlobStore;
use fmltc_core::clock::Clock;
use fmltc_core::config_store::ConfigStore;
use fmltc_core::limits::Limits;
use fmltc_core::persistence::Persistence;
use fmltc_core::queue::ActionQueue;
use fmltc_core::Config;
use fmltc_media::video::VideoOpener;

use crate::resumption::MemoryProbe;
use crate::training::TrainingJobService;

/// Per-invocation budgets.
#[derive(Debug, Clone)]
pub struct ActionSettings {
    /// Wall-clock budget of one invocation.
    pub time_budget: Duration,
    /// Memory ceiling of one invocation.
    pub active_memory_limit_bytes: u64,
    /// Lifetime of signed upload and download URLs.
    pub signed_url_ttl: Duration,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(500),
            active_memory_limit_bytes: 2000 * 1024 * 1024,
            signed_url_ttl: Duration::from_secs(3600),
        }
    }
}

impl ActionSettings {
    /// Budgets from the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            time_budget: config.action_time_budget,
            active_memory_limit_bytes: config.active_memory_limit_bytes,
            ..Self::default()
        }
    }
}

/// Everything a prepare function or handler talks to.
#[derive(Clone)]
pub struct ActionServices {
    /// Entity store.
    pub store: Arc<dyn Persistence>,
    /// Blob store.
    pub blobs: Arc<dyn BlobStore>,
    /// Queue the trigger writes to.
    pub queue: Arc<dyn ActionQueue>,
    /// Runtime-tunable settings.
    pub config_store: Arc<dyn ConfigStore>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Training job service.
    pub training: Arc<dyn TrainingJobService>,
    /// Video decoder.
    pub video_opener: Arc<dyn VideoOpener>,
    /// Process memory probe.
    pub memory: Arc<dyn MemoryProbe>,
    /// Invocation budgets.
    pub settings: ActionSettings,
}

impl ActionServices {
    /// Current limits from the config store.
    pub async fn limits(&self) -> fmltc_core::Result<Limits> {
        Limits::load(self.config_store.as_ref()).await
    }
}
