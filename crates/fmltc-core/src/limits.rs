// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime-tunable limits.

use tracing::warn;

use crate::config_store::ConfigStore;
use crate::error::Result;

/// Ceilings and sizes read by the prepare functions and handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Longest accepted video, in seconds.
    pub max_video_length_secs: u32,
    /// Most frames accepted per video.
    pub max_frames_per_video: u32,
    /// Widest accepted video, in pixels.
    pub max_video_width: u32,
    /// Tallest accepted video, in pixels.
    pub max_video_height: u32,
    /// Largest accepted upload, in bytes.
    pub max_video_size_bytes: u64,
    /// Frames per TFRecord shard.
    pub max_frames_per_record: u32,
    /// Files per dataset zip partition.
    pub max_files_per_zip_partition: u32,
    /// Training minutes granted to a new team.
    pub default_training_minutes: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_video_length_secs: 120,
            max_frames_per_video: 5000,
            max_video_width: 3840,
            max_video_height: 2160,
            max_video_size_bytes: 100 * 1000 * 1000,
            max_frames_per_record: 50,
            max_files_per_zip_partition: 10,
            default_training_minutes: 60,
        }
    }
}

impl Limits {
    /// Load limits, applying any overrides found in the config store.
    ///
    /// Unparseable overrides are logged and ignored.
    pub async fn load(store: &dyn ConfigStore) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_video_length_secs: read(store, "max_video_length_secs", defaults.max_video_length_secs)
                .await?,
            max_frames_per_video: read(store, "max_frames_per_video", defaults.max_frames_per_video)
                .await?,
            max_video_width: read(store, "max_video_width", defaults.max_video_width).await?,
            max_video_height: read(store, "max_video_height", defaults.max_video_height).await?,
            max_video_size_bytes: read(store, "max_video_size_bytes", defaults.max_video_size_bytes)
                .await?,
            max_frames_per_record: read(
                store,
                "max_frames_per_record",
                defaults.max_frames_per_record,
            )
            .await?
            .max(1),
            max_files_per_zip_partition: read(
                store,
                "max_files_per_zip_partition",
                defaults.max_files_per_zip_partition,
            )
            .await?
            .max(1),
            default_training_minutes: read(
                store,
                "default_training_minutes",
                defaults.default_training_minutes,
            )
            .await?,
        })
    }
}

async fn read<T>(store: &dyn ConfigStore, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
{
    match store.get(key).await? {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(key = %key, value = %raw, "Ignoring unparseable limit override");
                Ok(default)
            }
        },
        None => Ok(default),
    }
}
