// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boundary operations.
//!
//! These run inside a request: they validate input, write the entity rows a
//! long-running action needs and trigger that action. Invalid input is
//! reported as [`CoreError::Validation`](fmltc_core::CoreError::Validation)
//! before anything is written.

pub mod datasets;
pub mod teams;
pub mod tracking;
pub mod training;
pub mod videos;

pub use datasets::{
    ZipPartitionStatus, dataset_zip_status, delete_dataset, prepare_dataset, prepare_dataset_zip,
};
pub use teams::{
    get_or_create_team, increment_remaining_training_minutes, reset_remaining_training_minutes,
};
pub use tracking::{continue_tracking, prepare_to_start_tracking, stop_tracking};
pub use training::{TrainingRequest, cancel_training, delete_model, start_training};
pub use videos::{
    VideoUpload, delete_video, prepare_video_upload, set_frame_included, start_frame_extraction,
    store_frame_bboxes,
};

use chrono::{DateTime, TimeDelta, Utc};

use crate::services::ActionServices;

/// Expiry of a signed URL issued now.
pub(crate) fn signed_url_expiry(services: &ActionServices) -> DateTime<Utc> {
    services.clock.now()
        + TimeDelta::from_std(services.settings.signed_url_ttl).unwrap_or(TimeDelta::hours(1))
}
