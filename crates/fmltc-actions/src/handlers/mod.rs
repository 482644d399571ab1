// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-running action handlers.
//!
//! Each handler is a loop over units of work that persists its progress in
//! the owning entity after every unit and then checkpoints through the
//! [`Invocation`]. A handler returning [`Checkpoint::Suspend`] has already
//! scheduled its successor.

pub mod admin;
pub mod dataset_producer;
pub mod dataset_zipper;
pub mod deletion;
pub mod frame_extraction;
pub mod tracking;
pub mod training_monitor;

use crate::action::ActionKind;
use crate::error::Result;
use crate::resumption::{Checkpoint, Invocation};

/// Run the handler for the invocation's action kind.
pub async fn run(inv: &mut Invocation<'_>) -> Result<Checkpoint> {
    match inv.params().kind.clone() {
        ActionKind::ExtractFrames { video_id } => {
            frame_extraction::extract_frames(inv, &video_id).await
        }
        ActionKind::DatasetProduce { dataset_id } => {
            dataset_producer::produce_dataset(inv, &dataset_id).await
        }
        ActionKind::DatasetProduceRecord {
            dataset_id,
            record_number,
            is_eval,
            frames,
        } => {
            dataset_producer::produce_record(inv, &dataset_id, record_number, is_eval, &frames)
                .await
        }
        ActionKind::DatasetZip {
            dataset_zip_id,
            partition_index,
        } => dataset_zipper::zip_partition(inv, &dataset_zip_id, partition_index).await,
        ActionKind::MonitorTraining { model_id } => {
            training_monitor::monitor_training(inv, &model_id).await
        }
        ActionKind::Tracking { tracker_id } => tracking::track(inv, &tracker_id).await,
        ActionKind::DeleteVideo { video_id } => deletion::delete_video(inv, &video_id).await,
        ActionKind::DeleteDataset { dataset_id } => {
            deletion::delete_dataset(inv, &dataset_id).await
        }
        ActionKind::DeleteModel { model_id } => deletion::delete_model(inv, &model_id).await,
        ActionKind::ResetRemainingTrainingMinutes { minutes } => {
            admin::reset_remaining_training_minutes(inv, minutes).await
        }
        ActionKind::IncrementRemainingTrainingMinutes { delta } => {
            admin::increment_remaining_training_minutes(inv, delta).await
        }
    }
}
