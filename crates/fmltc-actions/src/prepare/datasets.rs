// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Datasets and their zip exports.

use fmltc_core::blob::SignedMethod;
use fmltc_core::persistence::{Dataset, DatasetZip, DatasetZipPartition, NewDataset};
use sqlx::types::Json;
use tracing::info;
use uuid::Uuid;

use crate::action::{ActionKind, create_action_parameters};
use crate::blob_names::zip_blob;
use crate::error::{ActionError, Result};
use crate::prepare::signed_url_expiry;
use crate::services::ActionServices;
use crate::trigger::{TriggerOutcome, trigger_via_queue};

/// Create a dataset from the included frames of `video_ids` and trigger
/// its production.
pub async fn prepare_dataset(
    services: &ActionServices,
    team_id: &str,
    description: &str,
    video_ids: &[String],
    eval_percent: f64,
) -> Result<(Dataset, TriggerOutcome)> {
    if description.trim().is_empty() {
        return Err(ActionError::validation("description", "must not be empty"));
    }
    if !(0.0..=100.0).contains(&eval_percent) {
        return Err(ActionError::validation(
            "eval_percent",
            format!("{eval_percent} is not between 0 and 100"),
        ));
    }
    if video_ids.is_empty() {
        return Err(ActionError::validation("video_ids", "select at least one video"));
    }
    for video_id in video_ids {
        let video = services.store.get_video(team_id, video_id).await?;
        if video.delete_in_progress || !video.frame_extraction_done() || video.frame_extraction_failed
        {
            return Err(ActionError::validation(
                "video_ids",
                format!("video {video_id} has no extracted frames"),
            ));
        }
    }
    let frames = services.store.included_frames(team_id, video_ids).await?;
    if frames.len() < 2 {
        return Err(ActionError::validation(
            "video_ids",
            format!("a dataset needs at least 2 included frames, found {}", frames.len()),
        ));
    }

    let dataset = services
        .store
        .create_dataset(
            &NewDataset {
                dataset_id: Uuid::new_v4().to_string(),
                team_id: team_id.to_string(),
                description: description.to_string(),
                video_ids: video_ids.to_vec(),
                eval_percent,
            },
            services.clock.now(),
        )
        .await?;
    let params = create_action_parameters(
        team_id,
        ActionKind::DatasetProduce {
            dataset_id: dataset.dataset_id.clone(),
        },
    );
    let outcome = trigger_via_queue(services, &params).await?;
    info!(
        team_id,
        dataset_id = %dataset.dataset_id,
        frames = frames.len(),
        eval_percent,
        "Dataset prepared"
    );
    Ok((dataset, outcome))
}

/// Plan a zip export of a completed dataset and trigger one action per
/// partition. The label map goes first, so it lands in partition 0.
pub async fn prepare_dataset_zip(
    services: &ActionServices,
    team_id: &str,
    dataset_id: &str,
) -> Result<DatasetZip> {
    let dataset = services.store.get_dataset(team_id, dataset_id).await?;
    if dataset.delete_in_progress || !dataset.dataset_completed {
        return Err(ActionError::validation(
            "dataset_id",
            "only completed datasets can be downloaded",
        ));
    }

    let mut files: Vec<String> = dataset.label_map_blob_name.iter().cloned().collect();
    files.extend(
        services
            .store
            .list_dataset_records(dataset_id)
            .await?
            .into_iter()
            .map(|r| r.tf_record_blob_name),
    );
    let limits = services.limits().await?;
    let per_partition = (limits.max_files_per_zip_partition as usize).max(1);

    let dataset_zip_id = Uuid::new_v4().to_string();
    let partitions: Vec<DatasetZipPartition> = files
        .chunks(per_partition)
        .enumerate()
        .map(|(index, chunk)| DatasetZipPartition {
            dataset_zip_id: dataset_zip_id.clone(),
            partition_index: index as i64,
            file_names: Json(chunk.to_vec()),
            file_count: chunk.len() as i64,
            files_written: 0,
            resume_file_count: 0,
            partial_blob_name: None,
            zip_blob_name: zip_blob(team_id, dataset_id, &dataset_zip_id, index as i64),
            completed: false,
        })
        .collect();
    let zip = DatasetZip {
        dataset_zip_id: dataset_zip_id.clone(),
        team_id: team_id.to_string(),
        dataset_id: dataset_id.to_string(),
        partition_count: partitions.len() as i64,
        create_time: services.clock.now(),
    };
    services.store.create_dataset_zip(&zip, &partitions).await?;

    for partition in &partitions {
        let params = create_action_parameters(
            team_id,
            ActionKind::DatasetZip {
                dataset_zip_id: dataset_zip_id.clone(),
                partition_index: partition.partition_index,
            },
        );
        trigger_via_queue(services, &params).await?;
    }
    info!(
        team_id,
        dataset_id,
        dataset_zip_id = %dataset_zip_id,
        files = files.len(),
        partitions = partitions.len(),
        "Dataset zip prepared"
    );
    Ok(zip)
}

/// Progress of one zip partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipPartitionStatus {
    /// Partition number.
    pub partition_index: i64,
    /// Files in the partition.
    pub file_count: i64,
    /// Files written so far.
    pub files_written: i64,
    /// The zip can be downloaded.
    pub completed: bool,
    /// Signed GET URL, once completed.
    pub download_url: Option<String>,
}

/// Progress of every partition of a zip export.
pub async fn dataset_zip_status(
    services: &ActionServices,
    team_id: &str,
    dataset_zip_id: &str,
) -> Result<Vec<ZipPartitionStatus>> {
    services
        .store
        .get_dataset_zip(team_id, dataset_zip_id)
        .await?;
    let expires_at = signed_url_expiry(services);
    let mut statuses = Vec::new();
    for partition in services.store.get_zip_partitions(dataset_zip_id).await? {
        let download_url = if partition.completed {
            Some(
                services
                    .blobs
                    .signed_url(&partition.zip_blob_name, SignedMethod::Get, expires_at)?,
            )
        } else {
            None
        };
        statuses.push(ZipPartitionStatus {
            partition_index: partition.partition_index,
            file_count: partition.file_count,
            files_written: partition.files_written,
            completed: partition.completed,
            download_url,
        });
    }
    Ok(statuses)
}

/// Soft-delete a dataset and trigger removal of its data.
pub async fn delete_dataset(
    services: &ActionServices,
    team_id: &str,
    dataset_id: &str,
) -> Result<TriggerOutcome> {
    services
        .store
        .mark_dataset_deleting(team_id, dataset_id)
        .await?;
    let params = create_action_parameters(
        team_id,
        ActionKind::DeleteDataset {
            dataset_id: dataset_id.to_string(),
        },
    );
    Ok(trigger_via_queue(services, &params).await?)
}
