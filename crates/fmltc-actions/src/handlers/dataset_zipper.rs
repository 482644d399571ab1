// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dataset zip partitions.
//!
//! Each partition action copies its share of the dataset's blobs into one
//! zip archive. `files_written` is raised after every file for progress
//! display. On suspend the archive written so far is uploaded as a partial
//! blob and reopened in append mode by the successor.

use std::io::{Cursor, Write};

use fmltc_core::persistence::DatasetZipPartition;
use tracing::{debug, info, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::blob_names::{file_name, partial_zip_blob};
use crate::error::Result;
use crate::resumption::{Checkpoint, Invocation};
use crate::services::ActionServices;

/// Content type of finished and partial partitions.
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Write partition `partition_index` of zip job `dataset_zip_id`.
pub async fn zip_partition(
    inv: &mut Invocation<'_>,
    dataset_zip_id: &str,
    partition_index: i64,
) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    let zip = match services.store.get_dataset_zip(&team_id, dataset_zip_id).await {
        Ok(zip) => zip,
        Err(e) if e.is_not_found() => {
            debug!(dataset_zip_id, "Zip job is gone");
            return Ok(Checkpoint::Continue);
        }
        Err(e) => return Err(e.into()),
    };
    let partition = services
        .store
        .get_zip_partition(dataset_zip_id, partition_index)
        .await?;
    if partition.completed {
        return Ok(Checkpoint::Continue);
    }

    let (mut archive, start) = open_archive(services, &partition).await?;
    let files = &partition.file_names.0;
    info!(
        dataset_zip_id,
        partition_index,
        start,
        file_count = files.len(),
        "Writing zip partition"
    );

    for (index, blob_name) in files.iter().enumerate().skip(start) {
        let data = services.blobs.download(blob_name).await?;
        archive.start_file(file_name(blob_name), SimpleFileOptions::default())?;
        archive.write_all(&data)?;
        let written = index as i64 + 1;
        services
            .store
            .update_zip_progress(dataset_zip_id, partition_index, written)
            .await?;

        if index + 1 < files.len() && inv.needs_retrigger() {
            let bytes = archive.finish()?.into_inner();
            let partial = partial_zip_blob(&team_id, &zip.dataset_id, dataset_zip_id, partition_index);
            services
                .blobs
                .upload(&partial, &bytes, ZIP_CONTENT_TYPE)
                .await?;
            services
                .store
                .save_zip_checkpoint(dataset_zip_id, partition_index, written, Some(&partial))
                .await?;
            debug!(dataset_zip_id, partition_index, written, "Zip partition checkpointed");
            return Ok(inv.retrigger_now().await?);
        }
    }

    let bytes = archive.finish()?.into_inner();
    services
        .blobs
        .upload(&partition.zip_blob_name, &bytes, ZIP_CONTENT_TYPE)
        .await?;
    services
        .store
        .complete_zip_partition(dataset_zip_id, partition_index)
        .await?;
    if let Some(partial) = &partition.partial_blob_name {
        services.blobs.delete(partial).await?;
    }
    info!(
        dataset_zip_id,
        partition_index,
        bytes = bytes.len(),
        "Zip partition completed"
    );
    Ok(Checkpoint::Continue)
}

/// Reopen the checkpointed archive or start an empty one. Returns the
/// archive and the number of files it already holds.
async fn open_archive(
    services: &ActionServices,
    partition: &DatasetZipPartition,
) -> Result<(ZipWriter<Cursor<Vec<u8>>>, usize)> {
    if let Some(partial) = partition
        .partial_blob_name
        .as_deref()
        .filter(|_| partition.resume_file_count > 0)
    {
        match services.blobs.download(partial).await {
            Ok(bytes) => {
                let archive = ZipWriter::new_append(Cursor::new(bytes))?;
                return Ok((archive, partition.resume_file_count as usize));
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    dataset_zip_id = %partition.dataset_zip_id,
                    partition_index = partition.partition_index,
                    "Partial zip is gone, starting over"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok((ZipWriter::new(Cursor::new(Vec::new())), 0))
}
