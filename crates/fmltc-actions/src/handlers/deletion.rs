// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Removal of soft-deleted entities.
//!
//! The prepare step only sets `delete_in_progress`. These handlers delete
//! the entity's blobs one at a time, checkpointing after each, and drop the
//! rows once no blob is left. A resumed invocation lists what remains.

use fmltc_core::CoreError;
use tracing::{info, warn};

use crate::blob_names::{dataset_prefix, model_prefix, video_prefix};
use crate::error::Result;
use crate::resumption::{Checkpoint, Invocation};

/// Delete a video, its frames and its tracking sessions.
pub async fn delete_video(inv: &mut Invocation<'_>, video_id: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    let deleting = services
        .store
        .get_video(&team_id, video_id)
        .await
        .map(|v| v.delete_in_progress);
    if !confirmed("video", video_id, deleting)? {
        return Ok(Checkpoint::Continue);
    }
    if delete_blobs(inv, &video_prefix(&team_id, video_id))
        .await?
        .is_suspend()
    {
        return Ok(Checkpoint::Suspend);
    }
    services.store.delete_video_entities(video_id).await?;
    info!(video_id, "Video deleted");
    Ok(Checkpoint::Continue)
}

/// Delete a dataset, its shards and its zip exports.
pub async fn delete_dataset(inv: &mut Invocation<'_>, dataset_id: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    let deleting = services
        .store
        .get_dataset(&team_id, dataset_id)
        .await
        .map(|d| d.delete_in_progress);
    if !confirmed("dataset", dataset_id, deleting)? {
        return Ok(Checkpoint::Continue);
    }
    if delete_blobs(inv, &dataset_prefix(&team_id, dataset_id))
        .await?
        .is_suspend()
    {
        return Ok(Checkpoint::Suspend);
    }
    services.store.delete_dataset_entities(dataset_id).await?;
    info!(dataset_id, "Dataset deleted");
    Ok(Checkpoint::Continue)
}

/// Delete a model, its job outputs and its summaries.
pub async fn delete_model(inv: &mut Invocation<'_>, model_id: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    let deleting = services
        .store
        .get_model(&team_id, model_id)
        .await
        .map(|m| m.delete_in_progress);
    if !confirmed("model", model_id, deleting)? {
        return Ok(Checkpoint::Continue);
    }
    if delete_blobs(inv, &model_prefix(&team_id, model_id))
        .await?
        .is_suspend()
    {
        return Ok(Checkpoint::Suspend);
    }
    services.store.delete_model_entities(model_id).await?;
    info!(model_id, "Model deleted");
    Ok(Checkpoint::Continue)
}

/// Whether deletion may go ahead. A missing row means an earlier
/// invocation already dropped it; leftover blobs are still removed.
fn confirmed(
    kind: &'static str,
    id: &str,
    deleting: std::result::Result<bool, CoreError>,
) -> Result<bool> {
    match deleting {
        Ok(true) => Ok(true),
        Ok(false) => {
            warn!(kind, id, "Not marked for deletion, ignoring");
            Ok(false)
        }
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(e.into()),
    }
}

async fn delete_blobs(inv: &mut Invocation<'_>, prefix: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let names = services.blobs.list(prefix).await?;
    info!(prefix, blobs = names.len(), "Deleting blobs");
    for name in names {
        services.blobs.delete(&name).await?;
        if inv.retrigger_if_necessary().await?.is_suspend() {
            return Ok(Checkpoint::Suspend);
        }
    }
    Ok(Checkpoint::Continue)
}
