// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Video upload, frame extraction and frame labels.

use chrono::{DateTime, Utc};
use fmltc_core::blob::SignedMethod;
use fmltc_core::persistence::{NewVideo, Video};
use fmltc_media::bbox::{format_bboxes, parse_bboxes};
use tracing::info;
use uuid::Uuid;

use crate::action::{ActionKind, create_action_parameters};
use crate::blob_names::video_blob;
use crate::error::{ActionError, Result};
use crate::prepare::signed_url_expiry;
use crate::services::ActionServices;
use crate::trigger::{TriggerOutcome, trigger_via_queue};

/// A created video and where to upload its file.
#[derive(Debug, Clone)]
pub struct VideoUpload {
    /// The new video.
    pub video: Video,
    /// Signed PUT URL for the file.
    pub upload_url: String,
    /// When `upload_url` stops working.
    pub expires_at: DateTime<Utc>,
}

/// Create a video and a signed URL the client uploads the file to.
pub async fn prepare_video_upload(
    services: &ActionServices,
    team_id: &str,
    description: &str,
    video_filename: &str,
    file_size: i64,
    content_type: &str,
) -> Result<VideoUpload> {
    let limits = services.limits().await?;
    if description.trim().is_empty() {
        return Err(ActionError::validation("description", "must not be empty"));
    }
    if file_size <= 0 || file_size as u64 > limits.max_video_size_bytes {
        return Err(ActionError::validation(
            "file_size",
            format!(
                "{file_size} bytes is outside 1..={} bytes",
                limits.max_video_size_bytes
            ),
        ));
    }
    if !content_type.starts_with("video/") {
        return Err(ActionError::validation(
            "content_type",
            format!("'{content_type}' is not a video type"),
        ));
    }

    let video_id = Uuid::new_v4().to_string();
    let blob_name = video_blob(team_id, &video_id);
    let video = services
        .store
        .create_video(
            &NewVideo {
                video_id: video_id.clone(),
                team_id: team_id.to_string(),
                description: description.to_string(),
                video_filename: video_filename.to_string(),
                file_size,
                content_type: content_type.to_string(),
                blob_name: blob_name.clone(),
            },
            services.clock.now(),
        )
        .await?;
    let expires_at = signed_url_expiry(services);
    let upload_url = services
        .blobs
        .signed_url(&blob_name, SignedMethod::Put, expires_at)?;
    info!(team_id, video_id = %video_id, file_size, "Video upload prepared");
    Ok(VideoUpload {
        video,
        upload_url,
        expires_at,
    })
}

/// Trigger frame extraction of an uploaded video.
pub async fn start_frame_extraction(
    services: &ActionServices,
    team_id: &str,
    video_id: &str,
) -> Result<TriggerOutcome> {
    let video = services.store.get_video(team_id, video_id).await?;
    if video.delete_in_progress {
        return Err(ActionError::validation("video_id", "the video is being deleted"));
    }
    if video.frame_extraction_failed {
        return Err(ActionError::validation(
            "video_id",
            "frame extraction of this video already failed",
        ));
    }
    if !services.blobs.exists(&video.blob_name).await? {
        return Err(ActionError::validation(
            "video_id",
            "the video file has not been uploaded",
        ));
    }
    services
        .store
        .mark_frame_extraction_triggered(team_id, video_id, services.clock.now())
        .await?;
    let params = create_action_parameters(
        team_id,
        ActionKind::ExtractFrames {
            video_id: video_id.to_string(),
        },
    );
    Ok(trigger_via_queue(services, &params).await?)
}

/// Replace the boxes of one frame. The text is normalised before storing.
pub async fn store_frame_bboxes(
    services: &ActionServices,
    team_id: &str,
    video_id: &str,
    frame_number: i64,
    bboxes_text: &str,
) -> Result<()> {
    let boxes = parse_bboxes(bboxes_text)
        .map_err(|e| ActionError::validation("bboxes_text", e.to_string()))?;
    services
        .store
        .store_frame_bboxes(team_id, video_id, frame_number, &format_bboxes(&boxes))
        .await?;
    Ok(())
}

/// Include a frame in, or exclude it from, future datasets.
pub async fn set_frame_included(
    services: &ActionServices,
    team_id: &str,
    video_id: &str,
    frame_number: i64,
    include: bool,
) -> Result<()> {
    services
        .store
        .set_frame_included(team_id, video_id, frame_number, include)
        .await?;
    Ok(())
}

/// Soft-delete a video and trigger removal of its data. A running tracking
/// session is asked to stop.
pub async fn delete_video(
    services: &ActionServices,
    team_id: &str,
    video_id: &str,
) -> Result<TriggerOutcome> {
    let video = services.store.mark_video_deleting(team_id, video_id).await?;
    if video.tracking_in_progress
        && let Some(tracker_id) = &video.tracker_id
    {
        match services
            .store
            .request_tracking_stop(tracker_id, services.clock.now())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    let params = create_action_parameters(
        team_id,
        ActionKind::DeleteVideo {
            video_id: video_id.to_string(),
        },
    );
    Ok(trigger_via_queue(services, &params).await?)
}
