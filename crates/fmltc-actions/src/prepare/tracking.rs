// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client side of tracking sessions.

use fmltc_core::persistence::{Tracker, TrackerClient};
use fmltc_media::bbox::{format_bboxes, parse_bboxes};
use fmltc_media::tracker::TRACKER_NAMES;
use tracing::info;
use uuid::Uuid;

use crate::action::{ActionKind, create_action_parameters};
use crate::error::{ActionError, Result};
use crate::services::ActionServices;
use crate::trigger::trigger_via_queue;

fn normalized_boxes(bboxes_text: &str) -> Result<String> {
    let boxes = parse_bboxes(bboxes_text)
        .map_err(|e| ActionError::validation("bboxes_text", e.to_string()))?;
    Ok(format_bboxes(&boxes))
}

/// Open a tracking session on `video_id` starting from the boxes on
/// `frame_number`. Returns the session id.
pub async fn prepare_to_start_tracking(
    services: &ActionServices,
    team_id: &str,
    video_id: &str,
    frame_number: i64,
    bboxes_text: &str,
    tracker_name: &str,
) -> Result<String> {
    if !TRACKER_NAMES.contains(&tracker_name) {
        return Err(ActionError::validation(
            "tracker_name",
            format!("unknown tracker '{tracker_name}'"),
        ));
    }
    let bboxes_text = normalized_boxes(bboxes_text)?;
    if bboxes_text.is_empty() {
        return Err(ActionError::validation("bboxes_text", "draw at least one box"));
    }

    let video = services.store.get_video(team_id, video_id).await?;
    if !video.frame_extraction_done() || video.frame_extraction_failed {
        return Err(ActionError::validation(
            "video_id",
            "frames of this video are not extracted",
        ));
    }
    if frame_number < 0 || frame_number >= video.extracted_frame_count {
        return Err(ActionError::validation(
            "frame_number",
            format!(
                "{frame_number} is outside 0..{}",
                video.extracted_frame_count
            ),
        ));
    }

    let now = services.clock.now();
    let tracker_id = Uuid::new_v4().to_string();
    let tracker = Tracker {
        tracker_id: tracker_id.clone(),
        team_id: team_id.to_string(),
        video_id: video_id.to_string(),
        tracker_name: tracker_name.to_string(),
        frame_number,
        bboxes_text: bboxes_text.clone(),
        tracking_failed: false,
        update_time: now,
    };
    let client = TrackerClient {
        tracker_id: tracker_id.clone(),
        frame_number,
        bboxes_text,
        tracking_stop_requested: false,
        update_time: now,
    };
    if !services.store.start_tracking(&tracker, &client).await? {
        return Err(ActionError::validation(
            "video_id",
            "this video is already being tracked or deleted",
        ));
    }

    let params = create_action_parameters(
        team_id,
        ActionKind::Tracking {
            tracker_id: tracker_id.clone(),
        },
    );
    trigger_via_queue(services, &params).await?;
    info!(team_id, video_id, tracker_id = %tracker_id, frame_number, "Tracking started");
    Ok(tracker_id)
}

/// Acknowledge `frame_number`, with the boxes as the user left them, and
/// return the session's latest result. `None` once the session ended.
pub async fn continue_tracking(
    services: &ActionServices,
    team_id: &str,
    tracker_id: &str,
    frame_number: i64,
    bboxes_text: &str,
) -> Result<Option<Tracker>> {
    let Some(tracker) = owned_tracker(services, team_id, tracker_id).await? else {
        return Ok(None);
    };
    if frame_number > tracker.frame_number {
        return Err(ActionError::validation(
            "frame_number",
            format!("frame {frame_number} was not tracked yet"),
        ));
    }
    let bboxes_text = normalized_boxes(bboxes_text)?;
    match services
        .store
        .store_tracker_client_update(tracker_id, frame_number, &bboxes_text, services.clock.now())
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    Ok(services.store.get_tracker(tracker_id).await?)
}

/// Ask the session to stop. Stopping an ended session is a no-op.
pub async fn stop_tracking(services: &ActionServices, team_id: &str, tracker_id: &str) -> Result<()> {
    if owned_tracker(services, team_id, tracker_id).await?.is_none() {
        return Ok(());
    }
    match services
        .store
        .request_tracking_stop(tracker_id, services.clock.now())
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    info!(team_id, tracker_id, "Tracking stop requested");
    Ok(())
}

async fn owned_tracker(
    services: &ActionServices,
    team_id: &str,
    tracker_id: &str,
) -> Result<Option<Tracker>> {
    match services.store.get_tracker(tracker_id).await? {
        Some(tracker) if tracker.team_id != team_id => Err(
            fmltc_core::CoreError::not_found("tracker", tracker_id).into(),
        ),
        other => Ok(other),
    }
}
