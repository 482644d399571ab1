// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interactive tracking session.
//!
//! The session alternates with the client: the handler publishes boxes for
//! frame `n` in the [`Tracker`](fmltc_core::persistence::Tracker) row, the
//! client acknowledges frame `n` in its
//! [`TrackerClient`](fmltc_core::persistence::TrackerClient) row (possibly
//! with corrected boxes), and only then does the handler advance to `n + 1`.
//! Per-box trackers live in memory; a resumed invocation rebuilds them from
//! the last acknowledged boxes.

use std::time::Duration;

use chrono::TimeDelta;
use fmltc_media::RgbImage;
use fmltc_media::bbox::{BoundingBox, format_bboxes, parse_bboxes};
use fmltc_media::tracker::{ObjectTracker, create_tracker};
use fmltc_media::video::decode_image;
use tracing::{debug, info, warn};

use crate::error::{ActionError, Result};
use crate::resumption::{Checkpoint, Invocation};
use crate::services::ActionServices;

/// Pause while waiting for the client.
pub const CLIENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A client silent for this long has gone away.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

struct Session {
    frame_number: i64,
    trackers: Vec<Box<dyn ObjectTracker>>,
}

/// Run tracking session `tracker_id` until it is stopped, the client goes
/// away or the video ends.
pub async fn track(inv: &mut Invocation<'_>, tracker_id: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();
    let mut session: Option<Session> = None;
    let mut available_frames: Option<i64> = None;
    let timeout = TimeDelta::from_std(CLIENT_TIMEOUT).unwrap_or(TimeDelta::MAX);

    loop {
        let tracker = services.store.get_tracker(tracker_id).await?;
        let client = services.store.get_tracker_client(tracker_id).await?;
        let (Some(tracker), Some(client)) = (tracker, client) else {
            debug!(tracker_id, "Tracking session is gone");
            return Ok(Checkpoint::Continue);
        };

        let idle = services.clock.now() - client.update_time;
        if client.tracking_stop_requested || idle >= timeout {
            info!(
                tracker_id,
                video_id = %tracker.video_id,
                stop_requested = client.tracking_stop_requested,
                idle_secs = idle.num_seconds(),
                "Tracking stopped"
            );
            services
                .store
                .finish_tracking(&tracker.video_id, tracker_id)
                .await?;
            return Ok(Checkpoint::Continue);
        }

        if tracker.tracking_failed || client.frame_number < tracker.frame_number {
            if inv
                .sleep_or_retrigger(CLIENT_POLL_INTERVAL)
                .await?
                .is_suspend()
            {
                return Ok(Checkpoint::Suspend);
            }
            continue;
        }

        let frame_count = match available_frames {
            Some(count) => count,
            None => {
                let video = services.store.get_video(&team_id, &tracker.video_id).await?;
                let count = video.extracted_frame_count;
                available_frames = Some(count);
                count
            }
        };
        let next = tracker.frame_number + 1;
        if next >= frame_count {
            info!(
                tracker_id,
                video_id = %tracker.video_id,
                frame_number = tracker.frame_number,
                "Tracking reached the end of the video"
            );
            services
                .store
                .finish_tracking(&tracker.video_id, tracker_id)
                .await?;
            return Ok(Checkpoint::Continue);
        }

        let reinit = session
            .as_ref()
            .is_none_or(|s| s.frame_number != tracker.frame_number)
            || client.bboxes_text != tracker.bboxes_text;
        if reinit {
            match start_session(
                services,
                &team_id,
                &tracker.video_id,
                &tracker.tracker_name,
                tracker.frame_number,
                &client.bboxes_text,
            )
            .await
            {
                Ok(started) => session = Some(started),
                Err(e) => {
                    warn!(
                        tracker_id,
                        frame_number = tracker.frame_number,
                        error = %e,
                        "Tracker initialisation failed"
                    );
                    services.store.set_tracking_failed(tracker_id).await?;
                    session = None;
                    continue;
                }
            }
        }
        let Some(active) = session.as_mut() else {
            continue;
        };

        let image = load_frame(services, &team_id, &tracker.video_id, next).await?;
        let boxes: Vec<BoundingBox> = active
            .trackers
            .iter_mut()
            .filter_map(|t| t.update(&image))
            .collect();
        services
            .store
            .store_tracker_result(tracker_id, next, &format_bboxes(&boxes), services.clock.now())
            .await?;
        active.frame_number = next;
        debug!(tracker_id, frame_number = next, boxes = boxes.len(), "Frame tracked");

        if inv.retrigger_if_necessary().await?.is_suspend() {
            return Ok(Checkpoint::Suspend);
        }
    }
}

async fn start_session(
    services: &ActionServices,
    team_id: &str,
    video_id: &str,
    tracker_name: &str,
    frame_number: i64,
    bboxes_text: &str,
) -> Result<Session> {
    let boxes = parse_bboxes(bboxes_text)?;
    let image = load_frame(services, team_id, video_id, frame_number).await?;
    let mut trackers = Vec::with_capacity(boxes.len());
    for b in &boxes {
        let mut tracker = create_tracker(tracker_name)?;
        tracker.init(&image, b)?;
        trackers.push(tracker);
    }
    Ok(Session {
        frame_number,
        trackers,
    })
}

async fn load_frame(
    services: &ActionServices,
    team_id: &str,
    video_id: &str,
    frame_number: i64,
) -> Result<RgbImage> {
    let frame = services
        .store
        .get_video_frames(team_id, video_id, frame_number, frame_number)
        .await?
        .into_iter()
        .next()
        .and_then(|f| f.image_blob_name)
        .ok_or_else(|| {
            ActionError::from(fmltc_core::CoreError::not_found(
                "frame image",
                format!("{video_id}/{frame_number}"),
            ))
        })?;
    let bytes = services.blobs.download(&frame).await?;
    Ok(decode_image(&bytes)?)
}
