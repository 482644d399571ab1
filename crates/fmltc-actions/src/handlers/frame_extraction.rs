// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame extraction.
//!
//! Phase 1 (nothing extracted yet) counts the frames with a skip-only scan
//! and rejects videos over the configured limits. Phase 2 decodes frames
//! from `extracted_frame_count` on, uploading one JPEG per frame and raising
//! the counter after each. A resumed invocation skips the frames that are
//! already extracted; sequential skipping is used instead of seeking.

use fmltc_core::limits::Limits;
use fmltc_media::video::{JPEG_QUALITY, VideoProperties, encode_jpeg};
use tracing::{debug, info, warn};

use crate::blob_names::frame_image_blob;
use crate::error::Result;
use crate::resumption::{Checkpoint, Invocation};
use crate::services::ActionServices;

const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Extract all frames of `video_id`.
pub async fn extract_frames(inv: &mut Invocation<'_>, video_id: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    let video = services.store.get_video(&team_id, video_id).await?;
    if video.delete_in_progress || video.frame_extraction_done() {
        debug!(video_id, "Frame extraction already over");
        return Ok(Checkpoint::Continue);
    }
    services
        .store
        .mark_frame_extraction_started(video_id, services.clock.now())
        .await?;

    let bytes = match services.blobs.download(&video.blob_name).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => {
            fail(services, video_id, "The video file was not uploaded.").await?;
            return Ok(Checkpoint::Continue);
        }
        Err(e) => return Err(e.into()),
    };

    let mut frame_count = video.frame_count.unwrap_or(0);
    if video.extracted_frame_count == 0 {
        let limits = services.limits().await?;
        match count_frames(services, &bytes, &limits).await? {
            Ok((properties, count)) => {
                services
                    .store
                    .set_video_properties(
                        video_id,
                        properties.width as i64,
                        properties.height as i64,
                        properties.fps,
                        count,
                    )
                    .await?;
                services
                    .store
                    .create_video_frames(&team_id, video_id, count)
                    .await?;
                info!(
                    video_id,
                    frame_count = count,
                    width = properties.width,
                    height = properties.height,
                    fps = properties.fps,
                    "Counted video frames"
                );
                frame_count = count;
            }
            Err(message) => {
                fail(services, video_id, &message).await?;
                return Ok(Checkpoint::Continue);
            }
        }
    }

    let mut source = match services.video_opener.open(&bytes).await {
        Ok(source) => source,
        Err(e) => {
            fail(services, video_id, &format!("Unable to decode the video: {e}")).await?;
            return Ok(Checkpoint::Continue);
        }
    };

    let mut frame_number = 0;
    let resume_at = video.extracted_frame_count;
    while frame_number < resume_at {
        match source.skip_frame().await {
            Ok(true) => frame_number += 1,
            Ok(false) => break,
            Err(e) => {
                fail(services, video_id, &format!("Unable to decode the video: {e}")).await?;
                return Ok(Checkpoint::Continue);
            }
        }
    }
    if frame_number < resume_at {
        warn!(video_id, frame_number, resume_at, "Video ended while skipping extracted frames");
    } else {
        while frame_number < frame_count {
            let frame = match source.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(video_id, frame_number, error = %e, "Decoding stopped early");
                    break;
                }
            };
            let jpeg = match encode_jpeg(&frame, JPEG_QUALITY) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    let message = format!("Unable to encode frame {frame_number}: {e}");
                    fail(services, video_id, &message).await?;
                    return Ok(Checkpoint::Continue);
                }
            };
            let blob_name = frame_image_blob(&team_id, video_id, frame_number);
            services
                .blobs
                .upload(&blob_name, &jpeg, JPEG_CONTENT_TYPE)
                .await?;
            let stored = services
                .store
                .store_extracted_frame(video_id, frame_number, &blob_name, JPEG_CONTENT_TYPE)
                .await?;
            if !stored {
                // The video is being deleted; its deletion may already have
                // listed the prefix.
                info!(video_id, frame_number, "Video is being deleted, stopping extraction");
                services.blobs.delete(&blob_name).await?;
                return Ok(Checkpoint::Continue);
            }
            frame_number += 1;

            if frame_number < frame_count && inv.retrigger_if_necessary().await?.is_suspend() {
                return Ok(Checkpoint::Suspend);
            }
        }
    }

    let video = services
        .store
        .finish_frame_extraction(video_id, services.clock.now())
        .await?;
    info!(
        video_id,
        extracted_frame_count = video.extracted_frame_count,
        frame_count = ?video.frame_count,
        "Frame extraction finished"
    );
    Ok(Checkpoint::Continue)
}

/// Count frames, checking the limits. `Err` carries the user-facing reason
/// the video was rejected.
async fn count_frames(
    services: &ActionServices,
    bytes: &[u8],
    limits: &Limits,
) -> Result<std::result::Result<(VideoProperties, i64), String>> {
    let mut source = match services.video_opener.open(bytes).await {
        Ok(source) => source,
        Err(e) => return Ok(Err(format!("Unable to decode the video: {e}"))),
    };
    let properties = source.properties();
    if properties.width > limits.max_video_width || properties.height > limits.max_video_height {
        return Ok(Err(format!(
            "The video resolution {}x{} exceeds the maximum of {}x{}.",
            properties.width, properties.height, limits.max_video_width, limits.max_video_height
        )));
    }
    if properties.duration_secs > limits.max_video_length_secs as f64 {
        return Ok(Err(format!(
            "The video is {:.1} seconds long; the maximum is {} seconds.",
            properties.duration_secs, limits.max_video_length_secs
        )));
    }

    let max_frames = limits.max_frames_per_video as i64;
    let mut count = 0i64;
    loop {
        match source.skip_frame().await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => return Ok(Err(format!("Unable to decode the video: {e}"))),
        }
        count += 1;
        if count > max_frames {
            return Ok(Err(format!(
                "The video has more than {max_frames} frames."
            )));
        }
    }
    if count == 0 {
        return Ok(Err("The video contains no frames.".to_string()));
    }
    if properties.fps > 0.0 && count as f64 / properties.fps > limits.max_video_length_secs as f64 {
        return Ok(Err(format!(
            "The video is longer than {} seconds.",
            limits.max_video_length_secs
        )));
    }
    Ok(Ok((properties, count)))
}

async fn fail(services: &ActionServices, video_id: &str, message: &str) -> Result<()> {
    warn!(video_id, reason = message, "Frame extraction failed");
    services
        .store
        .fail_frame_extraction(video_id, message, services.clock.now())
        .await?;
    Ok(())
}
