// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the file-backed entity store and blob-backed queue.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::TestContext;
use fmltc_core::persistence::{NewVideo, Persistence, SqlitePersistence};
use fmltc_core::queue::{ActionQueue, BlobActionQueue};

#[tokio::test]
async fn test_state_survives_reconnect() {
    let ctx = TestContext::new().await.expect("context");
    let team = ctx
        .store
        .get_or_create_team("FRC/Team 42", 60, Utc::now())
        .await
        .unwrap();
    ctx.store
        .create_video(
            &NewVideo {
                video_id: "v1".to_string(),
                team_id: team.team_id.clone(),
                description: "match".to_string(),
                video_filename: "match.mp4".to_string(),
                file_size: 10,
                content_type: "video/mp4".to_string(),
                blob_name: "b".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();

    // Migrations are idempotent and data is on disk.
    let reopened = SqlitePersistence::connect(&ctx.database_url).await.unwrap();
    let video = reopened.get_video(&team.team_id, "v1").await.unwrap();
    assert_eq!(video.video_filename, "match.mp4");
    assert_eq!(video.extracted_frame_count, 0);
    assert!(!video.frame_extraction_done());
}

#[tokio::test]
async fn test_queue_redelivers_pending_items() {
    let ctx = TestContext::new().await.expect("context");

    let first = BlobActionQueue::new(ctx.blobs.clone());
    first.enqueue("dataset_zip/1", b"{\"a\":1}").await.unwrap();
    first.enqueue("dataset_zip/2", b"{\"a\":2}").await.unwrap();
    first.dequeue_and_delete("dataset_zip/1").await.unwrap();

    // A fresh process sees only what was not consumed.
    let second = Arc::new(BlobActionQueue::new(ctx.blobs.clone()));
    assert_eq!(second.pending().await.unwrap(), vec!["dataset_zip/2"]);
    assert_eq!(
        second.dequeue_and_delete("dataset_zip/2").await.unwrap(),
        Some(b"{\"a\":2}".to_vec())
    );
}
