// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for deletions and admin training-minute actions.

mod common;

use common::TestContext;
use fmltc_actions::DispatchOutcome;
use fmltc_actions::blob_names::{dataset_prefix, video_prefix};
use fmltc_actions::prepare::{
    delete_dataset, delete_video, get_or_create_team, increment_remaining_training_minutes,
    prepare_dataset_zip, prepare_to_start_tracking, reset_remaining_training_minutes,
};
use fmltc_core::blob::BlobStore;
use fmltc_core::persistence::Persistence;

#[tokio::test]
async fn test_delete_video_removes_blobs_one_invocation_at_a_time() {
    let ctx = TestContext::new().await;
    let video_id = ctx.extracted_video().await;
    let prefix = video_prefix(&ctx.team_id, &video_id);
    // The upload plus six frames.
    assert_eq!(ctx.blobs.list(&prefix).await.unwrap().len(), 7);

    delete_video(&ctx.services, &ctx.team_id, &video_id)
        .await
        .unwrap();
    let video = ctx.store.get_video(&ctx.team_id, &video_id).await.unwrap();
    assert!(video.delete_in_progress);

    let outcomes = ctx.run_until_idle(&ctx.forced_retrigger_dispatcher()).await;
    let retriggered = outcomes
        .iter()
        .filter(|o| **o == DispatchOutcome::Retriggered)
        .count();
    assert_eq!(retriggered, 7);
    assert_eq!(outcomes.last(), Some(&DispatchOutcome::Finished));

    assert!(ctx.blobs.list(&prefix).await.unwrap().is_empty());
    let err = ctx.store.get_video(&ctx.team_id, &video_id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_video_stops_its_tracking_session() {
    let ctx = TestContext::new().await;
    let video_id = ctx.extracted_video().await;
    let tracker_id = prepare_to_start_tracking(
        &ctx.services,
        &ctx.team_id,
        &video_id,
        0,
        "4,4,20,20,cone",
        "template",
    )
    .await
    .unwrap();

    delete_video(&ctx.services, &ctx.team_id, &video_id)
        .await
        .unwrap();
    let client = ctx
        .store
        .get_tracker_client(&tracker_id)
        .await
        .unwrap()
        .unwrap();
    assert!(client.tracking_stop_requested);

    ctx.drain().await;
    assert!(ctx.store.get_tracker(&tracker_id).await.unwrap().is_none());
    assert!(ctx.store.get_video(&ctx.team_id, &video_id).await.is_err());
}

#[tokio::test]
async fn test_delete_dataset_removes_shards_and_zips_but_not_frames() {
    let ctx = TestContext::new().await;
    let dataset_id = ctx.completed_dataset().await;
    prepare_dataset_zip(&ctx.services, &ctx.team_id, &dataset_id)
        .await
        .unwrap();
    ctx.drain().await;
    let prefix = dataset_prefix(&ctx.team_id, &dataset_id);
    assert!(!ctx.blobs.list(&prefix).await.unwrap().is_empty());

    delete_dataset(&ctx.services, &ctx.team_id, &dataset_id)
        .await
        .unwrap();
    ctx.drain().await;

    assert!(ctx.blobs.list(&prefix).await.unwrap().is_empty());
    assert!(
        ctx.store
            .get_dataset(&ctx.team_id, &dataset_id)
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(ctx.store.list_dataset_records(&dataset_id).await.unwrap().is_empty());
    assert!(!ctx.blobs.list("videos/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleting_twice_is_harmless() {
    let ctx = TestContext::new().await;
    let video_id = ctx.extracted_video().await;
    delete_video(&ctx.services, &ctx.team_id, &video_id)
        .await
        .unwrap();
    ctx.drain().await;

    let err = delete_video(&ctx.services, &ctx.team_id, &video_id)
        .await
        .unwrap_err();
    assert_eq!(err.class(), fmltc_core::error::ErrorClass::NotFound);
}

async fn three_teams(ctx: &TestContext) -> Vec<String> {
    let mut ids = vec![ctx.team_id.clone()];
    for key in ["FTC/Team 7236", "FTC/Team 18140"] {
        ids.push(get_or_create_team(&ctx.services, key).await.unwrap().team_id);
    }
    ids
}

async fn minutes(ctx: &TestContext, team_ids: &[String]) -> Vec<i64> {
    let mut out = Vec::new();
    for id in team_ids {
        out.push(ctx.store.get_team(id).await.unwrap().remaining_training_minutes);
    }
    out
}

#[tokio::test]
async fn test_resumed_increment_applies_once_per_team() {
    let ctx = TestContext::new().await;
    let teams = three_teams(&ctx).await;

    increment_remaining_training_minutes(&ctx.services, "admin", 15)
        .await
        .unwrap();
    let outcomes = ctx.run_until_idle(&ctx.forced_retrigger_dispatcher()).await;
    assert!(outcomes.contains(&DispatchOutcome::Retriggered));
    assert_eq!(minutes(&ctx, &teams).await, vec![75, 75, 75]);

    // A later request is a new action and applies again.
    increment_remaining_training_minutes(&ctx.services, "admin", -5)
        .await
        .unwrap();
    ctx.drain().await;
    assert_eq!(minutes(&ctx, &teams).await, vec![70, 70, 70]);
}

#[tokio::test]
async fn test_resumed_reset_sets_every_team() {
    let ctx = TestContext::new().await;
    let teams = three_teams(&ctx).await;
    ctx.store.adjust_training_minutes(&teams[1], -40).await.unwrap();

    reset_remaining_training_minutes(&ctx.services, "admin", 120)
        .await
        .unwrap();
    ctx.run_until_idle(&ctx.forced_retrigger_dispatcher()).await;
    assert_eq!(minutes(&ctx, &teams).await, vec![120, 120, 120]);
}

#[tokio::test]
async fn test_admin_requests_are_validated() {
    let ctx = TestContext::new().await;
    assert!(
        reset_remaining_training_minutes(&ctx.services, "admin", -1)
            .await
            .is_err()
    );
    assert!(
        increment_remaining_training_minutes(&ctx.services, "admin", 0)
            .await
            .is_err()
    );
    assert!(ctx.drain().await.is_empty());
}
