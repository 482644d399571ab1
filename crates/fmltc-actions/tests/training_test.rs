// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for training runs, the training monitor and minute
//! accounting.

mod common;

use std::time::Duration;

use common::TestContext;
use fmltc_actions::blob_names::{model_job_dir, model_prefix};
use fmltc_actions::prepare::{TrainingRequest, cancel_training, delete_model, start_training};
use fmltc_actions::training::JobState;
use fmltc_core::blob::BlobStore;
use fmltc_core::clock::Clock;
use fmltc_core::persistence::{Model, Persistence};
use fmltc_media::event_file::{encode_event_file, scalar_event};

fn request(dataset_id: &str, minutes: i64) -> TrainingRequest {
    TrainingRequest {
        description: "cones v1".to_string(),
        dataset_ids: vec![dataset_id.to_string()],
        starting_model: "ssd_mobilenet_v2_320x320_coco17_tpu-8".to_string(),
        num_training_steps: 2000,
        max_running_minutes: minutes,
    }
}

async fn started_model(ctx: &TestContext, minutes: i64) -> Model {
    let dataset_id = ctx.completed_dataset().await;
    start_training(&ctx.services, &ctx.team_id, &request(&dataset_id, minutes))
        .await
        .unwrap()
}

async fn reload(ctx: &TestContext, model: &Model) -> Model {
    ctx.store
        .get_model(&ctx.team_id, &model.model_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_start_reserves_minutes_and_submits_both_jobs() {
    let ctx = TestContext::new().await;
    let model = started_model(&ctx, 30).await;

    assert_eq!(ctx.remaining_minutes().await, 30);
    assert_eq!(model.reserved_training_minutes, 30);
    let eval_job = model.eval_job_name.clone().expect("eval job");

    let submitted = ctx.training.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].job_id, model.train_job_name);
    assert_eq!(submitted[1].job_id, eval_job);
    assert_eq!(submitted[0].training_input.scheduling.max_running_time, "1800s");
    assert_eq!(
        submitted[0].training_input.job_dir,
        model_job_dir(&ctx.team_id, &model.model_id, "train")
    );
    assert!(
        submitted[0]
            .training_input
            .args
            .iter()
            .any(|a| a == "--num_train_steps=2000")
    );
    assert!(
        reload(&ctx, &model)
            .await
            .monitor_training_triggered_time
            .is_some()
    );
}

#[tokio::test]
async fn test_start_without_enough_minutes_is_rejected() {
    let ctx = TestContext::new().await;
    let dataset_id = ctx.completed_dataset().await;

    let err = start_training(&ctx.services, &ctx.team_id, &request(&dataset_id, 90))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not enough remaining training minutes"));
    assert_eq!(ctx.remaining_minutes().await, 60);
    assert!(ctx.training.submitted().is_empty());
}

#[tokio::test]
async fn test_monitor_charges_used_minutes_and_refunds_the_rest() {
    let ctx = TestContext::new().await;
    let model = started_model(&ctx, 30).await;
    let eval_job = model.eval_job_name.clone().unwrap();

    let start = ctx.clock.now();
    ctx.training
        .set_state(&model.train_job_name, JobState::Running, start);
    ctx.training.set_state(&eval_job, JobState::Running, start);
    let end = start + chrono::Duration::seconds(10 * 60 + 30);
    ctx.training
        .set_state(&model.train_job_name, JobState::Succeeded, end);
    ctx.training.set_state(&eval_job, JobState::Succeeded, end);
    ctx.drain().await;

    let model = reload(&ctx, &model).await;
    assert!(model.monitor_training_finished);
    assert_eq!(model.train_job_state, "SUCCEEDED");
    assert_eq!(model.eval_job_state.as_deref(), Some("SUCCEEDED"));
    // 10.5 minutes are charged as 11.
    assert_eq!(model.training_minutes_charged, Some(11));
    assert_eq!(ctx.remaining_minutes().await, 60 - 11);
}

#[tokio::test]
async fn test_monitor_mirrors_event_file_summaries() {
    let ctx = TestContext::new().await;
    let model = started_model(&ctx, 30).await;
    let eval_job = model.eval_job_name.clone().unwrap();

    let events = encode_event_file(&[
        scalar_event(100, "Loss/total_loss", 1.5),
        scalar_event(200, "Loss/total_loss", 0.5),
    ]);
    let train_dir = model_job_dir(&ctx.team_id, &model.model_id, "train");
    ctx.blobs
        .upload(
            &format!("{train_dir}events.out.tfevents.1700000000.worker"),
            &events,
            "application/octet-stream",
        )
        .await
        .unwrap();
    // Not an event file.
    ctx.blobs
        .upload(&format!("{train_dir}checkpoint"), b"ckpt-2", "text/plain")
        .await
        .unwrap();

    let now = ctx.clock.now();
    ctx.training
        .set_state(&model.train_job_name, JobState::Running, now);
    ctx.training
        .set_state(&model.train_job_name, JobState::Succeeded, now);
    ctx.training.set_state(&eval_job, JobState::Cancelled, now);
    ctx.drain().await;

    let model = reload(&ctx, &model).await;
    assert!(model.monitor_training_finished);
    assert_eq!(model.trained_steps, 200);
    assert_eq!(model.dict_event_file_path_to_updated.0.len(), 1);

    let items = ctx
        .store
        .list_summary_items(&model.model_id, "train")
        .await
        .unwrap();
    let mut values: Vec<(i64, f64)> = items
        .iter()
        .map(|i| (i.step, i.value.unwrap_or_default()))
        .collect();
    values.sort_by_key(|(step, _)| *step);
    assert_eq!(values, vec![(100, 1.5), (200, 0.5)]);
    assert!(items.iter().all(|i| i.value_type == "scalar"));
}

#[tokio::test]
async fn test_monitor_rides_out_transient_poll_failures() {
    let ctx = TestContext::new().await;
    let model = started_model(&ctx, 30).await;
    let eval_job = model.eval_job_name.clone().unwrap();

    let now = ctx.clock.now();
    ctx.training
        .set_state(&model.train_job_name, JobState::Failed, now);
    ctx.training.set_state(&eval_job, JobState::Failed, now);
    ctx.training.fail_next_polls(3);
    ctx.drain().await;

    let model = reload(&ctx, &model).await;
    assert!(model.monitor_training_finished);
    assert_eq!(model.train_job_state, "FAILED");
    assert!(model.train_error_message.is_some());
    // A job that never ran costs nothing.
    assert_eq!(model.training_minutes_charged, Some(0));
    assert_eq!(ctx.remaining_minutes().await, 60);
}

#[tokio::test]
async fn test_cancel_stops_jobs_and_settles() {
    let ctx = TestContext::new().await;
    let model = started_model(&ctx, 30).await;
    let eval_job = model.eval_job_name.clone().unwrap();
    ctx.training
        .set_state(&model.train_job_name, JobState::Running, ctx.clock.now());
    ctx.training
        .set_state(&eval_job, JobState::Running, ctx.clock.now());

    cancel_training(&ctx.services, &ctx.team_id, &model.model_id)
        .await
        .unwrap();
    ctx.drain().await;

    assert_eq!(
        ctx.training.state(&model.train_job_name),
        Some(JobState::Cancelled)
    );
    assert_eq!(ctx.training.state(&eval_job), Some(JobState::Cancelled));
    let model = reload(&ctx, &model).await;
    assert!(model.monitor_training_finished);
    assert_eq!(model.train_job_state, "CANCELLED");
    assert!(model.training_minutes_charged.is_some());
}

#[tokio::test]
async fn test_monitor_hands_over_while_jobs_run() {
    let ctx = TestContext::new().await;
    let model = started_model(&ctx, 30).await;
    let start = ctx.clock.now();
    ctx.training
        .set_state(&model.train_job_name, JobState::Running, start);

    // One invocation polls until its budget is nearly spent, then hands over.
    let outcomes = ctx.run_pending_once(&ctx.dispatcher()).await;
    assert_eq!(outcomes, vec![fmltc_actions::DispatchOutcome::Retriggered]);
    let model = reload(&ctx, &model).await;
    assert!(!model.monitor_training_finished);
    assert_eq!(model.train_job_state, "RUNNING");
    assert!(model.training_minutes_charged.is_none());
    assert_eq!(model.train_job_start_time, Some(start));
}

#[tokio::test]
async fn test_delete_model_charges_and_removes_everything() {
    let ctx = TestContext::new().await;
    let model = started_model(&ctx, 30).await;
    let eval_job = model.eval_job_name.clone().unwrap();
    let start = ctx.clock.now();
    ctx.training
        .set_state(&model.train_job_name, JobState::Running, start);
    // The monitor records the start time, then hands over.
    ctx.run_pending_once(&ctx.dispatcher()).await;
    ctx.clock.advance(Duration::from_secs(5 * 60));
    let used = ((ctx.clock.now() - start).num_seconds() + 59) / 60;
    assert!(used < 30);

    let train_dir = model_job_dir(&ctx.team_id, &model.model_id, "train");
    ctx.blobs
        .upload(&format!("{train_dir}ckpt-1.index"), b"index", "application/octet-stream")
        .await
        .unwrap();

    delete_model(&ctx.services, &ctx.team_id, &model.model_id)
        .await
        .unwrap();
    assert_eq!(ctx.remaining_minutes().await, 60 - used);
    assert_eq!(
        ctx.training.state(&model.train_job_name),
        Some(JobState::Cancelled)
    );
    assert_eq!(ctx.training.state(&eval_job), Some(JobState::Cancelled));

    ctx.drain().await;
    let err = ctx
        .store
        .get_model(&ctx.team_id, &model.model_id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(
        ctx.blobs
            .list(&model_prefix(&ctx.team_id, &model.model_id))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(ctx.remaining_minutes().await, 60 - used);
}
