// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the background queue consumer.

mod common;

use std::time::Duration;

use common::TestContext;
use fmltc_actions::prepare::start_frame_extraction;
use fmltc_actions::{ActionWorker, ActionWorkerConfig};
use fmltc_core::persistence::Persistence;
use fmltc_core::queue::ActionQueue;
use tokio::sync::mpsc;

async fn wait_for_extraction(ctx: &TestContext, video_id: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let video = ctx.store.get_video(&ctx.team_id, video_id).await.unwrap();
            if video.frame_extraction_done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("extraction finished in time");
}

#[tokio::test]
async fn test_worker_runs_notified_actions() {
    let ctx = TestContext::new().await;
    let receiver = ctx.queue.subscribe().expect("receiver");
    let worker = ActionWorker::new(ctx.dispatcher(), receiver, ActionWorkerConfig::default());
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(worker.run());

    let video_id = ctx.uploaded_video().await;
    start_frame_extraction(&ctx.services, &ctx.team_id, &video_id)
        .await
        .unwrap();
    wait_for_extraction(&ctx, &video_id).await;

    shutdown.notify_one();
    handle.await.unwrap();
    let video = ctx.store.get_video(&ctx.team_id, &video_id).await.unwrap();
    assert_eq!(video.extracted_frame_count, 6);
    assert!(ctx.queue.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_picks_up_items_left_from_before_startup() {
    let ctx = TestContext::new().await;
    // Nobody listens while the item is enqueued.
    drop(ctx.queue.subscribe());
    let video_id = ctx.uploaded_video().await;
    start_frame_extraction(&ctx.services, &ctx.team_id, &video_id)
        .await
        .unwrap();
    assert_eq!(ctx.queue.pending().await.unwrap().len(), 1);

    let (_tx, receiver) = mpsc::unbounded_channel();
    let worker = ActionWorker::new(
        ctx.forced_retrigger_dispatcher(),
        receiver,
        ActionWorkerConfig {
            concurrency: 2,
            redeliver_interval: Duration::from_millis(50),
        },
    );
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(worker.run());

    // Continuations are only found by the sweep, too.
    wait_for_extraction(&ctx, &video_id).await;
    shutdown.notify_one();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_worker_stops_when_the_channel_closes() {
    let ctx = TestContext::new().await;
    let (tx, receiver) = mpsc::unbounded_channel::<String>();
    let worker = ActionWorker::new(ctx.dispatcher(), receiver, ActionWorkerConfig::default());
    let handle = tokio::spawn(worker.run());
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stopped")
        .unwrap();
}
