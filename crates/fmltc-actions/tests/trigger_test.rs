// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for triggering and dispatching actions.

mod common;

use std::time::Duration;

use common::TestContext;
use fmltc_actions::{
    ActionKind, DispatchOutcome, TriggerOutcome, create_action_parameters, trigger_via_queue,
};
use fmltc_core::persistence::Persistence;
use fmltc_core::queue::ActionQueue;

fn delete_video_params(ctx: &TestContext) -> fmltc_actions::ActionParameters {
    create_action_parameters(
        ctx.team_id.clone(),
        ActionKind::DeleteVideo {
            video_id: "v-missing".to_string(),
        },
    )
}

#[tokio::test]
async fn test_identical_trigger_is_dropped_while_the_action_is_live() {
    let ctx = TestContext::new().await;
    let params = delete_video_params(&ctx);

    let first = trigger_via_queue(&ctx.services, &params).await.unwrap();
    assert!(matches!(first, TriggerOutcome::Enqueued { .. }));

    ctx.clock.advance(Duration::from_secs(5 * 60));
    let second = trigger_via_queue(&ctx.services, &params).await.unwrap();
    assert_eq!(
        second,
        TriggerOutcome::Duplicate {
            action_id: first.action_id().to_string()
        }
    );
    assert_eq!(ctx.queue.pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_abandoned_action_is_replaced_after_the_window() {
    let ctx = TestContext::new().await;
    let params = delete_video_params(&ctx);

    let first = trigger_via_queue(&ctx.services, &params).await.unwrap();
    ctx.clock.advance(Duration::from_secs(20 * 60));
    let second = trigger_via_queue(&ctx.services, &params).await.unwrap();

    let TriggerOutcome::Enqueued { action_id, .. } = &second else {
        panic!("expected a new action, got {second:?}");
    };
    assert_ne!(action_id, first.action_id());
    assert!(ctx.store.get_action(first.action_id()).await.unwrap().is_none());
    assert!(ctx.store.get_action(action_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_different_parameters_are_different_actions() {
    let ctx = TestContext::new().await;
    let a = trigger_via_queue(&ctx.services, &delete_video_params(&ctx))
        .await
        .unwrap();
    let b = trigger_via_queue(
        &ctx.services,
        &create_action_parameters(
            ctx.team_id.clone(),
            ActionKind::DeleteVideo {
                video_id: "v-other".to_string(),
            },
        ),
    )
    .await
    .unwrap();
    assert!(matches!(b, TriggerOutcome::Enqueued { .. }));
    assert_ne!(a.action_id(), b.action_id());
}

#[tokio::test]
async fn test_dispatch_consumes_each_item_once() {
    let ctx = TestContext::new().await;
    let outcome = trigger_via_queue(&ctx.services, &delete_video_params(&ctx))
        .await
        .unwrap();
    let TriggerOutcome::Enqueued {
        action_id,
        queue_item,
    } = outcome
    else {
        panic!("expected enqueue");
    };

    let dispatcher = ctx.dispatcher();
    // A missing video counts as already deleted.
    assert_eq!(dispatcher.dispatch(&queue_item).await, DispatchOutcome::Finished);
    assert_eq!(
        dispatcher.dispatch(&queue_item).await,
        DispatchOutcome::AlreadyConsumed
    );
    assert!(ctx.store.get_action(&action_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dispatch_drops_malformed_payloads() {
    let ctx = TestContext::new().await;
    ctx.queue
        .enqueue("extract_frames/garbage", b"{not json")
        .await
        .unwrap();
    assert_eq!(
        ctx.dispatcher().dispatch("extract_frames/garbage").await,
        DispatchOutcome::Malformed
    );
    assert!(ctx.queue.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dispatch_treats_a_removed_action_as_cancelled() {
    let ctx = TestContext::new().await;
    let TriggerOutcome::Enqueued {
        action_id,
        queue_item,
    } = trigger_via_queue(&ctx.services, &delete_video_params(&ctx))
        .await
        .unwrap()
    else {
        panic!("expected enqueue");
    };
    ctx.store.delete_action(&action_id).await.unwrap();

    assert_eq!(
        ctx.dispatcher().dispatch(&queue_item).await,
        DispatchOutcome::Cancelled
    );
}

#[tokio::test]
async fn test_continuation_keeps_its_action_and_skips_dedup() {
    let ctx = TestContext::new().await;
    let first = trigger_via_queue(&ctx.services, &delete_video_params(&ctx))
        .await
        .unwrap();

    let mut continuation = delete_video_params(&ctx);
    continuation.action_id = Some(first.action_id().to_string());
    let second = trigger_via_queue(&ctx.services, &continuation).await.unwrap();

    assert!(matches!(second, TriggerOutcome::Enqueued { .. }));
    assert_eq!(second.action_id(), first.action_id());
    assert_eq!(ctx.queue.pending().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_triggers_create_one_action() {
    let ctx = TestContext::new().await;
    let params = delete_video_params(&ctx);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let services = ctx.services.clone();
        let params = params.clone();
        tasks.push(tokio::spawn(async move {
            trigger_via_queue(&services, &params).await
        }));
    }
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }

    let enqueued: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, TriggerOutcome::Enqueued { .. }))
        .collect();
    assert_eq!(enqueued.len(), 1, "{outcomes:?}");
    let action_id = enqueued[0].action_id();
    assert!(outcomes.iter().all(|o| o.action_id() == action_id));
    assert_eq!(ctx.queue.pending().await.unwrap().len(), 1);

    let canonical = params.canonical_parameters().unwrap();
    let live = ctx
        .store
        .find_actions(&ctx.team_id, params.action_name(), &canonical)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
}
