// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submitting actions to the queue.

use std::time::Duration;

use fmltc_core::CoreError;
use fmltc_core::persistence::{Action, ActionClaim};
use sqlx::types::Json;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::action::ActionParameters;
use crate::services::ActionServices;

/// An identical action with activity younger than this is a duplicate.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(15 * 60);

/// What [`trigger_via_queue`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The payload was written to the queue.
    Enqueued {
        /// The action the payload belongs to.
        action_id: String,
        /// Queue item name.
        queue_item: String,
    },
    /// A live identical action exists; nothing was enqueued.
    Duplicate {
        /// The live action.
        action_id: String,
    },
}

impl TriggerOutcome {
    /// The action this trigger refers to.
    pub fn action_id(&self) -> &str {
        match self {
            TriggerOutcome::Enqueued { action_id, .. } => action_id,
            TriggerOutcome::Duplicate { action_id } => action_id,
        }
    }
}

/// Enqueue an action.
///
/// A payload without `action_id` is a new action: identical actions
/// (same owner, name and parameters) active within [`DEDUP_WINDOW`] make
/// this call a no-op, older ones are treated as abandoned and removed. A
/// payload with `action_id` is a continuation and is enqueued as is.
#[instrument(skip(services, params), fields(action_name = params.action_name(), team_id = %params.team_id))]
pub async fn trigger_via_queue(
    services: &ActionServices,
    params: &ActionParameters,
) -> Result<TriggerOutcome, CoreError> {
    let mut payload = params.clone();
    payload.time_limit = None;
    payload.retriggered = false;

    let action_id = match payload.action_id.clone() {
        Some(action_id) => action_id,
        None => {
            let canonical = payload.canonical_parameters()?;
            let now = services.clock.now();
            let window = chrono::Duration::from_std(DEDUP_WINDOW)
                .map_err(|e| CoreError::Serialization(e.to_string()))?;

            let action = Action {
                action_id: Uuid::new_v4().to_string(),
                team_id: payload.team_id.clone(),
                action_name: payload.action_name().to_string(),
                is_admin_action: payload.is_admin_action,
                parameters: canonical,
                create_time: now,
                start_times: Json(Vec::new()),
                stop_times: Json(Vec::new()),
            };
            if let ActionClaim::Live(live) =
                services.store.claim_action(&action, now - window).await?
            {
                debug!(action_id = %live.action_id, "Identical action is live, dropping trigger");
                return Ok(TriggerOutcome::Duplicate {
                    action_id: live.action_id,
                });
            }
            info!(action_id = %action.action_id, "Action created");
            payload.action_id = Some(action.action_id.clone());
            action.action_id
        }
    };

    let queue_item = format!("{}/{}", payload.action_name(), Uuid::new_v4());
    services
        .queue
        .enqueue(&queue_item, &payload.to_payload()?)
        .await?;
    debug!(action_id = %action_id, queue_item = %queue_item, "Action enqueued");

    Ok(TriggerOutcome::Enqueued {
        action_id,
        queue_item,
    })
}
