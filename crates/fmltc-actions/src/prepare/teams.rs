// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Teams and training-minute administration.

use fmltc_core::persistence::Team;
use tracing::info;

use crate::action::{ActionKind, create_action_parameters};
use crate::error::{ActionError, Result};
use crate::services::ActionServices;
use crate::trigger::{TriggerOutcome, trigger_via_queue};

/// Find the team for `team_key`, creating it with the default training
/// budget on first use.
pub async fn get_or_create_team(services: &ActionServices, team_key: &str) -> Result<Team> {
    if team_key.trim().is_empty() {
        return Err(ActionError::validation("team_key", "must not be empty"));
    }
    let limits = services.limits().await?;
    let team = services
        .store
        .get_or_create_team(team_key, limits.default_training_minutes, services.clock.now())
        .await?;
    Ok(team)
}

/// Trigger a reset of every team's training budget to `minutes`.
pub async fn reset_remaining_training_minutes(
    services: &ActionServices,
    requested_by: &str,
    minutes: i64,
) -> Result<TriggerOutcome> {
    if minutes < 0 {
        return Err(ActionError::validation("minutes", "must not be negative"));
    }
    let params = create_action_parameters(
        requested_by,
        ActionKind::ResetRemainingTrainingMinutes { minutes },
    );
    let outcome = trigger_via_queue(services, &params).await?;
    info!(requested_by, minutes, action_id = %outcome.action_id(), "Training minute reset requested");
    Ok(outcome)
}

/// Trigger adding `delta` minutes to every team's training budget.
pub async fn increment_remaining_training_minutes(
    services: &ActionServices,
    requested_by: &str,
    delta: i64,
) -> Result<TriggerOutcome> {
    if delta == 0 {
        return Err(ActionError::validation("delta", "must not be zero"));
    }
    let params = create_action_parameters(
        requested_by,
        ActionKind::IncrementRemainingTrainingMinutes { delta },
    );
    let outcome = trigger_via_queue(services, &params).await?;
    info!(requested_by, delta, action_id = %outcome.action_id(), "Training minute increment requested");
    Ok(outcome)
}
