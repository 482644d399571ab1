// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admin actions over all teams.
//!
//! Each team remembers the last admin action applied to it, so a resumed
//! invocation walking the teams again skips the ones already done.

use fmltc_core::CoreError;
use tracing::{debug, info};

use crate::error::Result;
use crate::resumption::{Checkpoint, Invocation};

/// Set every team's remaining training minutes to `minutes`.
pub async fn reset_remaining_training_minutes(
    inv: &mut Invocation<'_>,
    minutes: i64,
) -> Result<Checkpoint> {
    let services = inv.services();
    let action_id = admin_action_id(inv)?;
    let mut applied = 0usize;
    for team_id in services.store.list_team_ids().await? {
        if services
            .store
            .admin_reset_training_minutes(&team_id, minutes, &action_id)
            .await?
        {
            applied += 1;
        } else {
            debug!(team_id = %team_id, "Reset already applied");
            continue;
        }
        if inv.retrigger_if_necessary().await?.is_suspend() {
            return Ok(Checkpoint::Suspend);
        }
    }
    info!(minutes, teams = applied, "Remaining training minutes reset");
    Ok(Checkpoint::Continue)
}

/// Add `delta` to every team's remaining training minutes.
pub async fn increment_remaining_training_minutes(
    inv: &mut Invocation<'_>,
    delta: i64,
) -> Result<Checkpoint> {
    let services = inv.services();
    let action_id = admin_action_id(inv)?;
    let mut applied = 0usize;
    for team_id in services.store.list_team_ids().await? {
        if services
            .store
            .admin_increment_training_minutes(&team_id, delta, &action_id)
            .await?
        {
            applied += 1;
        } else {
            debug!(team_id = %team_id, "Increment already applied");
            continue;
        }
        if inv.retrigger_if_necessary().await?.is_suspend() {
            return Ok(Checkpoint::Suspend);
        }
    }
    info!(delta, teams = applied, "Remaining training minutes incremented");
    Ok(Checkpoint::Continue)
}

fn admin_action_id(inv: &Invocation<'_>) -> Result<String> {
    inv.params().action_id.clone().ok_or_else(|| {
        CoreError::validation("action_id", "admin actions run with an assigned action id").into()
    })
}
