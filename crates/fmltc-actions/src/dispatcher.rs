// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action dispatcher.
//!
//! Turns one queue item into one invocation: consume the item, start the
//! action, run its handler and, unless the handler scheduled a successor,
//! finish the action and log its metrics. Nothing escapes as an error; every
//! path ends in a [`DispatchOutcome`].

use tracing::{debug, error, info, instrument, warn};

use crate::action::{ActionMetrics, ActionParameters};
use crate::handlers;
use crate::resumption::Invocation;
use crate::services::ActionServices;

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another consumer took the item first.
    AlreadyConsumed,
    /// The payload could not be parsed; it was dropped.
    Malformed,
    /// The action record no longer exists.
    Cancelled,
    /// The handler scheduled a successor.
    Retriggered,
    /// The action ran to completion and was removed.
    Finished,
    /// The handler failed; the action was removed.
    Failed,
}

/// Runs queue items.
#[derive(Clone)]
pub struct ActionDispatcher {
    services: ActionServices,
}

impl ActionDispatcher {
    /// Dispatcher over `services`.
    pub fn new(services: ActionServices) -> Self {
        Self { services }
    }

    /// Collaborators of dispatched handlers.
    pub fn services(&self) -> &ActionServices {
        &self.services
    }

    /// Run queue item `queue_item`.
    #[instrument(
        skip(self),
        fields(
            action_name = tracing::field::Empty,
            action_id = tracing::field::Empty
        )
    )]
    pub async fn dispatch(&self, queue_item: &str) -> DispatchOutcome {
        let payload = match self.services.queue.dequeue_and_delete(queue_item).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("Queue item already consumed");
                return DispatchOutcome::AlreadyConsumed;
            }
            Err(e) => {
                error!(error = %e, "Failed to dequeue action");
                return DispatchOutcome::Failed;
            }
        };

        let params = match ActionParameters::from_payload(&payload) {
            Ok(params) => params,
            Err(e) => {
                error!(error = %e, "Dropping malformed action payload");
                return DispatchOutcome::Malformed;
            }
        };
        let Some(action_id) = params.action_id.clone() else {
            error!(action_name = params.action_name(), "Dropping action payload without action id");
            return DispatchOutcome::Malformed;
        };
        let span = tracing::Span::current();
        span.record("action_name", params.action_name());
        span.record("action_id", action_id.as_str());

        match self
            .services
            .store
            .record_action_start(&action_id, self.services.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("Action record is gone, treating the action as cancelled");
                return DispatchOutcome::Cancelled;
            }
            Err(e) => {
                error!(error = %e, "Failed to record action start");
                return DispatchOutcome::Failed;
            }
        }

        let mut inv = Invocation::new(&self.services, params);
        debug!(time_limit = %inv.time_limit(), "Invocation started");
        let failed = match handlers::run(&mut inv).await {
            Ok(_) => false,
            Err(e) => {
                error!(
                    error = %e,
                    error_class = ?e.class(),
                    retriggered = inv.retriggered(),
                    "Action failed"
                );
                true
            }
        };
        if inv.retriggered() {
            return DispatchOutcome::Retriggered;
        }

        self.finish(&action_id).await;
        if failed {
            DispatchOutcome::Failed
        } else {
            DispatchOutcome::Finished
        }
    }

    async fn finish(&self, action_id: &str) {
        let store = &self.services.store;
        if let Err(e) = store
            .record_action_stop(action_id, self.services.clock.now())
            .await
        {
            error!(error = %e, "Failed to record action stop");
        }
        match store.get_action(action_id).await {
            Ok(Some(action)) => {
                let metrics = ActionMetrics::of(&action);
                info!(
                    invocations = metrics.invocations,
                    total_ms = metrics.total_ms,
                    active_ms = metrics.active_ms,
                    wait_ms = metrics.wait_ms,
                    "Action finished"
                );
            }
            Ok(None) => debug!("Action record vanished before finishing"),
            Err(e) => error!(error = %e, "Failed to load finished action"),
        }
        if let Err(e) = store.delete_action(action_id).await {
            error!(error = %e, "Failed to delete finished action");
        }
    }
}
