// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue consumer.
//!
//! Receives queue item names from the queue's notification channel and
//! dispatches each on its own task, at most `concurrency` at a time. Items
//! left in the queue (from before a restart, or enqueued while nobody was
//! listening) are picked up by a periodic redelivery sweep that also runs
//! once at startup. A duplicate delivery is harmless: only one dispatch can
//! consume an item.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::dispatcher::{ActionDispatcher, DispatchOutcome};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct ActionWorkerConfig {
    /// Invocations running at the same time.
    pub concurrency: usize,
    /// How often undelivered queue items are swept up.
    pub redeliver_interval: Duration,
}

impl Default for ActionWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            redeliver_interval: Duration::from_secs(60),
        }
    }
}

/// Background queue consumer.
pub struct ActionWorker {
    dispatcher: Arc<ActionDispatcher>,
    receiver: UnboundedReceiver<String>,
    config: ActionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl ActionWorker {
    /// Create a worker reading notifications from `receiver`.
    pub fn new(
        dispatcher: ActionDispatcher,
        receiver: UnboundedReceiver<String>,
        config: ActionWorkerConfig,
    ) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            receiver,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled, then wait for running invocations.
    /// Items still waiting for a slot stay in the queue.
    pub async fn run(mut self) {
        let concurrency = self.config.concurrency.max(1);
        info!(
            concurrency,
            redeliver_interval_secs = self.config.redeliver_interval.as_secs(),
            "Action worker started"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<Option<DispatchOutcome>> = JoinSet::new();
        let mut redeliver = tokio::time::interval(self.config.redeliver_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Action worker shutting down");
                    break;
                }
                _ = redeliver.tick() => {
                    match self.dispatcher.services().queue.pending().await {
                        Ok(items) => {
                            if !items.is_empty() {
                                debug!(count = items.len(), "Redelivering queue items");
                            }
                            for item in items {
                                self.spawn(&mut tasks, &semaphore, item);
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to list pending queue items"),
                    }
                }
                item = self.receiver.recv() => {
                    match item {
                        Some(item) => self.spawn(&mut tasks, &semaphore, item),
                        None => {
                            info!("Queue notifications closed");
                            break;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_joined(joined);
                }
            }
        }

        semaphore.close();
        while let Some(joined) = tasks.join_next().await {
            log_joined(joined);
        }
        info!("Action worker stopped");
    }

    fn spawn(
        &self,
        tasks: &mut JoinSet<Option<DispatchOutcome>>,
        semaphore: &Arc<Semaphore>,
        item: String,
    ) {
        let dispatcher = self.dispatcher.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            Some(dispatcher.dispatch(&item).await)
        });
    }
}

fn log_joined(joined: Result<Option<DispatchOutcome>, tokio::task::JoinError>) {
    match joined {
        Ok(Some(outcome)) => debug!(?outcome, "Dispatch finished"),
        Ok(None) => debug!("Dispatch skipped at shutdown"),
        Err(e) => error!(error = %e, "Dispatch task panicked"),
    }
}
