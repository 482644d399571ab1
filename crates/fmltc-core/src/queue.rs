// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action queue.
//!
//! Each queue item is one blob under `action_queue/`. Delivery is
//! at-least-once: the name of every enqueued item is pushed to a local
//! notification channel, and items still present at startup are redelivered
//! via [`ActionQueue::pending`]. Consumption is exactly-once because
//! [`ActionQueue::dequeue_and_delete`] rides on [`BlobStore::take`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::blob::BlobStore;
use crate::error::Result;

/// Blob name prefix of queue items.
pub const QUEUE_PREFIX: &str = "action_queue/";

/// Queue of serialized action payloads.
#[async_trait]
pub trait ActionQueue: Send + Sync {
    /// Store `payload` under `name` and notify consumers.
    async fn enqueue(&self, name: &str, payload: &[u8]) -> Result<()>;

    /// Fetch and delete an item. `None` when it was already consumed.
    async fn dequeue_and_delete(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Names of all items not yet consumed.
    async fn pending(&self) -> Result<Vec<String>>;
}

/// [`ActionQueue`] stored in a [`BlobStore`].
pub struct BlobActionQueue {
    blobs: Arc<dyn BlobStore>,
    notify_tx: mpsc::UnboundedSender<String>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl BlobActionQueue {
    /// Create a queue over `blobs`.
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            blobs,
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    /// Take the notification receiver. Only the first caller gets it.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.notify_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

fn blob_name(name: &str) -> String {
    format!("{QUEUE_PREFIX}{name}")
}

#[async_trait]
impl ActionQueue for BlobActionQueue {
    async fn enqueue(&self, name: &str, payload: &[u8]) -> Result<()> {
        self.blobs
            .upload(&blob_name(name), payload, "application/json")
            .await?;
        if self.notify_tx.send(name.to_string()).is_err() {
            // Nobody listening; the item is picked up on the next startup.
            warn!(item = %name, "Queue item enqueued without an active consumer");
        }
        debug!(item = %name, size = payload.len(), "Enqueued action");
        Ok(())
    }

    async fn dequeue_and_delete(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.blobs.take(&blob_name(name)).await
    }

    async fn pending(&self) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .list(QUEUE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|n| n.strip_prefix(QUEUE_PREFIX).map(str::to_string))
            .collect())
    }
}
