// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fmltc actions - resumable long-running work for the fmltc backend.
//!
//! Request handlers never do heavy work inline. They call a prepare function
//! which validates the request, records the entity and triggers an action.
//! The action runs later on a worker, under a wall-clock and memory budget,
//! and schedules its own successor when it is about to run out.
//!
//! ```text
//!   prepare::*  ──trigger_via_queue──►  ActionQueue  ──►  ActionWorker
//!                     │                                      │
//!                     ▼                                      ▼
//!               Action record  ◄──────────────────  ActionDispatcher
//!                                                            │
//!                                                            ▼
//!                                              handlers::* (Invocation)
//!                                                 │ retrigger_now
//!                                                 └──► trigger_via_queue
//! ```
//!
//! # Actions
//!
//! | Action | Work |
//! |--------|------|
//! | `extract_frames` | Decode an uploaded video into JPEG frames |
//! | `dataset_produce` | Split labeled frames and trigger one action per shard |
//! | `dataset_produce_record` | Write one TFRecord shard |
//! | `dataset_zip` | Zip one partition of a dataset download |
//! | `monitor_training` | Poll training jobs, mirror summaries, settle minutes |
//! | `tracking` | Advance an interactive object tracking session |
//! | `delete_video` / `delete_dataset` / `delete_model` | Remove data in steps |
//! | `reset_remaining_training_minutes` / `increment_remaining_training_minutes` | Team budget administration |
//!
//! # Resumption
//!
//! Handlers report progress after each unit of work through
//! [`Invocation::retrigger_if_necessary`]. Once less than
//! [`resumption::RETRIGGER_HEADROOM`] of the budget remains, or memory use
//! crosses the ceiling, the invocation enqueues a copy of its parameters and
//! answers [`Checkpoint::Suspend`]. Progress lives in the entity store, so
//! the successor picks up where the predecessor stopped.

#![deny(missing_docs)]

/// Action kinds, parameters and metrics.
pub mod action;

/// Blob naming scheme.
pub mod blob_names;

/// Runs one queue item to completion or suspension.
pub mod dispatcher;

/// Error types with error-class mapping.
pub mod error;

/// Action bodies.
pub mod handlers;

/// Request-side entry points that validate, record and trigger.
pub mod prepare;

/// Per-invocation budget tracking and retriggering.
pub mod resumption;

/// Shared collaborators.
pub mod services;

/// Managed training job service.
pub mod training;

/// Deduplicating action trigger.
pub mod trigger;

/// Queue consumer.
pub mod worker;

pub use action::{ActionKind, ActionParameters, create_action_parameters};
pub use dispatcher::{ActionDispatcher, DispatchOutcome};
pub use error::{ActionError, Result};
pub use resumption::{Checkpoint, Invocation};
pub use services::{ActionServices, ActionSettings};
pub use trigger::{TriggerOutcome, trigger_via_queue};
pub use worker::{ActionWorker, ActionWorkerConfig};
