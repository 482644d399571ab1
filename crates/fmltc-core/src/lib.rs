// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fmltc core - storage collaborators for the resumable action engine.
//!
//! This crate owns everything the action engine reads from and writes to:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       fmltc-actions                          │
//! │   trigger · resumption controller · dispatcher · handlers    │
//! └──────────────────────────────────────────────────────────────┘
//!        │                 │                 │              │
//!        ▼                 ▼                 ▼              ▼
//! ┌─────────────┐  ┌──────────────┐  ┌──────────────┐ ┌─────────────┐
//! │ Persistence │  │  BlobStore   │  │ ActionQueue  │ │ ConfigStore │
//! │  (SQLite)   │  │ (filesystem) │  │ (blob-backed)│ │ (mem/Redis) │
//! └─────────────┘  └──────────────┘  └──────────────┘ └─────────────┘
//! ```
//!
//! # Entities
//!
//! | Kind | Purpose |
//! |------|---------|
//! | `Team` | Isolation boundary, training-minutes budget |
//! | `Video` / `VideoFrame` | Uploaded video and its extracted, labeled frames |
//! | `Tracker` / `TrackerClient` | One interactive tracking session |
//! | `Dataset` / `DatasetRecordWriter` / `DatasetRecord` | TFRecord shards of labeled frames |
//! | `DatasetZip` / `DatasetZipPartition` | Downloadable zip of a dataset |
//! | `Model` / `ModelSummaryItem` | One training run and its mirrored summaries |
//! | `Action` | One resumable unit of deferred work |
//!
//! Progress counters are only ever moved by single atomic statements
//! (`MAX(...)`, guarded `UPDATE ... WHERE`), which keeps duplicate and resumed
//! invocations idempotent.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FMLTC_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `FMLTC_BLOB_ROOT` | No | `.data/blobs` | Blob store root directory |
//! | `FMLTC_BLOB_BASE_URL` | No | `http://localhost:8080/blobs` | Base of signed URLs |
//! | `FMLTC_BLOB_SIGNING_KEY` | Yes | - | HMAC key for signed URLs |
//! | `FMLTC_REDIS_URL` | No | - | Redis config store (in-memory when unset) |
//! | `FMLTC_ACTION_TIME_BUDGET_SECS` | No | `500` | Wall-clock budget per invocation |
//! | `FMLTC_ACTIVE_MEMORY_LIMIT_MB` | No | `2000` | Memory ceiling per invocation |
//! | `FMLTC_WORKER_CONCURRENCY` | No | `4` | Concurrent invocations |

#![deny(missing_docs)]

/// Blob storage for videos, frames, records, zips and model artifacts.
pub mod blob;

/// Wall clock abstraction.
pub mod clock;

/// Configuration loaded from environment variables.
pub mod config;

/// Runtime-tunable settings (in-memory or Redis-backed).
pub mod config_store;

/// Error types with error-class mapping.
pub mod error;

/// Runtime-tunable limits loaded from the config store.
pub mod limits;

/// Typed entity records and the transactional entity store.
pub mod persistence;

/// Blob-backed queue carrying action payloads.
pub mod queue;

pub use config::Config;
pub use error::{CoreError, Result};
