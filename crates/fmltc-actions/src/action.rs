// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action payloads.
//!
//! An action payload is a flat JSON object:
//!
//! ```json
//! {"team_id": "t1", "action_id": "…", "is_admin_action": false,
//!  "action_name": "extract_frames", "video_id": "…"}
//! ```
//!
//! `action_name` selects the [`ActionKind`] variant and the remaining keys are
//! that variant's fields. `time_limit` and `retriggered` belong to a single
//! invocation and are never written to the queue or the entity store.

use chrono::{DateTime, Utc};
use fmltc_core::CoreError;
use fmltc_core::persistence::Action;
use serde::{Deserialize, Serialize};

/// A frame going into a dataset shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRef {
    /// Video.
    pub video_id: String,
    /// Frame within the video.
    pub frame_number: i64,
}

/// Every kind of action, with its typed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_name", rename_all = "snake_case")]
pub enum ActionKind {
    /// Count, validate and extract the frames of an uploaded video.
    ExtractFrames {
        /// Video to extract.
        video_id: String,
    },
    /// Split a dataset's frames into shards and trigger one action per shard.
    DatasetProduce {
        /// Dataset to produce.
        dataset_id: String,
    },
    /// Write one TFRecord shard.
    DatasetProduceRecord {
        /// Dataset the shard belongs to.
        dataset_id: String,
        /// Shard number; evaluation shards are numbered first.
        record_number: i64,
        /// Shard belongs to the evaluation split.
        is_eval: bool,
        /// Frames in shard order.
        frames: Vec<FrameRef>,
    },
    /// Write one zip partition of a dataset export.
    DatasetZip {
        /// Zip job.
        dataset_zip_id: String,
        /// Partition to write.
        partition_index: i64,
    },
    /// Follow a training run until both of its jobs are over.
    MonitorTraining {
        /// Model being trained.
        model_id: String,
    },
    /// Run an interactive tracking session.
    Tracking {
        /// Session.
        tracker_id: String,
    },
    /// Remove a soft-deleted video's blobs and entities.
    DeleteVideo {
        /// Video.
        video_id: String,
    },
    /// Remove a soft-deleted dataset's blobs and entities.
    DeleteDataset {
        /// Dataset.
        dataset_id: String,
    },
    /// Remove a soft-deleted model's blobs and entities.
    DeleteModel {
        /// Model.
        model_id: String,
    },
    /// Set every team's training budget.
    ResetRemainingTrainingMinutes {
        /// New budget.
        minutes: i64,
    },
    /// Add to every team's training budget.
    IncrementRemainingTrainingMinutes {
        /// Minutes to add (may be negative).
        delta: i64,
    },
}

impl ActionKind {
    /// Wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::ExtractFrames { .. } => "extract_frames",
            ActionKind::DatasetProduce { .. } => "dataset_produce",
            ActionKind::DatasetProduceRecord { .. } => "dataset_produce_record",
            ActionKind::DatasetZip { .. } => "dataset_zip",
            ActionKind::MonitorTraining { .. } => "monitor_training",
            ActionKind::Tracking { .. } => "tracking",
            ActionKind::DeleteVideo { .. } => "delete_video",
            ActionKind::DeleteDataset { .. } => "delete_dataset",
            ActionKind::DeleteModel { .. } => "delete_model",
            ActionKind::ResetRemainingTrainingMinutes { .. } => "reset_remaining_training_minutes",
            ActionKind::IncrementRemainingTrainingMinutes { .. } => {
                "increment_remaining_training_minutes"
            }
        }
    }

    /// Admin actions operate on all teams rather than their owner's data.
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            ActionKind::ResetRemainingTrainingMinutes { .. }
                | ActionKind::IncrementRemainingTrainingMinutes { .. }
        )
    }
}

/// The full payload of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParameters {
    /// Owner.
    pub team_id: String,
    /// Assigned by the trigger when the action record is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Derived from the kind.
    #[serde(default)]
    pub is_admin_action: bool,
    /// What to do.
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Deadline of the current invocation.
    #[serde(skip)]
    pub time_limit: Option<DateTime<Utc>>,
    /// The current invocation already scheduled its successor.
    #[serde(skip)]
    pub retriggered: bool,
}

/// Payload for a new action of `kind` owned by `team_id`.
pub fn create_action_parameters(team_id: impl Into<String>, kind: ActionKind) -> ActionParameters {
    ActionParameters {
        team_id: team_id.into(),
        action_id: None,
        is_admin_action: kind.is_admin(),
        kind,
        time_limit: None,
        retriggered: false,
    }
}

impl ActionParameters {
    /// Wire name of the action.
    pub fn action_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Canonical form of the kind-specific parameters. Two triggers with
    /// equal owner, name and canonical parameters are the same action.
    pub fn canonical_parameters(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(&self.kind)?)
    }

    /// Queue payload. Invocation-local fields are left out.
    pub fn to_payload(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a queue payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Timing of a finished action, derived from its start and stop times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionMetrics {
    /// Number of invocations.
    pub invocations: usize,
    /// Creation to last stop.
    pub total_ms: i64,
    /// Sum of invocation run times.
    pub active_ms: i64,
    /// Time spent queued between creation and invocations.
    pub wait_ms: i64,
}

impl ActionMetrics {
    /// Metrics of `action`, whose last invocation has already stopped.
    pub fn of(action: &Action) -> Self {
        let starts = &action.start_times.0;
        let stops = &action.stop_times.0;
        let active_ms = starts
            .iter()
            .zip(stops.iter())
            .map(|(start, stop)| (stop - start).max(0))
            .sum();
        let created = action.create_time.timestamp_millis();
        let total_ms = stops
            .last()
            .or(starts.last())
            .map(|end| (end - created).max(0))
            .unwrap_or(0);
        Self {
            invocations: starts.len(),
            total_ms,
            active_ms,
            wait_ms: (total_ms - active_ms).max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::types::Json;

    #[test]
    fn payload_is_flat_and_skips_invocation_fields() {
        let mut params = create_action_parameters(
            "team-1",
            ActionKind::ExtractFrames {
                video_id: "v1".to_string(),
            },
        );
        params.action_id = Some("a1".to_string());
        params.time_limit = Some(Utc::now());
        params.retriggered = true;

        let value: serde_json::Value =
            serde_json::from_slice(&params.to_payload().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "team_id": "team-1",
                "action_id": "a1",
                "is_admin_action": false,
                "action_name": "extract_frames",
                "video_id": "v1",
            })
        );

        let parsed = ActionParameters::from_payload(&params.to_payload().unwrap()).unwrap();
        assert_eq!(parsed.kind, params.kind);
        assert_eq!(parsed.time_limit, None);
        assert!(!parsed.retriggered);
    }

    #[test]
    fn invocation_fields_in_a_payload_are_ignored() {
        let payload = serde_json::json!({
            "team_id": "team-1",
            "action_id": "a1",
            "action_name": "extract_frames",
            "video_id": "v1",
            "time_limit": "2099-01-01T00:00:00Z",
            "retriggered": true,
        });
        let parsed =
            ActionParameters::from_payload(&serde_json::to_vec(&payload).unwrap()).unwrap();
        assert_eq!(
            parsed.kind,
            ActionKind::ExtractFrames {
                video_id: "v1".to_string()
            }
        );
        assert_eq!(parsed.time_limit, None);
        assert!(!parsed.retriggered);
    }

    #[test]
    fn admin_flag_follows_kind() {
        let params = create_action_parameters(
            "admin",
            ActionKind::ResetRemainingTrainingMinutes { minutes: 90 },
        );
        assert!(params.is_admin_action);
        assert_eq!(params.action_name(), "reset_remaining_training_minutes");
        assert!(
            !create_action_parameters(
                "t",
                ActionKind::DeleteModel {
                    model_id: "m".into()
                }
            )
            .is_admin_action
        );
    }

    #[test]
    fn unknown_action_name_is_rejected() {
        let err = ActionParameters::from_payload(
            br#"{"team_id":"t","action_name":"launch_rockets","target":"moon"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Serialization(_)));
    }

    #[test]
    fn serde_names_match_kind_names() {
        let kinds = vec![
            ActionKind::DatasetProduceRecord {
                dataset_id: "d".into(),
                record_number: 3,
                is_eval: false,
                frames: vec![FrameRef {
                    video_id: "v".into(),
                    frame_number: 1,
                }],
            },
            ActionKind::DatasetZip {
                dataset_zip_id: "z".into(),
                partition_index: 0,
            },
            ActionKind::MonitorTraining {
                model_id: "m".into(),
            },
            ActionKind::Tracking {
                tracker_id: "tr".into(),
            },
            ActionKind::IncrementRemainingTrainingMinutes { delta: -5 },
        ];
        for kind in kinds {
            let value = serde_json::to_value(&kind).unwrap();
            assert_eq!(value["action_name"], kind.name());
        }
    }

    #[test]
    fn metrics_from_start_and_stop_times() {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let ms = created.timestamp_millis();
        let action = Action {
            action_id: "a".into(),
            team_id: "t".into(),
            action_name: "extract_frames".into(),
            is_admin_action: false,
            parameters: "{}".into(),
            create_time: created,
            // Two invocations of 10 s each, queued 5 s before each.
            start_times: Json(vec![ms + 5_000, ms + 20_000]),
            stop_times: Json(vec![ms + 15_000, ms + 30_000]),
        };
        let metrics = ActionMetrics::of(&action);
        assert_eq!(metrics.invocations, 2);
        assert_eq!(metrics.total_ms, 30_000);
        assert_eq!(metrics.active_ms, 20_000);
        assert_eq!(metrics.wait_ms, 10_000);
    }
}
