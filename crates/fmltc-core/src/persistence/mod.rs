// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity records and the entity store interface.
//!
//! Every entity except [`Action`] is scoped by `team_id`; team-scoped lookups
//! with a mismatched team behave exactly like lookups of a missing entity and
//! return [`CoreError::NotFound`].

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::error::CoreError;

/// Per-label box counts of a shard.
pub type LabelCounts = BTreeMap<String, i64>;

/// Team record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Team {
    /// Unique identifier.
    pub team_id: String,
    /// External identity (program/team name/team number).
    pub team_key: String,
    /// Opaque UI preferences (JSON text).
    pub preferences: String,
    /// Training minutes left to spend.
    pub remaining_training_minutes: i64,
    /// Most recently uploaded video.
    pub last_video_id: Option<String>,
    /// Last admin bulk action applied to this team.
    pub last_admin_action_id: Option<String>,
    /// When the team was first seen.
    pub create_time: DateTime<Utc>,
}

/// Video record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Video {
    /// Unique identifier.
    pub video_id: String,
    /// Owning team.
    pub team_id: String,
    /// User-supplied description.
    pub description: String,
    /// Original file name.
    pub video_filename: String,
    /// Upload size in bytes.
    pub file_size: i64,
    /// Upload content type.
    pub content_type: String,
    /// Blob holding the video bytes.
    pub blob_name: String,
    /// Upload time.
    pub create_time: DateTime<Utc>,
    /// When extraction was requested.
    pub frame_extraction_triggered_time: Option<DateTime<Utc>>,
    /// When the first extraction invocation started.
    pub frame_extraction_start_time: Option<DateTime<Utc>>,
    /// When extraction finished (successfully or not).
    pub frame_extraction_end_time: Option<DateTime<Utc>>,
    /// Frame width, once known.
    pub width: Option<i64>,
    /// Frame height, once known.
    pub height: Option<i64>,
    /// Frames per second, once known.
    pub fps: Option<f64>,
    /// Number of frames, once counted.
    pub frame_count: Option<i64>,
    /// Frames extracted so far (monotonic).
    pub extracted_frame_count: i64,
    /// Frames marked for inclusion in datasets.
    pub included_frame_count: i64,
    /// Frames with at least one box.
    pub labeled_frame_count: i64,
    /// Extraction failed terminally.
    pub frame_extraction_failed: bool,
    /// Why extraction failed.
    pub frame_extraction_error_message: Option<String>,
    /// A tracking session is running on this video.
    pub tracking_in_progress: bool,
    /// The running tracking session.
    pub tracker_id: Option<String>,
    /// Soft-deleted, blob cleanup pending.
    pub delete_in_progress: bool,
}

impl Video {
    /// Extraction has reached its final state.
    pub fn frame_extraction_done(&self) -> bool {
        self.frame_extraction_failed || self.frame_extraction_end_time.is_some()
    }
}

/// Input for [`Persistence::create_video`].
#[derive(Debug, Clone)]
pub struct NewVideo {
    /// Unique identifier.
    pub video_id: String,
    /// Owning team.
    pub team_id: String,
    /// User-supplied description.
    pub description: String,
    /// Original file name.
    pub video_filename: String,
    /// Upload size in bytes.
    pub file_size: i64,
    /// Upload content type.
    pub content_type: String,
    /// Blob the client uploads to.
    pub blob_name: String,
}

/// Video frame record, keyed by (`video_id`, `frame_number`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VideoFrame {
    /// Video this frame belongs to.
    pub video_id: String,
    /// Zero-based frame index.
    pub frame_number: i64,
    /// Owning team.
    pub team_id: String,
    /// Extracted JPEG, set once extracted.
    pub image_blob_name: Option<String>,
    /// Content type of the extracted image.
    pub content_type: Option<String>,
    /// Bounding boxes, one `x1,y1,x2,y2,label` per line.
    pub bboxes_text: String,
    /// Include this frame when producing datasets.
    pub include_frame_in_dataset: bool,
}

/// Server side of a tracking session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tracker {
    /// Unique identifier.
    pub tracker_id: String,
    /// Owning team.
    pub team_id: String,
    /// Tracked video.
    pub video_id: String,
    /// Tracking algorithm name.
    pub tracker_name: String,
    /// Frame the server last produced boxes for.
    pub frame_number: i64,
    /// Boxes the server produced for `frame_number`.
    pub bboxes_text: String,
    /// The session ended with an error.
    pub tracking_failed: bool,
    /// Last server update.
    pub update_time: DateTime<Utc>,
}

/// Client side of a tracking session.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrackerClient {
    /// Session identifier.
    pub tracker_id: String,
    /// Frame the client last acknowledged.
    pub frame_number: i64,
    /// Boxes the client acknowledged (possibly adjusted).
    pub bboxes_text: String,
    /// The client asked the session to stop.
    pub tracking_stop_requested: bool,
    /// Last client update.
    pub update_time: DateTime<Utc>,
}

/// Dataset record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Dataset {
    /// Unique identifier.
    pub dataset_id: String,
    /// Owning team.
    pub team_id: String,
    /// User-supplied description.
    pub description: String,
    /// Source videos.
    pub video_ids: Json<Vec<String>>,
    /// Share of frames used for evaluation.
    pub eval_percent: f64,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// All labels, sorted.
    pub sorted_label_list: Json<Vec<String>>,
    /// Frames in the training split.
    pub train_frame_count: i64,
    /// Shards in the training split.
    pub train_record_count: i64,
    /// Frames in the evaluation split.
    pub eval_frame_count: i64,
    /// Shards in the evaluation split.
    pub eval_record_count: i64,
    /// Shards expected in total.
    pub total_record_count: i64,
    /// Label map, written on completion.
    pub label_map_blob_name: Option<String>,
    /// All shards are written.
    pub dataset_completed: bool,
    /// Soft-deleted, blob cleanup pending.
    pub delete_in_progress: bool,
}

/// Input for [`Persistence::create_dataset`].
#[derive(Debug, Clone)]
pub struct NewDataset {
    /// Unique identifier.
    pub dataset_id: String,
    /// Owning team.
    pub team_id: String,
    /// User-supplied description.
    pub description: String,
    /// Source videos.
    pub video_ids: Vec<String>,
    /// Share of frames used for evaluation.
    pub eval_percent: f64,
}

/// How the included frames of a dataset were split into shards.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit {
    /// All labels, sorted.
    pub sorted_label_list: Vec<String>,
    /// Frames in the training split.
    pub train_frame_count: i64,
    /// Shards in the training split.
    pub train_record_count: i64,
    /// Frames in the evaluation split.
    pub eval_frame_count: i64,
    /// Shards in the evaluation split.
    pub eval_record_count: i64,
}

/// Progress of one shard being written.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DatasetRecordWriter {
    /// Dataset.
    pub dataset_id: String,
    /// Shard number within the dataset.
    pub record_number: i64,
    /// Shard belongs to the evaluation split.
    pub is_eval: bool,
    /// Frames processed so far (UI progress, monotonic).
    pub frames_written: i64,
    /// Frames contained in the checkpointed partial shard.
    pub resume_frame_count: i64,
    /// Blob holding the partial shard.
    pub partial_blob_name: Option<String>,
    /// Label counts of the partial shard.
    pub label_counts: Json<LabelCounts>,
    /// Frames without boxes in the partial shard.
    pub negative_frame_count: i64,
    /// Last update.
    pub update_time: DateTime<Utc>,
}

/// A finished shard.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DatasetRecord {
    /// Dataset.
    pub dataset_id: String,
    /// Shard number within the dataset.
    pub record_number: i64,
    /// Shard belongs to the evaluation split.
    pub is_eval: bool,
    /// Blob holding the TFRecord file.
    pub tf_record_blob_name: String,
    /// Boxes per label.
    pub label_counts: Json<LabelCounts>,
    /// Frames without boxes.
    pub negative_frame_count: i64,
    /// When the shard was finished.
    pub create_time: DateTime<Utc>,
}

/// A zip export of a dataset.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DatasetZip {
    /// Unique identifier.
    pub dataset_zip_id: String,
    /// Owning team.
    pub team_id: String,
    /// Exported dataset.
    pub dataset_id: String,
    /// Number of partitions.
    pub partition_count: i64,
    /// Creation time.
    pub create_time: DateTime<Utc>,
}

/// One zip file of a [`DatasetZip`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DatasetZipPartition {
    /// Zip job.
    pub dataset_zip_id: String,
    /// Partition number.
    pub partition_index: i64,
    /// Blobs stored in this partition, in order.
    pub file_names: Json<Vec<String>>,
    /// Number of files in this partition.
    pub file_count: i64,
    /// Files written so far (UI progress, monotonic).
    pub files_written: i64,
    /// Files contained in the checkpointed partial zip.
    pub resume_file_count: i64,
    /// Blob holding the partial zip.
    pub partial_blob_name: Option<String>,
    /// Blob the finished zip is stored in.
    pub zip_blob_name: String,
    /// The zip is finished.
    pub completed: bool,
}

/// Model (training run) record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Model {
    /// Unique identifier.
    pub model_id: String,
    /// Owning team.
    pub team_id: String,
    /// User-supplied description.
    pub description: String,
    /// Training datasets.
    pub dataset_ids: Json<Vec<String>>,
    /// Pretrained checkpoint training starts from.
    pub starting_model: String,
    /// Requested training steps.
    pub num_training_steps: i64,
    /// Upper bound of the training job's run time.
    pub max_running_minutes: i64,
    /// Minutes reserved from the team budget at start.
    pub reserved_training_minutes: i64,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Training job name in the training service.
    pub train_job_name: String,
    /// Evaluation job name, if one was submitted.
    pub eval_job_name: Option<String>,
    /// Last observed training job state.
    pub train_job_state: String,
    /// Last observed evaluation job state.
    pub eval_job_state: Option<String>,
    /// Training job error, if any.
    pub train_error_message: Option<String>,
    /// Evaluation job error, if any.
    pub eval_error_message: Option<String>,
    /// When the training job started running.
    pub train_job_start_time: Option<DateTime<Utc>>,
    /// When the training job ended.
    pub train_job_end_time: Option<DateTime<Utc>>,
    /// Minutes charged once training ended.
    pub training_minutes_charged: Option<i64>,
    /// Highest step seen in any summary (monotonic).
    pub trained_steps: i64,
    /// When monitoring was requested.
    pub monitor_training_triggered_time: Option<DateTime<Utc>>,
    /// Total time spent in monitor invocations.
    pub monitor_training_active_time_ms: i64,
    /// Monitoring is over.
    pub monitor_training_finished: bool,
    /// Event file blob name to the update time it was last parsed at.
    pub dict_event_file_path_to_updated: Json<BTreeMap<String, DateTime<Utc>>>,
    /// The user asked to cancel training.
    pub cancel_requested: bool,
    /// Soft-deleted, blob cleanup pending.
    pub delete_in_progress: bool,
}

/// Input for [`Persistence::create_model`].
#[derive(Debug, Clone)]
pub struct NewModel {
    /// Unique identifier.
    pub model_id: String,
    /// Owning team.
    pub team_id: String,
    /// User-supplied description.
    pub description: String,
    /// Training datasets.
    pub dataset_ids: Vec<String>,
    /// Pretrained checkpoint.
    pub starting_model: String,
    /// Requested training steps.
    pub num_training_steps: i64,
    /// Upper bound of the training job's run time.
    pub max_running_minutes: i64,
    /// Minutes reserved from the team budget.
    pub reserved_training_minutes: i64,
    /// Training job name.
    pub train_job_name: String,
    /// Evaluation job name.
    pub eval_job_name: Option<String>,
    /// Initial training job state.
    pub train_job_state: String,
    /// Initial evaluation job state.
    pub eval_job_state: Option<String>,
}

/// Observed training service state, written by the monitor.
#[derive(Debug, Clone, Default)]
pub struct ModelJobUpdate {
    /// Training job state.
    pub train_job_state: String,
    /// Evaluation job state.
    pub eval_job_state: Option<String>,
    /// Training job error.
    pub train_error_message: Option<String>,
    /// Evaluation job error.
    pub eval_error_message: Option<String>,
    /// Training job start.
    pub train_job_start_time: Option<DateTime<Utc>>,
    /// Training job end.
    pub train_job_end_time: Option<DateTime<Utc>>,
}

/// Kind of mirrored summary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryValueType {
    /// A scalar such as a loss.
    Scalar,
    /// An image such as an eval visualization.
    Image,
}

impl SummaryValueType {
    /// Stored string form.
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryValueType::Scalar => "scalar",
            SummaryValueType::Image => "image",
        }
    }
}

/// A summary value mirrored from training event files.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModelSummaryItem {
    /// Model.
    pub model_id: String,
    /// `train` or `eval`.
    pub job_type: String,
    /// Training step.
    pub step: i64,
    /// Summary tag.
    pub tag: String,
    /// `scalar` or `image`.
    pub value_type: String,
    /// Scalar value.
    pub value: Option<f64>,
    /// Uploaded image.
    pub image_blob_name: Option<String>,
    /// Image width.
    pub image_width: Option<i64>,
    /// Image height.
    pub image_height: Option<i64>,
    /// Last upsert.
    pub update_time: DateTime<Utc>,
}

/// A unit of deferred, resumable work.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Action {
    /// Unique identifier.
    pub action_id: String,
    /// Owning team.
    pub team_id: String,
    /// Action kind name.
    pub action_name: String,
    /// Admin actions are not tied to a single team's data.
    pub is_admin_action: bool,
    /// Canonical JSON of the payload.
    pub parameters: String,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Invocation start times (epoch millis).
    pub start_times: Json<Vec<i64>>,
    /// Invocation stop times (epoch millis), parallel to `start_times`.
    pub stop_times: Json<Vec<i64>>,
}

/// Result of [`Persistence::store_dataset_record_and_check_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Stored; other shards are still missing.
    Stored,
    /// Stored, and this was the last missing shard.
    Completed,
    /// Not stored: the dataset is gone or being deleted.
    Discarded,
}

/// Result of [`Persistence::claim_action`].
#[derive(Debug, Clone)]
pub enum ActionClaim {
    /// The new action was stored.
    Created,
    /// An identical live action already exists.
    Live(Action),
}

impl Action {
    /// Most recent of creation, last start and last stop.
    pub fn last_activity(&self) -> DateTime<Utc> {
        let latest = self
            .start_times
            .iter()
            .chain(self.stop_times.iter())
            .copied()
            .max()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        match latest {
            Some(t) if t > self.create_time => t,
            _ => self.create_time,
        }
    }
}

/// Entity store used by prepare functions and action handlers.
///
/// Progress counters are only moved by single atomic statements, so every
/// method is safe to call again from a duplicate or resumed invocation.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ----- teams -----

    /// Find the team with `team_key` or create it with `initial_minutes`.
    async fn get_or_create_team(
        &self,
        team_key: &str,
        initial_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Team, CoreError>;

    async fn get_team(&self, team_id: &str) -> Result<Team, CoreError>;

    async fn list_team_ids(&self) -> Result<Vec<String>, CoreError>;

    /// Take `minutes` from the team budget. False when the budget is short.
    async fn reserve_training_minutes(&self, team_id: &str, minutes: i64)
    -> Result<bool, CoreError>;

    /// Give minutes back (or take them, with a negative delta).
    async fn adjust_training_minutes(&self, team_id: &str, delta: i64) -> Result<(), CoreError>;

    /// Set the team budget unless `action_id` was already applied.
    async fn admin_reset_training_minutes(
        &self,
        team_id: &str,
        minutes: i64,
        action_id: &str,
    ) -> Result<bool, CoreError>;

    /// Add to the team budget unless `action_id` was already applied.
    async fn admin_increment_training_minutes(
        &self,
        team_id: &str,
        delta: i64,
        action_id: &str,
    ) -> Result<bool, CoreError>;

    // ----- videos and frames -----

    async fn create_video(&self, video: &NewVideo, now: DateTime<Utc>)
    -> Result<Video, CoreError>;

    async fn get_video(&self, team_id: &str, video_id: &str) -> Result<Video, CoreError>;

    async fn mark_frame_extraction_triggered(
        &self,
        team_id: &str,
        video_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Record the first start of extraction. Later calls keep the first time.
    async fn mark_frame_extraction_started(
        &self,
        video_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn set_video_properties(
        &self,
        video_id: &str,
        width: i64,
        height: i64,
        fps: f64,
        frame_count: i64,
    ) -> Result<(), CoreError>;

    async fn fail_frame_extraction(
        &self,
        video_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Create frame rows `0..frame_count`. Existing rows are kept.
    async fn create_video_frames(
        &self,
        team_id: &str,
        video_id: &str,
        frame_count: i64,
    ) -> Result<(), CoreError>;

    /// Attach the extracted image and raise `extracted_frame_count` to at
    /// least `frame_number + 1`. False, with nothing written, when the video
    /// is gone or being deleted.
    async fn store_extracted_frame(
        &self,
        video_id: &str,
        frame_number: i64,
        image_blob_name: &str,
        content_type: &str,
    ) -> Result<bool, CoreError>;

    /// Close extraction. When the decoder produced fewer frames than
    /// counted, `frame_count` shrinks to the extracted count and surplus
    /// frame rows are dropped.
    async fn finish_frame_extraction(
        &self,
        video_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Video, CoreError>;

    async fn get_video_frames(
        &self,
        team_id: &str,
        video_id: &str,
        min_frame_number: i64,
        max_frame_number: i64,
    ) -> Result<Vec<VideoFrame>, CoreError>;

    async fn store_frame_bboxes(
        &self,
        team_id: &str,
        video_id: &str,
        frame_number: i64,
        bboxes_text: &str,
    ) -> Result<(), CoreError>;

    async fn set_frame_included(
        &self,
        team_id: &str,
        video_id: &str,
        frame_number: i64,
        include: bool,
    ) -> Result<(), CoreError>;

    /// Extracted frames marked for inclusion, across `video_ids`, in a
    /// stable order.
    async fn included_frames(
        &self,
        team_id: &str,
        video_ids: &[String],
    ) -> Result<Vec<VideoFrame>, CoreError>;

    /// Set `delete_in_progress` and return the video as it was.
    async fn mark_video_deleting(&self, team_id: &str, video_id: &str)
    -> Result<Video, CoreError>;

    async fn delete_video_entities(&self, video_id: &str) -> Result<(), CoreError>;

    // ----- tracking -----

    /// Create the session and flag the video. False when the video already
    /// has a session running.
    async fn start_tracking(
        &self,
        tracker: &Tracker,
        client: &TrackerClient,
    ) -> Result<bool, CoreError>;

    async fn get_tracker(&self, tracker_id: &str) -> Result<Option<Tracker>, CoreError>;

    async fn get_tracker_client(&self, tracker_id: &str)
    -> Result<Option<TrackerClient>, CoreError>;

    async fn store_tracker_result(
        &self,
        tracker_id: &str,
        frame_number: i64,
        bboxes_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn set_tracking_failed(&self, tracker_id: &str) -> Result<(), CoreError>;

    /// Client acknowledgement of `frame_number`, possibly with adjusted boxes.
    async fn store_tracker_client_update(
        &self,
        tracker_id: &str,
        frame_number: i64,
        bboxes_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn request_tracking_stop(
        &self,
        tracker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Delete the session and clear the video's tracking flag.
    async fn finish_tracking(&self, video_id: &str, tracker_id: &str) -> Result<(), CoreError>;

    // ----- datasets -----

    async fn create_dataset(
        &self,
        dataset: &NewDataset,
        now: DateTime<Utc>,
    ) -> Result<Dataset, CoreError>;

    async fn get_dataset(&self, team_id: &str, dataset_id: &str) -> Result<Dataset, CoreError>;

    async fn set_dataset_split(
        &self,
        dataset_id: &str,
        split: &DatasetSplit,
    ) -> Result<(), CoreError>;

    async fn get_record_writer(
        &self,
        dataset_id: &str,
        record_number: i64,
    ) -> Result<Option<DatasetRecordWriter>, CoreError>;

    /// Upsert a shard writer. `frames_written` never decreases. False, with
    /// nothing written, when the dataset is gone or being deleted.
    async fn save_record_writer(&self, writer: &DatasetRecordWriter) -> Result<bool, CoreError>;

    /// Store a finished shard, then mark the dataset complete if this was
    /// the last one. Only the call that completed it sees
    /// [`RecordOutcome::Completed`].
    async fn store_dataset_record_and_check_complete(
        &self,
        record: &DatasetRecord,
    ) -> Result<RecordOutcome, CoreError>;

    async fn list_dataset_records(&self, dataset_id: &str)
    -> Result<Vec<DatasetRecord>, CoreError>;

    /// False when the dataset is gone or being deleted.
    async fn set_label_map_blob_name(
        &self,
        dataset_id: &str,
        blob_name: &str,
    ) -> Result<bool, CoreError>;

    async fn mark_dataset_deleting(
        &self,
        team_id: &str,
        dataset_id: &str,
    ) -> Result<Dataset, CoreError>;

    async fn delete_dataset_entities(&self, dataset_id: &str) -> Result<(), CoreError>;

    // ----- dataset zips -----

    async fn create_dataset_zip(
        &self,
        zip: &DatasetZip,
        partitions: &[DatasetZipPartition],
    ) -> Result<(), CoreError>;

    async fn get_dataset_zip(
        &self,
        team_id: &str,
        dataset_zip_id: &str,
    ) -> Result<DatasetZip, CoreError>;

    async fn get_zip_partitions(
        &self,
        dataset_zip_id: &str,
    ) -> Result<Vec<DatasetZipPartition>, CoreError>;

    async fn get_zip_partition(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
    ) -> Result<DatasetZipPartition, CoreError>;

    /// Raise `files_written` to at least `files_written`.
    async fn update_zip_progress(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
        files_written: i64,
    ) -> Result<(), CoreError>;

    async fn save_zip_checkpoint(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
        resume_file_count: i64,
        partial_blob_name: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn complete_zip_partition(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
    ) -> Result<(), CoreError>;

    async fn delete_dataset_zip(&self, dataset_zip_id: &str) -> Result<(), CoreError>;

    /// Zip jobs of a dataset.
    async fn list_dataset_zips(&self, dataset_id: &str) -> Result<Vec<DatasetZip>, CoreError>;

    // ----- models -----

    async fn create_model(&self, model: &NewModel, now: DateTime<Utc>)
    -> Result<Model, CoreError>;

    async fn get_model(&self, team_id: &str, model_id: &str) -> Result<Model, CoreError>;

    async fn update_model_jobs(
        &self,
        model_id: &str,
        update: &ModelJobUpdate,
    ) -> Result<(), CoreError>;

    async fn request_model_cancel(&self, team_id: &str, model_id: &str) -> Result<(), CoreError>;

    /// Record the charge and refund `refund` minutes to the team, once.
    /// Returns false when the model was already charged.
    async fn charge_training_minutes(
        &self,
        model_id: &str,
        minutes_charged: i64,
        refund: i64,
    ) -> Result<bool, CoreError>;

    async fn mark_monitor_triggered(
        &self,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Store scan progress: `trained_steps` only rises, event file times
    /// are merged, active time accumulates.
    async fn update_monitor_progress(
        &self,
        model_id: &str,
        trained_steps: i64,
        event_files: &BTreeMap<String, DateTime<Utc>>,
        active_time_ms: i64,
    ) -> Result<(), CoreError>;

    async fn mark_monitor_finished(&self, model_id: &str) -> Result<(), CoreError>;

    async fn upsert_summary_item(&self, item: &ModelSummaryItem) -> Result<(), CoreError>;

    async fn list_summary_items(
        &self,
        model_id: &str,
        job_type: &str,
    ) -> Result<Vec<ModelSummaryItem>, CoreError>;

    async fn mark_model_deleting(&self, team_id: &str, model_id: &str)
    -> Result<Model, CoreError>;

    async fn delete_model_entities(&self, model_id: &str) -> Result<(), CoreError>;

    // ----- actions -----

    /// Actions with the same owner, name and canonical parameters.
    async fn find_actions(
        &self,
        team_id: &str,
        action_name: &str,
        parameters: &str,
    ) -> Result<Vec<Action>, CoreError>;

    async fn create_action(&self, action: &Action) -> Result<(), CoreError>;

    /// Store `action` unless an identical action (same owner, name and
    /// parameters) has been active after `live_since`. Identical actions
    /// idle since then are deleted first. Concurrent claims for the same
    /// parameters store at most one action.
    async fn claim_action(
        &self,
        action: &Action,
        live_since: DateTime<Utc>,
    ) -> Result<ActionClaim, CoreError>;

    async fn get_action(&self, action_id: &str) -> Result<Option<Action>, CoreError>;

    async fn delete_action(&self, action_id: &str) -> Result<bool, CoreError>;

    /// Append a start timestamp. False when the action no longer exists.
    async fn record_action_start(
        &self,
        action_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Append a stop timestamp. False when the action no longer exists.
    async fn record_action_stop(
        &self,
        action_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
