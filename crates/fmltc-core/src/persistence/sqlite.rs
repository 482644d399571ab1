// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::{debug, info};

use crate::error::CoreError;

use super::{
    Action, ActionClaim, Dataset, DatasetRecord, DatasetRecordWriter, DatasetSplit, DatasetZip,
    DatasetZipPartition, Model, ModelJobUpdate, ModelSummaryItem, NewDataset, NewModel, NewVideo,
    Persistence, RecordOutcome, Team, Tracker, TrackerClient, Video, VideoFrame,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Rounds of find-then-insert before a contended claim gives up.
const CLAIM_ATTEMPTS: usize = 4;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

fn db_error(operation: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::Database {
        operation: operation.to_string(),
        details: err.to_string(),
    }
}

fn found<T>(record: Option<T>, kind: &'static str, id: &str) -> Result<T, CoreError> {
    record.ok_or_else(|| CoreError::not_found(kind, id))
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` (e.g. `sqlite:.data/fmltc.db`), creating the database
    /// file if needed, and run all migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| db_error("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        if let Some(parent) = Path::new(options.get_filename()).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                db_error(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| db_error("connect", format!("Failed to connect to {url}: {e}")))?;

        Self::migrate(&pool).await?;
        info!(url = %url, "Connected SQLite entity store");
        Ok(Self { pool })
    }

    /// Fresh in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self, CoreError> {
        // One connection that never expires: the database lives in it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("connect", e))?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| db_error("migrate", format!("Failed to run migrations: {e}")))
    }

    async fn get_video_by_id(&self, video_id: &str) -> Result<Video, CoreError> {
        let video = sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE video_id = ?")
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        found(video, "video", video_id)
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ----- teams -----

    async fn get_or_create_team(
        &self,
        team_key: &str,
        initial_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Team, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO teams (team_id, team_key, remaining_training_minutes, create_time)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(team_key) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(team_key)
        .bind(initial_minutes)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let team = sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE team_key = ?")
            .bind(team_key)
            .fetch_optional(&self.pool)
            .await?;
        found(team, "team", team_key)
    }

    async fn get_team(&self, team_id: &str) -> Result<Team, CoreError> {
        let team = sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE team_id = ?")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?;
        found(team, "team", team_id)
    }

    async fn list_team_ids(&self) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT team_id FROM teams ORDER BY team_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn reserve_training_minutes(
        &self,
        team_id: &str,
        minutes: i64,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE teams
            SET remaining_training_minutes = remaining_training_minutes - ?
            WHERE team_id = ? AND remaining_training_minutes >= ?
            "#,
        )
        .bind(minutes)
        .bind(team_id)
        .bind(minutes)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn adjust_training_minutes(&self, team_id: &str, delta: i64) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE teams SET remaining_training_minutes = remaining_training_minutes + ? WHERE team_id = ?",
        )
        .bind(delta)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("team", team_id));
        }
        Ok(())
    }

    async fn admin_reset_training_minutes(
        &self,
        team_id: &str,
        minutes: i64,
        action_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE teams
            SET remaining_training_minutes = ?, last_admin_action_id = ?
            WHERE team_id = ?
              AND (last_admin_action_id IS NULL OR last_admin_action_id <> ?)
            "#,
        )
        .bind(minutes)
        .bind(action_id)
        .bind(team_id)
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn admin_increment_training_minutes(
        &self,
        team_id: &str,
        delta: i64,
        action_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE teams
            SET remaining_training_minutes = remaining_training_minutes + ?,
                last_admin_action_id = ?
            WHERE team_id = ?
              AND (last_admin_action_id IS NULL OR last_admin_action_id <> ?)
            "#,
        )
        .bind(delta)
        .bind(action_id)
        .bind(team_id)
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ----- videos and frames -----

    async fn create_video(
        &self,
        video: &NewVideo,
        now: DateTime<Utc>,
    ) -> Result<Video, CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO videos (video_id, team_id, description, video_filename, file_size,
                                content_type, blob_name, create_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&video.video_id)
        .bind(&video.team_id)
        .bind(&video.description)
        .bind(&video.video_filename)
        .bind(video.file_size)
        .bind(&video.content_type)
        .bind(&video.blob_name)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE teams SET last_video_id = ? WHERE team_id = ?")
            .bind(&video.video_id)
            .bind(&video.team_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get_video_by_id(&video.video_id).await
    }

    async fn get_video(&self, team_id: &str, video_id: &str) -> Result<Video, CoreError> {
        let video =
            sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE video_id = ? AND team_id = ?")
                .bind(video_id)
                .bind(team_id)
                .fetch_optional(&self.pool)
                .await?;
        found(video, "video", video_id)
    }

    async fn mark_frame_extraction_triggered(
        &self,
        team_id: &str,
        video_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE videos SET frame_extraction_triggered_time = ? WHERE video_id = ? AND team_id = ?",
        )
        .bind(now)
        .bind(video_id)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("video", video_id));
        }
        Ok(())
    }

    async fn mark_frame_extraction_started(
        &self,
        video_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE videos
            SET frame_extraction_start_time = COALESCE(frame_extraction_start_time, ?)
            WHERE video_id = ?
            "#,
        )
        .bind(now)
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_video_properties(
        &self,
        video_id: &str,
        width: i64,
        height: i64,
        fps: f64,
        frame_count: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE videos SET width = ?, height = ?, fps = ?, frame_count = ? WHERE video_id = ?",
        )
        .bind(width)
        .bind(height)
        .bind(fps)
        .bind(frame_count)
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_frame_extraction(
        &self,
        video_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE videos
            SET frame_extraction_failed = 1,
                frame_extraction_error_message = ?,
                frame_extraction_end_time = COALESCE(frame_extraction_end_time, ?)
            WHERE video_id = ?
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(video_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_video_frames(
        &self,
        team_id: &str,
        video_id: &str,
        frame_count: i64,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for frame_number in 0..frame_count {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO video_frames (video_id, frame_number, team_id)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(video_id)
            .bind(frame_number)
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            UPDATE videos
            SET included_frame_count = (
                SELECT COUNT(*) FROM video_frames
                WHERE video_id = ? AND include_frame_in_dataset = 1
            )
            WHERE video_id = ?
            "#,
        )
        .bind(video_id)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_extracted_frame(
        &self,
        video_id: &str,
        frame_number: i64,
        image_blob_name: &str,
        content_type: &str,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;
        let live = sqlx::query(
            r#"
            UPDATE videos
            SET extracted_frame_count = MAX(extracted_frame_count, ?)
            WHERE video_id = ? AND delete_in_progress = 0
            "#,
        )
        .bind(frame_number + 1)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        if live.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE video_frames
            SET image_blob_name = ?, content_type = ?
            WHERE video_id = ? AND frame_number = ?
            "#,
        )
        .bind(image_blob_name)
        .bind(content_type)
        .bind(video_id)
        .bind(frame_number)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn finish_frame_extraction(
        &self,
        video_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Video, CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE videos
            SET frame_count = extracted_frame_count
            WHERE video_id = ?
              AND (frame_count IS NULL OR frame_count > extracted_frame_count)
            "#,
        )
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            DELETE FROM video_frames
            WHERE video_id = ?
              AND frame_number >= (SELECT extracted_frame_count FROM videos WHERE video_id = ?)
            "#,
        )
        .bind(video_id)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            UPDATE videos
            SET frame_extraction_end_time = COALESCE(frame_extraction_end_time, ?),
                included_frame_count = (
                    SELECT COUNT(*) FROM video_frames
                    WHERE video_id = ? AND include_frame_in_dataset = 1
                )
            WHERE video_id = ?
            "#,
        )
        .bind(now)
        .bind(video_id)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_video_by_id(video_id).await
    }

    async fn get_video_frames(
        &self,
        team_id: &str,
        video_id: &str,
        min_frame_number: i64,
        max_frame_number: i64,
    ) -> Result<Vec<VideoFrame>, CoreError> {
        self.get_video(team_id, video_id).await?;
        let frames = sqlx::query_as::<_, VideoFrame>(
            r#"
            SELECT * FROM video_frames
            WHERE team_id = ? AND video_id = ? AND frame_number BETWEEN ? AND ?
            ORDER BY frame_number
            "#,
        )
        .bind(team_id)
        .bind(video_id)
        .bind(min_frame_number)
        .bind(max_frame_number)
        .fetch_all(&self.pool)
        .await?;
        Ok(frames)
    }

    async fn store_frame_bboxes(
        &self,
        team_id: &str,
        video_id: &str,
        frame_number: i64,
        bboxes_text: &str,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE video_frames SET bboxes_text = ?
            WHERE team_id = ? AND video_id = ? AND frame_number = ?
            "#,
        )
        .bind(bboxes_text)
        .bind(team_id)
        .bind(video_id)
        .bind(frame_number)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(
                "video_frame",
                format!("{video_id}/{frame_number}"),
            ));
        }
        sqlx::query(
            r#"
            UPDATE videos
            SET labeled_frame_count = (
                SELECT COUNT(*) FROM video_frames WHERE video_id = ? AND bboxes_text <> ''
            )
            WHERE video_id = ?
            "#,
        )
        .bind(video_id)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_frame_included(
        &self,
        team_id: &str,
        video_id: &str,
        frame_number: i64,
        include: bool,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE video_frames SET include_frame_in_dataset = ?
            WHERE team_id = ? AND video_id = ? AND frame_number = ?
            "#,
        )
        .bind(include)
        .bind(team_id)
        .bind(video_id)
        .bind(frame_number)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(
                "video_frame",
                format!("{video_id}/{frame_number}"),
            ));
        }
        sqlx::query(
            r#"
            UPDATE videos
            SET included_frame_count = (
                SELECT COUNT(*) FROM video_frames
                WHERE video_id = ? AND include_frame_in_dataset = 1
            )
            WHERE video_id = ?
            "#,
        )
        .bind(video_id)
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn included_frames(
        &self,
        team_id: &str,
        video_ids: &[String],
    ) -> Result<Vec<VideoFrame>, CoreError> {
        let mut frames = Vec::new();
        for video_id in video_ids {
            let mut rows = sqlx::query_as::<_, VideoFrame>(
                r#"
                SELECT * FROM video_frames
                WHERE team_id = ? AND video_id = ?
                  AND include_frame_in_dataset = 1
                  AND image_blob_name IS NOT NULL
                ORDER BY frame_number
                "#,
            )
            .bind(team_id)
            .bind(video_id)
            .fetch_all(&self.pool)
            .await?;
            frames.append(&mut rows);
        }
        Ok(frames)
    }

    async fn mark_video_deleting(
        &self,
        team_id: &str,
        video_id: &str,
    ) -> Result<Video, CoreError> {
        let mut video = self.get_video(team_id, video_id).await?;
        sqlx::query("UPDATE videos SET delete_in_progress = 1 WHERE video_id = ?")
            .bind(video_id)
            .execute(&self.pool)
            .await?;
        video.delete_in_progress = true;
        Ok(video)
    }

    async fn delete_video_entities(&self, video_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM tracker_clients WHERE tracker_id IN (SELECT tracker_id FROM trackers WHERE video_id = ?)",
        )
        .bind(video_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM trackers WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM video_frames WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM videos WHERE video_id = ?")
            .bind(video_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ----- tracking -----

    async fn start_tracking(
        &self,
        tracker: &Tracker,
        client: &TrackerClient,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            r#"
            UPDATE videos
            SET tracking_in_progress = 1, tracker_id = ?
            WHERE video_id = ? AND team_id = ?
              AND tracking_in_progress = 0 AND delete_in_progress = 0
            "#,
        )
        .bind(&tracker.tracker_id)
        .bind(&tracker.video_id)
        .bind(&tracker.team_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO trackers (tracker_id, team_id, video_id, tracker_name, frame_number,
                                  bboxes_text, tracking_failed, update_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tracker.tracker_id)
        .bind(&tracker.team_id)
        .bind(&tracker.video_id)
        .bind(&tracker.tracker_name)
        .bind(tracker.frame_number)
        .bind(&tracker.bboxes_text)
        .bind(tracker.tracking_failed)
        .bind(tracker.update_time)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO tracker_clients (tracker_id, frame_number, bboxes_text,
                                         tracking_stop_requested, update_time)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&client.tracker_id)
        .bind(client.frame_number)
        .bind(&client.bboxes_text)
        .bind(client.tracking_stop_requested)
        .bind(client.update_time)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn get_tracker(&self, tracker_id: &str) -> Result<Option<Tracker>, CoreError> {
        Ok(
            sqlx::query_as::<_, Tracker>("SELECT * FROM trackers WHERE tracker_id = ?")
                .bind(tracker_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn get_tracker_client(
        &self,
        tracker_id: &str,
    ) -> Result<Option<TrackerClient>, CoreError> {
        Ok(
            sqlx::query_as::<_, TrackerClient>(
                "SELECT * FROM tracker_clients WHERE tracker_id = ?",
            )
            .bind(tracker_id)
            .fetch_optional(&self.pool)
            .await?,
        )
    }

    async fn store_tracker_result(
        &self,
        tracker_id: &str,
        frame_number: i64,
        bboxes_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE trackers SET frame_number = ?, bboxes_text = ?, update_time = ?
            WHERE tracker_id = ?
            "#,
        )
        .bind(frame_number)
        .bind(bboxes_text)
        .bind(now)
        .bind(tracker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_tracking_failed(&self, tracker_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE trackers SET tracking_failed = 1 WHERE tracker_id = ?")
            .bind(tracker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn store_tracker_client_update(
        &self,
        tracker_id: &str,
        frame_number: i64,
        bboxes_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tracker_clients SET frame_number = ?, bboxes_text = ?, update_time = ?
            WHERE tracker_id = ?
            "#,
        )
        .bind(frame_number)
        .bind(bboxes_text)
        .bind(now)
        .bind(tracker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("tracker", tracker_id));
        }
        Ok(())
    }

    async fn request_tracking_stop(
        &self,
        tracker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tracker_clients SET tracking_stop_requested = 1, update_time = ?
            WHERE tracker_id = ?
            "#,
        )
        .bind(now)
        .bind(tracker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("tracker", tracker_id));
        }
        Ok(())
    }

    async fn finish_tracking(&self, video_id: &str, tracker_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tracker_clients WHERE tracker_id = ?")
            .bind(tracker_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM trackers WHERE tracker_id = ?")
            .bind(tracker_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE videos SET tracking_in_progress = 0, tracker_id = NULL
            WHERE video_id = ? AND tracker_id = ?
            "#,
        )
        .bind(video_id)
        .bind(tracker_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ----- datasets -----

    async fn create_dataset(
        &self,
        dataset: &NewDataset,
        now: DateTime<Utc>,
    ) -> Result<Dataset, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO datasets (dataset_id, team_id, description, video_ids, eval_percent,
                                  create_time)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&dataset.dataset_id)
        .bind(&dataset.team_id)
        .bind(&dataset.description)
        .bind(Json(&dataset.video_ids))
        .bind(dataset.eval_percent)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_dataset(&dataset.team_id, &dataset.dataset_id).await
    }

    async fn get_dataset(&self, team_id: &str, dataset_id: &str) -> Result<Dataset, CoreError> {
        let dataset = sqlx::query_as::<_, Dataset>(
            "SELECT * FROM datasets WHERE dataset_id = ? AND team_id = ?",
        )
        .bind(dataset_id)
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;
        found(dataset, "dataset", dataset_id)
    }

    async fn set_dataset_split(
        &self,
        dataset_id: &str,
        split: &DatasetSplit,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE datasets
            SET sorted_label_list = ?,
                train_frame_count = ?, train_record_count = ?,
                eval_frame_count = ?, eval_record_count = ?,
                total_record_count = ?
            WHERE dataset_id = ?
            "#,
        )
        .bind(Json(&split.sorted_label_list))
        .bind(split.train_frame_count)
        .bind(split.train_record_count)
        .bind(split.eval_frame_count)
        .bind(split.eval_record_count)
        .bind(split.train_record_count + split.eval_record_count)
        .bind(dataset_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_record_writer(
        &self,
        dataset_id: &str,
        record_number: i64,
    ) -> Result<Option<DatasetRecordWriter>, CoreError> {
        Ok(sqlx::query_as::<_, DatasetRecordWriter>(
            "SELECT * FROM dataset_record_writers WHERE dataset_id = ? AND record_number = ?",
        )
        .bind(dataset_id)
        .bind(record_number)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn save_record_writer(&self, writer: &DatasetRecordWriter) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dataset_record_writers (dataset_id, record_number, is_eval,
                frames_written, resume_frame_count, partial_blob_name, label_counts,
                negative_frame_count, update_time)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM datasets WHERE dataset_id = ? AND delete_in_progress = 0
            )
            ON CONFLICT(dataset_id, record_number) DO UPDATE SET
                frames_written = MAX(dataset_record_writers.frames_written, excluded.frames_written),
                resume_frame_count = excluded.resume_frame_count,
                partial_blob_name = excluded.partial_blob_name,
                label_counts = excluded.label_counts,
                negative_frame_count = excluded.negative_frame_count,
                update_time = excluded.update_time
            "#,
        )
        .bind(&writer.dataset_id)
        .bind(writer.record_number)
        .bind(writer.is_eval)
        .bind(writer.frames_written)
        .bind(writer.resume_frame_count)
        .bind(&writer.partial_blob_name)
        .bind(&writer.label_counts)
        .bind(writer.negative_frame_count)
        .bind(writer.update_time)
        .bind(&writer.dataset_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn store_dataset_record_and_check_complete(
        &self,
        record: &DatasetRecord,
    ) -> Result<RecordOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;
        let stored = sqlx::query(
            r#"
            INSERT OR REPLACE INTO dataset_records (dataset_id, record_number, is_eval,
                tf_record_blob_name, label_counts, negative_frame_count, create_time)
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM datasets WHERE dataset_id = ? AND delete_in_progress = 0
            )
            "#,
        )
        .bind(&record.dataset_id)
        .bind(record.record_number)
        .bind(record.is_eval)
        .bind(&record.tf_record_blob_name)
        .bind(&record.label_counts)
        .bind(record.negative_frame_count)
        .bind(record.create_time)
        .bind(&record.dataset_id)
        .execute(&mut *tx)
        .await?;
        if stored.rows_affected() == 0 {
            return Ok(RecordOutcome::Discarded);
        }
        sqlx::query("DELETE FROM dataset_record_writers WHERE dataset_id = ? AND record_number = ?")
            .bind(&record.dataset_id)
            .bind(record.record_number)
            .execute(&mut *tx)
            .await?;

        // Only the transaction that sees the final count flips the flag.
        let completed = sqlx::query(
            r#"
            UPDATE datasets
            SET dataset_completed = 1
            WHERE dataset_id = ?
              AND dataset_completed = 0
              AND total_record_count > 0
              AND (SELECT COUNT(*) FROM dataset_records WHERE dataset_id = ?) >= total_record_count
            "#,
        )
        .bind(&record.dataset_id)
        .bind(&record.dataset_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(if completed.rows_affected() == 1 {
            RecordOutcome::Completed
        } else {
            RecordOutcome::Stored
        })
    }

    async fn list_dataset_records(
        &self,
        dataset_id: &str,
    ) -> Result<Vec<DatasetRecord>, CoreError> {
        Ok(sqlx::query_as::<_, DatasetRecord>(
            "SELECT * FROM dataset_records WHERE dataset_id = ? ORDER BY record_number",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn set_label_map_blob_name(
        &self,
        dataset_id: &str,
        blob_name: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE datasets SET label_map_blob_name = ? WHERE dataset_id = ? AND delete_in_progress = 0",
        )
        .bind(blob_name)
        .bind(dataset_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_dataset_deleting(
        &self,
        team_id: &str,
        dataset_id: &str,
    ) -> Result<Dataset, CoreError> {
        let mut dataset = self.get_dataset(team_id, dataset_id).await?;
        sqlx::query("UPDATE datasets SET delete_in_progress = 1 WHERE dataset_id = ?")
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        dataset.delete_in_progress = true;
        Ok(dataset)
    }

    async fn delete_dataset_entities(&self, dataset_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM dataset_zip_partitions WHERE dataset_zip_id IN (SELECT dataset_zip_id FROM dataset_zips WHERE dataset_id = ?)",
        )
        .bind(dataset_id)
        .execute(&mut *tx)
        .await?;
        for table in ["dataset_zips", "dataset_record_writers", "dataset_records", "datasets"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE dataset_id = ?"))
                .bind(dataset_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ----- dataset zips -----

    async fn create_dataset_zip(
        &self,
        zip: &DatasetZip,
        partitions: &[DatasetZipPartition],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO dataset_zips (dataset_zip_id, team_id, dataset_id, partition_count,
                                      create_time)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&zip.dataset_zip_id)
        .bind(&zip.team_id)
        .bind(&zip.dataset_id)
        .bind(zip.partition_count)
        .bind(zip.create_time)
        .execute(&mut *tx)
        .await?;
        for partition in partitions {
            sqlx::query(
                r#"
                INSERT INTO dataset_zip_partitions (dataset_zip_id, partition_index, file_names,
                    file_count, files_written, resume_file_count, partial_blob_name,
                    zip_blob_name, completed)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&partition.dataset_zip_id)
            .bind(partition.partition_index)
            .bind(&partition.file_names)
            .bind(partition.file_count)
            .bind(partition.files_written)
            .bind(partition.resume_file_count)
            .bind(&partition.partial_blob_name)
            .bind(&partition.zip_blob_name)
            .bind(partition.completed)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_dataset_zip(
        &self,
        team_id: &str,
        dataset_zip_id: &str,
    ) -> Result<DatasetZip, CoreError> {
        let zip = sqlx::query_as::<_, DatasetZip>(
            "SELECT * FROM dataset_zips WHERE dataset_zip_id = ? AND team_id = ?",
        )
        .bind(dataset_zip_id)
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;
        found(zip, "dataset_zip", dataset_zip_id)
    }

    async fn get_zip_partitions(
        &self,
        dataset_zip_id: &str,
    ) -> Result<Vec<DatasetZipPartition>, CoreError> {
        Ok(sqlx::query_as::<_, DatasetZipPartition>(
            "SELECT * FROM dataset_zip_partitions WHERE dataset_zip_id = ? ORDER BY partition_index",
        )
        .bind(dataset_zip_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_zip_partition(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
    ) -> Result<DatasetZipPartition, CoreError> {
        let partition = sqlx::query_as::<_, DatasetZipPartition>(
            "SELECT * FROM dataset_zip_partitions WHERE dataset_zip_id = ? AND partition_index = ?",
        )
        .bind(dataset_zip_id)
        .bind(partition_index)
        .fetch_optional(&self.pool)
        .await?;
        found(
            partition,
            "dataset_zip_partition",
            &format!("{dataset_zip_id}/{partition_index}"),
        )
    }

    async fn update_zip_progress(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
        files_written: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE dataset_zip_partitions
            SET files_written = MAX(files_written, ?)
            WHERE dataset_zip_id = ? AND partition_index = ?
            "#,
        )
        .bind(files_written)
        .bind(dataset_zip_id)
        .bind(partition_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_zip_checkpoint(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
        resume_file_count: i64,
        partial_blob_name: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE dataset_zip_partitions
            SET resume_file_count = ?, partial_blob_name = ?
            WHERE dataset_zip_id = ? AND partition_index = ?
            "#,
        )
        .bind(resume_file_count)
        .bind(partial_blob_name)
        .bind(dataset_zip_id)
        .bind(partition_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_zip_partition(
        &self,
        dataset_zip_id: &str,
        partition_index: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE dataset_zip_partitions
            SET completed = 1, files_written = file_count, resume_file_count = file_count,
                partial_blob_name = NULL
            WHERE dataset_zip_id = ? AND partition_index = ?
            "#,
        )
        .bind(dataset_zip_id)
        .bind(partition_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_dataset_zip(&self, dataset_zip_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dataset_zip_partitions WHERE dataset_zip_id = ?")
            .bind(dataset_zip_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dataset_zips WHERE dataset_zip_id = ?")
            .bind(dataset_zip_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_dataset_zips(&self, dataset_id: &str) -> Result<Vec<DatasetZip>, CoreError> {
        Ok(sqlx::query_as::<_, DatasetZip>(
            "SELECT * FROM dataset_zips WHERE dataset_id = ? ORDER BY create_time",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ----- models -----

    async fn create_model(
        &self,
        model: &NewModel,
        now: DateTime<Utc>,
    ) -> Result<Model, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO models (model_id, team_id, description, dataset_ids, starting_model,
                num_training_steps, max_running_minutes, reserved_training_minutes,
                create_time, train_job_name, eval_job_name, train_job_state, eval_job_state)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&model.model_id)
        .bind(&model.team_id)
        .bind(&model.description)
        .bind(Json(&model.dataset_ids))
        .bind(&model.starting_model)
        .bind(model.num_training_steps)
        .bind(model.max_running_minutes)
        .bind(model.reserved_training_minutes)
        .bind(now)
        .bind(&model.train_job_name)
        .bind(&model.eval_job_name)
        .bind(&model.train_job_state)
        .bind(&model.eval_job_state)
        .execute(&self.pool)
        .await?;

        self.get_model(&model.team_id, &model.model_id).await
    }

    async fn get_model(&self, team_id: &str, model_id: &str) -> Result<Model, CoreError> {
        let model =
            sqlx::query_as::<_, Model>("SELECT * FROM models WHERE model_id = ? AND team_id = ?")
                .bind(model_id)
                .bind(team_id)
                .fetch_optional(&self.pool)
                .await?;
        found(model, "model", model_id)
    }

    async fn update_model_jobs(
        &self,
        model_id: &str,
        update: &ModelJobUpdate,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE models
            SET train_job_state = ?,
                eval_job_state = COALESCE(?, eval_job_state),
                train_error_message = COALESCE(?, train_error_message),
                eval_error_message = COALESCE(?, eval_error_message),
                train_job_start_time = COALESCE(train_job_start_time, ?),
                train_job_end_time = COALESCE(train_job_end_time, ?)
            WHERE model_id = ?
            "#,
        )
        .bind(&update.train_job_state)
        .bind(&update.eval_job_state)
        .bind(&update.train_error_message)
        .bind(&update.eval_error_message)
        .bind(update.train_job_start_time)
        .bind(update.train_job_end_time)
        .bind(model_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_model_cancel(&self, team_id: &str, model_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE models SET cancel_requested = 1 WHERE model_id = ? AND team_id = ?",
        )
        .bind(model_id)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("model", model_id));
        }
        Ok(())
    }

    async fn charge_training_minutes(
        &self,
        model_id: &str,
        minutes_charged: i64,
        refund: i64,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;
        let charged = sqlx::query(
            r#"
            UPDATE models SET training_minutes_charged = ?
            WHERE model_id = ? AND training_minutes_charged IS NULL
            "#,
        )
        .bind(minutes_charged)
        .bind(model_id)
        .execute(&mut *tx)
        .await?;
        if charged.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE teams
            SET remaining_training_minutes = remaining_training_minutes + ?
            WHERE team_id = (SELECT team_id FROM models WHERE model_id = ?)
            "#,
        )
        .bind(refund)
        .bind(model_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_monitor_triggered(
        &self,
        model_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE models
            SET monitor_training_triggered_time = ?, monitor_training_finished = 0
            WHERE model_id = ?
            "#,
        )
        .bind(now)
        .bind(model_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_monitor_progress(
        &self,
        model_id: &str,
        trained_steps: i64,
        event_files: &BTreeMap<String, DateTime<Utc>>,
        active_time_ms: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE models
            SET trained_steps = MAX(trained_steps, ?),
                dict_event_file_path_to_updated = json_patch(dict_event_file_path_to_updated, ?),
                monitor_training_active_time_ms = monitor_training_active_time_ms + ?
            WHERE model_id = ?
            "#,
        )
        .bind(trained_steps)
        .bind(Json(event_files))
        .bind(active_time_ms)
        .bind(model_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_monitor_finished(&self, model_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE models SET monitor_training_finished = 1 WHERE model_id = ?")
            .bind(model_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_summary_item(&self, item: &ModelSummaryItem) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO model_summary_items (model_id, job_type, step, tag, value_type, value,
                image_blob_name, image_width, image_height, update_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(model_id, job_type, step, tag) DO UPDATE SET
                value_type = excluded.value_type,
                value = excluded.value,
                image_blob_name = excluded.image_blob_name,
                image_width = excluded.image_width,
                image_height = excluded.image_height,
                update_time = excluded.update_time
            "#,
        )
        .bind(&item.model_id)
        .bind(&item.job_type)
        .bind(item.step)
        .bind(&item.tag)
        .bind(&item.value_type)
        .bind(item.value)
        .bind(&item.image_blob_name)
        .bind(item.image_width)
        .bind(item.image_height)
        .bind(item.update_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_summary_items(
        &self,
        model_id: &str,
        job_type: &str,
    ) -> Result<Vec<ModelSummaryItem>, CoreError> {
        Ok(sqlx::query_as::<_, ModelSummaryItem>(
            r#"
            SELECT * FROM model_summary_items
            WHERE model_id = ? AND job_type = ?
            ORDER BY tag, step
            "#,
        )
        .bind(model_id)
        .bind(job_type)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn mark_model_deleting(
        &self,
        team_id: &str,
        model_id: &str,
    ) -> Result<Model, CoreError> {
        let mut model = self.get_model(team_id, model_id).await?;
        sqlx::query("UPDATE models SET delete_in_progress = 1 WHERE model_id = ?")
            .bind(model_id)
            .execute(&self.pool)
            .await?;
        model.delete_in_progress = true;
        Ok(model)
    }

    async fn delete_model_entities(&self, model_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM model_summary_items WHERE model_id = ?")
            .bind(model_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM models WHERE model_id = ?")
            .bind(model_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ----- actions -----

    async fn find_actions(
        &self,
        team_id: &str,
        action_name: &str,
        parameters: &str,
    ) -> Result<Vec<Action>, CoreError> {
        Ok(sqlx::query_as::<_, Action>(
            r#"
            SELECT * FROM actions
            WHERE team_id = ? AND action_name = ? AND parameters = ?
            ORDER BY create_time
            "#,
        )
        .bind(team_id)
        .bind(action_name)
        .bind(parameters)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_action(&self, action: &Action) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO actions (action_id, team_id, action_name, is_admin_action, parameters,
                                 create_time, start_times, stop_times)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&action.action_id)
        .bind(&action.team_id)
        .bind(&action.action_name)
        .bind(action.is_admin_action)
        .bind(&action.parameters)
        .bind(action.create_time)
        .bind(&action.start_times)
        .bind(&action.stop_times)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_action(
        &self,
        action: &Action,
        live_since: DateTime<Utc>,
    ) -> Result<ActionClaim, CoreError> {
        // The unique index on (team_id, action_name, parameters) decides
        // between concurrent claims; a loser retries against the winner.
        for _ in 0..CLAIM_ATTEMPTS {
            let existing = self
                .find_actions(&action.team_id, &action.action_name, &action.parameters)
                .await?;
            if let Some(live) = existing
                .iter()
                .find(|existing| existing.last_activity() > live_since)
            {
                return Ok(ActionClaim::Live(live.clone()));
            }
            for abandoned in &existing {
                info!(action_id = %abandoned.action_id, "Removing abandoned action");
                self.delete_action(&abandoned.action_id).await?;
            }

            let inserted = sqlx::query(
                r#"
                INSERT INTO actions (action_id, team_id, action_name, is_admin_action, parameters,
                                     create_time, start_times, stop_times)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(team_id, action_name, parameters) DO NOTHING
                "#,
            )
            .bind(&action.action_id)
            .bind(&action.team_id)
            .bind(&action.action_name)
            .bind(action.is_admin_action)
            .bind(&action.parameters)
            .bind(action.create_time)
            .bind(&action.start_times)
            .bind(&action.stop_times)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 1 {
                return Ok(ActionClaim::Created);
            }
            debug!(action_name = %action.action_name, "Concurrent claim won, re-reading");
        }
        Err(db_error(
            "claim_action",
            format!("No stable outcome after {CLAIM_ATTEMPTS} attempts"),
        ))
    }

    async fn get_action(&self, action_id: &str) -> Result<Option<Action>, CoreError> {
        Ok(
            sqlx::query_as::<_, Action>("SELECT * FROM actions WHERE action_id = ?")
                .bind(action_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn delete_action(&self, action_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM actions WHERE action_id = ?")
            .bind(action_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_action_start(
        &self,
        action_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE actions SET start_times = json_insert(start_times, '$[#]', ?) WHERE action_id = ?",
        )
        .bind(now.timestamp_millis())
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_action_stop(
        &self,
        action_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE actions SET stop_times = json_insert(stop_times, '$[#]', ?) WHERE action_id = ?",
        )
        .bind(now.timestamp_millis())
        .bind(action_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::LabelCounts;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn store() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory store")
    }

    async fn team(store: &SqlitePersistence) -> Team {
        store
            .get_or_create_team("FTC/Team 1234", 60, Utc::now())
            .await
            .expect("Failed to create team")
    }

    async fn video(store: &SqlitePersistence, team_id: &str, frames: i64) -> Video {
        let video = store
            .create_video(
                &NewVideo {
                    video_id: Uuid::new_v4().to_string(),
                    team_id: team_id.to_string(),
                    description: "practice run".to_string(),
                    video_filename: "run.mp4".to_string(),
                    file_size: 1024,
                    content_type: "video/mp4".to_string(),
                    blob_name: "v.mp4".to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        if frames > 0 {
            store
                .create_video_frames(team_id, &video.video_id, frames)
                .await
                .unwrap();
        }
        video
    }

    #[tokio::test]
    async fn test_get_or_create_team_is_idempotent() {
        let store = store().await;
        let first = team(&store).await;
        let second = store
            .get_or_create_team("FTC/Team 1234", 999, Utc::now())
            .await
            .unwrap();

        assert_eq!(first.team_id, second.team_id);
        assert_eq!(second.remaining_training_minutes, 60);
        assert_eq!(store.list_team_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reserve_training_minutes() {
        let store = store().await;
        let team = team(&store).await;

        assert!(store.reserve_training_minutes(&team.team_id, 45).await.unwrap());
        assert!(!store.reserve_training_minutes(&team.team_id, 45).await.unwrap());
        store.adjust_training_minutes(&team.team_id, 5).await.unwrap();
        assert_eq!(
            store.get_team(&team.team_id).await.unwrap().remaining_training_minutes,
            20
        );
    }

    #[tokio::test]
    async fn test_admin_action_applied_once() {
        let store = store().await;
        let team = team(&store).await;

        assert!(
            store
                .admin_increment_training_minutes(&team.team_id, 30, "a-1")
                .await
                .unwrap()
        );
        assert!(
            !store
                .admin_increment_training_minutes(&team.team_id, 30, "a-1")
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_team(&team.team_id).await.unwrap().remaining_training_minutes,
            90
        );

        assert!(
            store
                .admin_reset_training_minutes(&team.team_id, 10, "a-2")
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_team(&team.team_id).await.unwrap().remaining_training_minutes,
            10
        );
    }

    #[tokio::test]
    async fn test_team_scoping() {
        let store = store().await;
        let team = team(&store).await;
        let video = video(&store, &team.team_id, 0).await;

        let err = store.get_video("other-team", &video.video_id).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            store.get_team(&team.team_id).await.unwrap().last_video_id,
            Some(video.video_id)
        );
    }

    #[tokio::test]
    async fn test_extracted_frame_count_is_monotonic() {
        let store = store().await;
        let team = team(&store).await;
        let video = video(&store, &team.team_id, 10).await;

        store
            .store_extracted_frame(&video.video_id, 4, "f4.jpg", "image/jpeg")
            .await
            .unwrap();
        // A stale duplicate invocation re-stores an earlier frame.
        store
            .store_extracted_frame(&video.video_id, 2, "f2.jpg", "image/jpeg")
            .await
            .unwrap();

        let video = store.get_video(&team.team_id, &video.video_id).await.unwrap();
        assert_eq!(video.extracted_frame_count, 5);
        assert_eq!(video.included_frame_count, 10);

        store
            .mark_video_deleting(&team.team_id, &video.video_id)
            .await
            .unwrap();
        assert!(
            !store
                .store_extracted_frame(&video.video_id, 5, "f5.jpg", "image/jpeg")
                .await
                .unwrap()
        );
        let video = store.get_video(&team.team_id, &video.video_id).await.unwrap();
        assert_eq!(video.extracted_frame_count, 5);
        assert!(!store.store_extracted_frame("v-gone", 0, "f.jpg", "image/jpeg").await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_extraction_shrinks_frame_count() {
        let store = store().await;
        let team = team(&store).await;
        let video = video(&store, &team.team_id, 10).await;
        store
            .set_video_properties(&video.video_id, 640, 480, 30.0, 10)
            .await
            .unwrap();
        for n in 0..8 {
            store
                .store_extracted_frame(&video.video_id, n, &format!("f{n}.jpg"), "image/jpeg")
                .await
                .unwrap();
        }

        let video = store
            .finish_frame_extraction(&video.video_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(video.frame_count, Some(8));
        assert_eq!(video.included_frame_count, 8);
        assert!(video.frame_extraction_done());
        let frames = store
            .get_video_frames(&team.team_id, &video.video_id, 0, 100)
            .await
            .unwrap();
        assert_eq!(frames.len(), 8);
    }

    #[tokio::test]
    async fn test_labeled_and_included_counts() {
        let store = store().await;
        let team = team(&store).await;
        let video = video(&store, &team.team_id, 3).await;

        store
            .store_frame_bboxes(&team.team_id, &video.video_id, 0, "1,2,3,4,robot\n")
            .await
            .unwrap();
        store
            .set_frame_included(&team.team_id, &video.video_id, 2, false)
            .await
            .unwrap();

        let video = store.get_video(&team.team_id, &video.video_id).await.unwrap();
        assert_eq!(video.labeled_frame_count, 1);
        assert_eq!(video.included_frame_count, 2);

        let err = store
            .store_frame_bboxes(&team.team_id, &video.video_id, 99, "")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_start_tracking_is_exclusive() {
        let store = store().await;
        let team = team(&store).await;
        let video = video(&store, &team.team_id, 3).await;
        let now = Utc::now();

        let session = |id: &str| {
            (
                Tracker {
                    tracker_id: id.to_string(),
                    team_id: team.team_id.clone(),
                    video_id: video.video_id.clone(),
                    tracker_name: "template".to_string(),
                    frame_number: 0,
                    bboxes_text: "1,1,5,5,ball\n".to_string(),
                    tracking_failed: false,
                    update_time: now,
                },
                TrackerClient {
                    tracker_id: id.to_string(),
                    frame_number: 0,
                    bboxes_text: "1,1,5,5,ball\n".to_string(),
                    tracking_stop_requested: false,
                    update_time: now,
                },
            )
        };

        let (t1, c1) = session("t1");
        let (t2, c2) = session("t2");
        assert!(store.start_tracking(&t1, &c1).await.unwrap());
        assert!(!store.start_tracking(&t2, &c2).await.unwrap());
        assert!(store.get_tracker("t2").await.unwrap().is_none());

        store.finish_tracking(&video.video_id, "t1").await.unwrap();
        let video = store.get_video(&team.team_id, &video.video_id).await.unwrap();
        assert!(!video.tracking_in_progress);
        assert!(video.tracker_id.is_none());
        assert!(store.get_tracker_client("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dataset_completes_exactly_once() {
        let store = Arc::new(store().await);
        let team = team(&store).await;
        let dataset = store
            .create_dataset(
                &NewDataset {
                    dataset_id: "d1".to_string(),
                    team_id: team.team_id.clone(),
                    description: "d".to_string(),
                    video_ids: vec!["v1".to_string()],
                    eval_percent: 20.0,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .set_dataset_split(
                &dataset.dataset_id,
                &DatasetSplit {
                    sorted_label_list: vec!["ball".to_string()],
                    train_frame_count: 8,
                    train_record_count: 3,
                    eval_frame_count: 2,
                    eval_record_count: 1,
                },
            )
            .await
            .unwrap();

        let mut handles = Vec::new();
        for record_number in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .store_dataset_record_and_check_complete(&DatasetRecord {
                        dataset_id: "d1".to_string(),
                        record_number,
                        is_eval: record_number == 0,
                        tf_record_blob_name: format!("r{record_number}"),
                        label_counts: Json(LabelCounts::new()),
                        negative_frame_count: 0,
                        create_time: Utc::now(),
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut completions = 0;
        for handle in handles {
            if handle.await.unwrap() == RecordOutcome::Completed {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);

        // Redelivered shard completion does not complete it again.
        let again = store
            .store_dataset_record_and_check_complete(&DatasetRecord {
                dataset_id: "d1".to_string(),
                record_number: 2,
                is_eval: false,
                tf_record_blob_name: "r2".to_string(),
                label_counts: Json(LabelCounts::new()),
                negative_frame_count: 0,
                create_time: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(again, RecordOutcome::Stored);
        let dataset = store.get_dataset(&team.team_id, "d1").await.unwrap();
        assert!(dataset.dataset_completed);
        assert_eq!(dataset.total_record_count, 4);
    }

    #[tokio::test]
    async fn test_record_writer_progress_never_regresses() {
        let store = store().await;
        let team = team(&store).await;
        store
            .create_dataset(
                &NewDataset {
                    dataset_id: "d1".to_string(),
                    team_id: team.team_id.clone(),
                    description: "d".to_string(),
                    video_ids: vec!["v1".to_string()],
                    eval_percent: 20.0,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let mut writer = DatasetRecordWriter {
            dataset_id: "d1".to_string(),
            record_number: 0,
            is_eval: false,
            frames_written: 10,
            resume_frame_count: 10,
            partial_blob_name: Some("partial".to_string()),
            label_counts: Json(LabelCounts::from([("ball".to_string(), 3)])),
            negative_frame_count: 1,
            update_time: Utc::now(),
        };
        assert!(store.save_record_writer(&writer).await.unwrap());
        writer.frames_written = 4;
        writer.resume_frame_count = 4;
        assert!(store.save_record_writer(&writer).await.unwrap());

        let stored = store.get_record_writer("d1", 0).await.unwrap().unwrap();
        assert_eq!(stored.frames_written, 10);
        assert_eq!(stored.resume_frame_count, 4);
        assert_eq!(stored.label_counts.0.get("ball"), Some(&3));

        // Nothing is written for a dataset that is being deleted.
        store.mark_dataset_deleting(&team.team_id, "d1").await.unwrap();
        writer.frames_written = 12;
        assert!(!store.save_record_writer(&writer).await.unwrap());
        let record = DatasetRecord {
            dataset_id: "d1".to_string(),
            record_number: 0,
            is_eval: false,
            tf_record_blob_name: "r0".to_string(),
            label_counts: Json(LabelCounts::new()),
            negative_frame_count: 0,
            create_time: Utc::now(),
        };
        assert_eq!(
            store.store_dataset_record_and_check_complete(&record).await.unwrap(),
            RecordOutcome::Discarded
        );
        assert!(store.list_dataset_records("d1").await.unwrap().is_empty());
        assert!(!store.set_label_map_blob_name("d1", "label_map.pbtxt").await.unwrap());
        assert_eq!(
            store.get_record_writer("d1", 0).await.unwrap().unwrap().frames_written,
            10
        );
    }

    #[tokio::test]
    async fn test_training_minutes_charged_once() {
        let store = store().await;
        let team = team(&store).await;
        assert!(store.reserve_training_minutes(&team.team_id, 30).await.unwrap());
        store
            .create_model(
                &NewModel {
                    model_id: "m1".to_string(),
                    team_id: team.team_id.clone(),
                    description: "m".to_string(),
                    dataset_ids: vec!["d1".to_string()],
                    starting_model: "ssd".to_string(),
                    num_training_steps: 100,
                    max_running_minutes: 30,
                    reserved_training_minutes: 30,
                    train_job_name: "job".to_string(),
                    eval_job_name: None,
                    train_job_state: "QUEUED".to_string(),
                    eval_job_state: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(store.charge_training_minutes("m1", 12, 18).await.unwrap());
        assert!(!store.charge_training_minutes("m1", 12, 18).await.unwrap());
        assert_eq!(
            store.get_team(&team.team_id).await.unwrap().remaining_training_minutes,
            48
        );
    }

    #[tokio::test]
    async fn test_monitor_progress_merges_event_files() {
        let store = store().await;
        let team = team(&store).await;
        store
            .create_model(
                &NewModel {
                    model_id: "m1".to_string(),
                    team_id: team.team_id.clone(),
                    description: "m".to_string(),
                    dataset_ids: vec![],
                    starting_model: "ssd".to_string(),
                    num_training_steps: 100,
                    max_running_minutes: 30,
                    reserved_training_minutes: 30,
                    train_job_name: "job".to_string(),
                    eval_job_name: None,
                    train_job_state: "RUNNING".to_string(),
                    eval_job_state: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let t = Utc::now();
        let first = BTreeMap::from([("a".to_string(), t)]);
        let second = BTreeMap::from([("b".to_string(), t)]);
        store.update_monitor_progress("m1", 50, &first, 100).await.unwrap();
        store.update_monitor_progress("m1", 20, &second, 100).await.unwrap();

        let model = store.get_model(&team.team_id, "m1").await.unwrap();
        assert_eq!(model.trained_steps, 50);
        assert_eq!(model.monitor_training_active_time_ms, 200);
        assert_eq!(model.dict_event_file_path_to_updated.0.len(), 2);
    }

    #[tokio::test]
    async fn test_action_start_stop_times() {
        let store = store().await;
        let created = Utc::now() - chrono::Duration::minutes(30);
        store
            .create_action(&Action {
                action_id: "a1".to_string(),
                team_id: "t1".to_string(),
                action_name: "extract_frames".to_string(),
                is_admin_action: false,
                parameters: "{}".to_string(),
                create_time: created,
                start_times: Json(vec![]),
                stop_times: Json(vec![]),
            })
            .await
            .unwrap();

        let started = Utc::now();
        assert!(store.record_action_start("a1", started).await.unwrap());
        assert!(store.record_action_stop("a1", started).await.unwrap());
        assert!(store.record_action_start("a1", started).await.unwrap());

        let action = store.get_action("a1").await.unwrap().unwrap();
        assert_eq!(action.start_times.0.len(), 2);
        assert_eq!(action.stop_times.0.len(), 1);
        assert_eq!(
            action.last_activity().timestamp_millis(),
            started.timestamp_millis()
        );
        assert_eq!(
            store.find_actions("t1", "extract_frames", "{}").await.unwrap().len(),
            1
        );

        assert!(store.delete_action("a1").await.unwrap());
        assert!(!store.record_action_start("a1", started).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_action_keeps_one_live_action() {
        let store = store().await;
        let now = Utc::now();
        let action = |id: &str, created| Action {
            action_id: id.to_string(),
            team_id: "t1".to_string(),
            action_name: "delete_video".to_string(),
            is_admin_action: false,
            parameters: r#"{"video_id":"v1"}"#.to_string(),
            create_time: created,
            start_times: Json(vec![]),
            stop_times: Json(vec![]),
        };
        let window = chrono::Duration::minutes(15);

        let old = now - chrono::Duration::minutes(20);
        assert!(matches!(
            store.claim_action(&action("a1", old), old - window).await.unwrap(),
            ActionClaim::Created
        ));
        // a1 has been idle for longer than the window.
        assert!(matches!(
            store.claim_action(&action("a2", now), now - window).await.unwrap(),
            ActionClaim::Created
        ));
        assert!(store.get_action("a1").await.unwrap().is_none());

        match store.claim_action(&action("a3", now), now - window).await.unwrap() {
            ActionClaim::Live(live) => assert_eq!(live.action_id, "a2"),
            ActionClaim::Created => panic!("a2 is still live"),
        }
        assert!(store.get_action("a3").await.unwrap().is_none());
        assert!(store.create_action(&action("a4", now)).await.is_err());
    }

    #[tokio::test]
    async fn test_health_check_db() {
        let store = store().await;
        assert!(store.health_check_db().await.unwrap());
    }
}
