// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dataset production.
//!
//! `dataset_produce` plans the train/eval split and triggers one
//! `dataset_produce_record` action per TFRecord shard. Each shard action
//! writes its frames as tf.Example records; when it runs out of time the
//! partial shard is uploaded and its position saved in the shard's
//! [`DatasetRecordWriter`]. The shard that stores the last record flips the
//! dataset to complete and writes the label map.

use std::collections::{BTreeSet, HashMap, HashSet};

use fmltc_core::CoreError;
use fmltc_core::persistence::{
    Dataset, DatasetRecord, DatasetRecordWriter, DatasetSplit, RecordOutcome,
};
use fmltc_media::bbox::{label_counts, parse_bboxes};
use fmltc_media::example::{LabeledFrame, label_map_pbtxt, object_detection_example};
use fmltc_media::tfrecord::TfRecordWriter;
use prost::Message;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use sqlx::types::Json;
use tracing::{debug, info, warn};

use crate::action::{ActionKind, FrameRef, create_action_parameters};
use crate::blob_names::{label_map_blob, partial_record_blob, record_blob};
use crate::error::Result;
use crate::resumption::{Checkpoint, Invocation};
use crate::services::ActionServices;
use crate::trigger::{TriggerOutcome, trigger_via_queue};

/// Seed of the split shuffle. Re-running a split yields the same shards.
pub const SPLIT_SEED: u64 = 0x666d_6c74_63;

const TFRECORD_CONTENT_TYPE: &str = "application/octet-stream";
const LABEL_MAP_CONTENT_TYPE: &str = "text/plain";

/// One planned shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedShard {
    /// Global shard number; evaluation shards come first.
    pub record_number: i64,
    /// Shard belongs to the evaluation split.
    pub is_eval: bool,
    /// Frames in write order.
    pub frames: Vec<FrameRef>,
}

/// Result of [`plan_split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    /// Frames in the evaluation split.
    pub eval_frame_count: i64,
    /// Frames in the training split.
    pub train_frame_count: i64,
    /// Evaluation shards.
    pub eval_records: Vec<PlannedShard>,
    /// Training shards.
    pub train_records: Vec<PlannedShard>,
}

impl SplitPlan {
    /// All shards, evaluation first.
    pub fn shards(&self) -> impl Iterator<Item = &PlannedShard> {
        self.eval_records.iter().chain(self.train_records.iter())
    }
}

/// Shuffle `frames` deterministically and cut them into evaluation and
/// training shards of at most `max_frames_per_record` frames.
///
/// The evaluation split holds `round(n * eval_percent / 100)` frames, kept
/// within `[1, n - 1]`. Frames are dealt to a split's shards round-robin.
pub fn plan_split(
    mut frames: Vec<FrameRef>,
    eval_percent: f64,
    max_frames_per_record: usize,
) -> std::result::Result<SplitPlan, CoreError> {
    let n = frames.len();
    if n < 2 {
        return Err(CoreError::validation(
            "frames",
            format!("a dataset needs at least 2 included frames, found {n}"),
        ));
    }
    if !(0.0..=100.0).contains(&eval_percent) {
        return Err(CoreError::validation(
            "eval_percent",
            format!("{eval_percent} is not between 0 and 100"),
        ));
    }
    let max_frames_per_record = max_frames_per_record.max(1);

    frames.shuffle(&mut StdRng::seed_from_u64(SPLIT_SEED));
    let eval_count = ((n as f64 * eval_percent / 100.0).round() as usize).clamp(1, n - 1);
    let train = frames.split_off(eval_count);
    let eval = frames;

    let eval_records = deal(eval, max_frames_per_record, true, 0);
    let train_records = deal(
        train,
        max_frames_per_record,
        false,
        eval_records.len() as i64,
    );
    Ok(SplitPlan {
        eval_frame_count: eval_count as i64,
        train_frame_count: (n - eval_count) as i64,
        eval_records,
        train_records,
    })
}

fn deal(frames: Vec<FrameRef>, max: usize, is_eval: bool, first_number: i64) -> Vec<PlannedShard> {
    let record_count = frames.len().div_ceil(max);
    let mut shards: Vec<PlannedShard> = (0..record_count)
        .map(|i| PlannedShard {
            record_number: first_number + i as i64,
            is_eval,
            frames: Vec::new(),
        })
        .collect();
    for (index, frame) in frames.into_iter().enumerate() {
        shards[index % record_count].frames.push(frame);
    }
    shards
}

/// Plan the split of `dataset_id` and trigger its shard actions.
pub async fn produce_dataset(inv: &mut Invocation<'_>, dataset_id: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    let dataset = services.store.get_dataset(&team_id, dataset_id).await?;
    if dataset.delete_in_progress || dataset.dataset_completed {
        debug!(dataset_id, "Dataset needs no production");
        return Ok(Checkpoint::Continue);
    }

    let frames = services
        .store
        .included_frames(&team_id, &dataset.video_ids.0)
        .await?;
    let mut labels = BTreeSet::new();
    for frame in &frames {
        match parse_bboxes(&frame.bboxes_text) {
            Ok(boxes) => labels.extend(boxes.into_iter().map(|b| b.label)),
            Err(e) => warn!(
                dataset_id,
                video_id = %frame.video_id,
                frame_number = frame.frame_number,
                error = %e,
                "Ignoring unreadable boxes"
            ),
        }
    }
    let refs = frames
        .iter()
        .map(|f| FrameRef {
            video_id: f.video_id.clone(),
            frame_number: f.frame_number,
        })
        .collect();

    let limits = services.limits().await?;
    let plan = plan_split(refs, dataset.eval_percent, limits.max_frames_per_record as usize)?;
    services
        .store
        .set_dataset_split(
            dataset_id,
            &DatasetSplit {
                sorted_label_list: labels.into_iter().collect(),
                train_frame_count: plan.train_frame_count,
                train_record_count: plan.train_records.len() as i64,
                eval_frame_count: plan.eval_frame_count,
                eval_record_count: plan.eval_records.len() as i64,
            },
        )
        .await?;
    info!(
        dataset_id,
        train_frames = plan.train_frame_count,
        eval_frames = plan.eval_frame_count,
        train_records = plan.train_records.len(),
        eval_records = plan.eval_records.len(),
        "Dataset split planned"
    );

    let finished: HashSet<i64> = services
        .store
        .list_dataset_records(dataset_id)
        .await?
        .into_iter()
        .map(|r| r.record_number)
        .collect();
    for shard in plan.shards() {
        if finished.contains(&shard.record_number) {
            continue;
        }
        let params = create_action_parameters(
            team_id.clone(),
            ActionKind::DatasetProduceRecord {
                dataset_id: dataset_id.to_string(),
                record_number: shard.record_number,
                is_eval: shard.is_eval,
                frames: shard.frames.clone(),
            },
        );
        // A live shard action dedups; only a new one counts as progress.
        if let TriggerOutcome::Duplicate { .. } = trigger_via_queue(services, &params).await? {
            continue;
        }
        if inv.retrigger_if_necessary().await?.is_suspend() {
            return Ok(Checkpoint::Suspend);
        }
    }
    Ok(Checkpoint::Continue)
}

/// Write shard `record_number` of `dataset_id`.
pub async fn produce_record(
    inv: &mut Invocation<'_>,
    dataset_id: &str,
    record_number: i64,
    is_eval: bool,
    frames: &[FrameRef],
) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    let dataset = services.store.get_dataset(&team_id, dataset_id).await?;
    if dataset.delete_in_progress {
        return Ok(Checkpoint::Continue);
    }
    let records = services.store.list_dataset_records(dataset_id).await?;
    if records.iter().any(|r| r.record_number == record_number) {
        debug!(dataset_id, record_number, "Shard already stored");
        if dataset.dataset_completed && dataset.label_map_blob_name.is_none() {
            write_label_map(services, &team_id, &dataset).await?;
        }
        return Ok(Checkpoint::Continue);
    }

    let now = services.clock.now();
    let mut saved = DatasetRecordWriter {
        dataset_id: dataset_id.to_string(),
        record_number,
        is_eval,
        frames_written: 0,
        resume_frame_count: 0,
        partial_blob_name: None,
        label_counts: Json(Default::default()),
        negative_frame_count: 0,
        update_time: now,
    };
    let mut writer = TfRecordWriter::new();
    if let Some(existing) = services
        .store
        .get_record_writer(dataset_id, record_number)
        .await?
    {
        saved.frames_written = existing.frames_written;
        if let Some(partial) = existing
            .partial_blob_name
            .clone()
            .filter(|_| existing.resume_frame_count > 0)
        {
            match services.blobs.download(&partial).await {
                Ok(bytes) => {
                    writer = TfRecordWriter::resume(bytes, existing.resume_frame_count as usize);
                    saved = existing;
                }
                Err(e) if e.is_not_found() => {
                    warn!(dataset_id, record_number, "Partial shard is gone, starting over");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let start = saved.resume_frame_count.max(0) as usize;
    let mut counts = saved.label_counts.0.clone();
    let mut negatives = saved.negative_frame_count;
    let mut dimensions: HashMap<String, (u32, u32)> = HashMap::new();
    info!(dataset_id, record_number, is_eval, start, total = frames.len(), "Writing shard");

    for (index, frame_ref) in frames.iter().enumerate().skip(start) {
        let FrameRef {
            video_id,
            frame_number,
        } = frame_ref;
        let frame = services
            .store
            .get_video_frames(&team_id, video_id, *frame_number, *frame_number)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::not_found("video frame", format!("{video_id}/{frame_number}")))?;
        let image_blob = frame.image_blob_name.as_deref().ok_or_else(|| {
            CoreError::not_found("frame image", format!("{video_id}/{frame_number}"))
        })?;
        let jpeg = services.blobs.download(image_blob).await?;

        let (width, height) = match dimensions.get(video_id) {
            Some(dims) => *dims,
            None => {
                let video = services.store.get_video(&team_id, video_id).await?;
                let dims = (
                    video.width.unwrap_or_default() as u32,
                    video.height.unwrap_or_default() as u32,
                );
                dimensions.insert(video_id.clone(), dims);
                dims
            }
        };

        let boxes = parse_bboxes(&frame.bboxes_text).unwrap_or_else(|e| {
            warn!(video_id = %video_id, frame_number, error = %e, "Writing frame without boxes");
            Vec::new()
        });
        if boxes.is_empty() {
            negatives += 1;
        } else {
            for (label, count) in label_counts(&boxes) {
                *counts.entry(label).or_insert(0) += count;
            }
        }

        let source_id = format!("{video_id}/{frame_number}");
        let example = object_detection_example(
            &LabeledFrame {
                source_id: &source_id,
                jpeg: &jpeg,
                width,
                height,
                boxes: &boxes,
            },
            &dataset.sorted_label_list.0,
        );
        writer.write_record(&example.encode_to_vec());

        let written = index as i64 + 1;
        let live = services
            .store
            .save_record_writer(&DatasetRecordWriter {
                frames_written: written,
                update_time: services.clock.now(),
                ..saved.clone()
            })
            .await?;
        if !live {
            info!(dataset_id, record_number, "Dataset is being deleted, dropping shard");
            return Ok(Checkpoint::Continue);
        }

        if (index + 1) < frames.len() && inv.needs_retrigger() {
            let partial = partial_record_blob(&team_id, dataset_id, record_number);
            services
                .blobs
                .upload(&partial, writer.as_bytes(), TFRECORD_CONTENT_TYPE)
                .await?;
            saved = DatasetRecordWriter {
                frames_written: written,
                resume_frame_count: written,
                partial_blob_name: Some(partial.clone()),
                label_counts: Json(counts.clone()),
                negative_frame_count: negatives,
                update_time: services.clock.now(),
                ..saved
            };
            if !services.store.save_record_writer(&saved).await? {
                info!(dataset_id, record_number, "Dataset is being deleted, dropping shard");
                services.blobs.delete(&partial).await?;
                return Ok(Checkpoint::Continue);
            }
            debug!(dataset_id, record_number, written, "Shard checkpointed");
            return Ok(inv.retrigger_now().await?);
        }
    }

    let blob_name = record_blob(&team_id, dataset_id, record_number, is_eval);
    services
        .blobs
        .upload(&blob_name, writer.as_bytes(), TFRECORD_CONTENT_TYPE)
        .await?;
    let outcome = services
        .store
        .store_dataset_record_and_check_complete(&DatasetRecord {
            dataset_id: dataset_id.to_string(),
            record_number,
            is_eval,
            tf_record_blob_name: blob_name.clone(),
            label_counts: Json(counts),
            negative_frame_count: negatives,
            create_time: services.clock.now(),
        })
        .await?;
    if let Some(partial) = &saved.partial_blob_name {
        services.blobs.delete(partial).await?;
    }
    if outcome == RecordOutcome::Discarded {
        info!(dataset_id, record_number, "Dataset is being deleted, dropping shard");
        services.blobs.delete(&blob_name).await?;
        return Ok(Checkpoint::Continue);
    }
    let completed = outcome == RecordOutcome::Completed;
    info!(
        dataset_id,
        record_number,
        records = writer.record_count(),
        completed,
        "Shard stored"
    );

    if completed {
        write_label_map(services, &team_id, &dataset).await?;
        info!(dataset_id, "Dataset completed");
    }
    Ok(Checkpoint::Continue)
}

async fn write_label_map(services: &ActionServices, team_id: &str, dataset: &Dataset) -> Result<()> {
    let blob_name = label_map_blob(team_id, &dataset.dataset_id);
    services
        .blobs
        .upload(
            &blob_name,
            label_map_pbtxt(&dataset.sorted_label_list.0).as_bytes(),
            LABEL_MAP_CONTENT_TYPE,
        )
        .await?;
    if !services
        .store
        .set_label_map_blob_name(&dataset.dataset_id, &blob_name)
        .await?
    {
        services.blobs.delete(&blob_name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: i64) -> Vec<FrameRef> {
        (0..n)
            .map(|i| FrameRef {
                video_id: format!("v{}", i % 3),
                frame_number: i,
            })
            .collect()
    }

    #[test]
    fn splits_120_frames_at_20_percent() {
        let plan = plan_split(frames(120), 20.0, 50).unwrap();
        assert_eq!(plan.eval_frame_count, 24);
        assert_eq!(plan.train_frame_count, 96);
        assert_eq!(plan.eval_records.len(), 1);
        assert_eq!(plan.train_records.len(), 2);
        assert_eq!(plan.eval_records[0].frames.len(), 24);
        assert_eq!(plan.train_records[0].frames.len(), 48);
        assert_eq!(plan.train_records[1].frames.len(), 48);

        let numbers: Vec<(i64, bool)> = plan.shards().map(|s| (s.record_number, s.is_eval)).collect();
        assert_eq!(numbers, vec![(0, true), (1, false), (2, false)]);

        let mut all: Vec<FrameRef> = plan.shards().flat_map(|s| s.frames.clone()).collect();
        all.sort_by_key(|f| f.frame_number);
        assert_eq!(all, frames(120));
    }

    #[test]
    fn deals_round_robin() {
        let plan = plan_split(frames(10), 50.0, 2).unwrap();
        let train = &plan.train_records;
        assert_eq!(train.len(), 3);
        assert_eq!(
            train.iter().map(|s| s.frames.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
    }

    #[test]
    fn split_is_deterministic() {
        let a = plan_split(frames(40), 25.0, 7).unwrap();
        let b = plan_split(frames(40), 25.0, 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn eval_split_is_clamped() {
        let none = plan_split(frames(5), 0.0, 50).unwrap();
        assert_eq!(none.eval_frame_count, 1);
        let all = plan_split(frames(5), 100.0, 50).unwrap();
        assert_eq!(all.eval_frame_count, 4);
        assert_eq!(all.train_frame_count, 1);
    }

    #[test]
    fn rejects_tiny_datasets_and_bad_percentages() {
        assert!(plan_split(frames(1), 20.0, 50).is_err());
        assert!(plan_split(frames(10), 120.0, 50).is_err());
    }
}
