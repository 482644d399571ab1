// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob naming scheme.
//!
//! Every blob of an entity lives under that entity's prefix, so deleting an
//! entity's blobs is a prefix listing.

/// Prefix of everything belonging to a video.
pub fn video_prefix(team_id: &str, video_id: &str) -> String {
    format!("videos/{team_id}/{video_id}/")
}

/// The uploaded video file.
pub fn video_blob(team_id: &str, video_id: &str) -> String {
    format!("{}video", video_prefix(team_id, video_id))
}

/// An extracted frame image.
pub fn frame_image_blob(team_id: &str, video_id: &str, frame_number: i64) -> String {
    format!(
        "{}frames/{frame_number:05}.jpg",
        video_prefix(team_id, video_id)
    )
}

/// Prefix of everything belonging to a dataset, including its zips.
pub fn dataset_prefix(team_id: &str, dataset_id: &str) -> String {
    format!("datasets/{team_id}/{dataset_id}/")
}

/// A finished TFRecord shard.
pub fn record_blob(team_id: &str, dataset_id: &str, record_number: i64, is_eval: bool) -> String {
    let split = if is_eval { "eval" } else { "train" };
    format!(
        "{}records/{split}_{record_number:05}.tfrecord",
        dataset_prefix(team_id, dataset_id)
    )
}

/// A checkpointed, partially written shard.
pub fn partial_record_blob(team_id: &str, dataset_id: &str, record_number: i64) -> String {
    format!(
        "{}partial/{record_number:05}.tfrecord",
        dataset_prefix(team_id, dataset_id)
    )
}

/// The dataset's label map.
pub fn label_map_blob(team_id: &str, dataset_id: &str) -> String {
    format!("{}label_map.pbtxt", dataset_prefix(team_id, dataset_id))
}

/// A finished zip partition.
pub fn zip_blob(team_id: &str, dataset_id: &str, dataset_zip_id: &str, partition: i64) -> String {
    format!(
        "{}zips/{dataset_zip_id}/{dataset_id}_{partition}.zip",
        dataset_prefix(team_id, dataset_id)
    )
}

/// A checkpointed, partially written zip partition.
pub fn partial_zip_blob(
    team_id: &str,
    dataset_id: &str,
    dataset_zip_id: &str,
    partition: i64,
) -> String {
    format!(
        "{}zips/{dataset_zip_id}/partial_{partition}.zip",
        dataset_prefix(team_id, dataset_id)
    )
}

/// Prefix of everything belonging to a model.
pub fn model_prefix(team_id: &str, model_id: &str) -> String {
    format!("models/{team_id}/{model_id}/")
}

/// Output directory of one of the model's jobs (`train` or `eval`). The
/// training service writes its event files here.
pub fn model_job_dir(team_id: &str, model_id: &str, job_type: &str) -> String {
    format!("{}{job_type}/", model_prefix(team_id, model_id))
}

/// An image summary copied out of an event file.
pub fn summary_image_blob(
    team_id: &str,
    model_id: &str,
    job_type: &str,
    step: i64,
    tag: &str,
) -> String {
    let tag: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!(
        "{}summaries/{job_type}/{tag}_{step}.png",
        model_prefix(team_id, model_id)
    )
}

/// The last path segment of a blob name.
pub fn file_name(blob_name: &str) -> &str {
    blob_name.rsplit('/').next().unwrap_or(blob_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_nest_under_entity_prefixes() {
        assert!(frame_image_blob("t", "v", 7).starts_with(&video_prefix("t", "v")));
        assert_eq!(frame_image_blob("t", "v", 7), "videos/t/v/frames/00007.jpg");
        assert!(zip_blob("t", "d", "z", 0).starts_with(&dataset_prefix("t", "d")));
        assert_eq!(
            record_blob("t", "d", 2, true),
            "datasets/t/d/records/eval_00002.tfrecord"
        );
        assert_eq!(
            summary_image_blob("t", "m", "eval", 100, "Detections/0"),
            "models/t/m/summaries/eval/Detections_0_100.png"
        );
        assert_eq!(file_name("a/b/c.zip"), "c.zip");
        assert_eq!(file_name("plain"), "plain");
    }
}
