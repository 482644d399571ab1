// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `tf.train.Example` messages for object detection datasets.
//!
//! Feature keys follow the TensorFlow Object Detection API so the produced
//! TFRecords can be fed to its input pipeline unchanged. Box coordinates are
//! normalised to `[0, 1]`; class ids are 1-based positions in the dataset's
//! sorted label list.

use std::collections::BTreeMap;

use crate::bbox::BoundingBox;

/// `tf.train.BytesList`
#[derive(Clone, PartialEq, prost::Message)]
pub struct BytesList {
    /// Values.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub value: Vec<Vec<u8>>,
}

/// `tf.train.FloatList`
#[derive(Clone, PartialEq, prost::Message)]
pub struct FloatList {
    /// Values.
    #[prost(float, repeated, tag = "1")]
    pub value: Vec<f32>,
}

/// `tf.train.Int64List`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Int64List {
    /// Values.
    #[prost(int64, repeated, tag = "1")]
    pub value: Vec<i64>,
}

/// `tf.train.Feature`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Feature {
    /// The list this feature holds.
    #[prost(oneof = "feature::Kind", tags = "1, 2, 3")]
    pub kind: Option<feature::Kind>,
}

/// Nested types of [`Feature`].
pub mod feature {
    /// Feature payload.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        /// Byte strings.
        #[prost(message, tag = "1")]
        BytesList(super::BytesList),
        /// Floats.
        #[prost(message, tag = "2")]
        FloatList(super::FloatList),
        /// Integers.
        #[prost(message, tag = "3")]
        Int64List(super::Int64List),
    }
}

/// `tf.train.Features`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Features {
    /// Named features.
    #[prost(btree_map = "string, message", tag = "1")]
    pub feature: BTreeMap<String, Feature>,
}

/// `tf.train.Example`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Example {
    /// Features of this example.
    #[prost(message, optional, tag = "1")]
    pub features: Option<Features>,
}

fn bytes_feature(values: Vec<Vec<u8>>) -> Feature {
    Feature {
        kind: Some(feature::Kind::BytesList(BytesList { value: values })),
    }
}

fn float_feature(values: Vec<f32>) -> Feature {
    Feature {
        kind: Some(feature::Kind::FloatList(FloatList { value: values })),
    }
}

fn int64_feature(values: Vec<i64>) -> Feature {
    Feature {
        kind: Some(feature::Kind::Int64List(Int64List { value: values })),
    }
}

/// One labeled frame going into a shard.
#[derive(Debug, Clone)]
pub struct LabeledFrame<'a> {
    /// Unique frame identity, e.g. `<video_id>/<frame_number>`.
    pub source_id: &'a str,
    /// JPEG bytes.
    pub jpeg: &'a [u8],
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Boxes on this frame.
    pub boxes: &'a [BoundingBox],
}

/// Build the object detection example for one frame.
///
/// Boxes whose label is not in `sorted_labels` are skipped.
pub fn object_detection_example(frame: &LabeledFrame<'_>, sorted_labels: &[String]) -> Example {
    let width = frame.width.max(1) as f32;
    let height = frame.height.max(1) as f32;

    let mut xmins = Vec::new();
    let mut xmaxs = Vec::new();
    let mut ymins = Vec::new();
    let mut ymaxs = Vec::new();
    let mut class_texts = Vec::new();
    let mut class_ids = Vec::new();

    for b in frame.boxes {
        let Ok(index) = sorted_labels.binary_search(&b.label) else {
            continue;
        };
        xmins.push((b.x1 as f32 / width).clamp(0.0, 1.0));
        xmaxs.push((b.x2 as f32 / width).clamp(0.0, 1.0));
        ymins.push((b.y1 as f32 / height).clamp(0.0, 1.0));
        ymaxs.push((b.y2 as f32 / height).clamp(0.0, 1.0));
        class_texts.push(b.label.as_bytes().to_vec());
        class_ids.push(index as i64 + 1);
    }

    let mut feature = BTreeMap::new();
    feature.insert("image/height".into(), int64_feature(vec![frame.height as i64]));
    feature.insert("image/width".into(), int64_feature(vec![frame.width as i64]));
    feature.insert(
        "image/filename".into(),
        bytes_feature(vec![frame.source_id.as_bytes().to_vec()]),
    );
    feature.insert(
        "image/source_id".into(),
        bytes_feature(vec![frame.source_id.as_bytes().to_vec()]),
    );
    feature.insert("image/encoded".into(), bytes_feature(vec![frame.jpeg.to_vec()]));
    feature.insert("image/format".into(), bytes_feature(vec![b"jpeg".to_vec()]));
    feature.insert("image/object/bbox/xmin".into(), float_feature(xmins));
    feature.insert("image/object/bbox/xmax".into(), float_feature(xmaxs));
    feature.insert("image/object/bbox/ymin".into(), float_feature(ymins));
    feature.insert("image/object/bbox/ymax".into(), float_feature(ymaxs));
    feature.insert("image/object/class/text".into(), bytes_feature(class_texts));
    feature.insert("image/object/class/label".into(), int64_feature(class_ids));

    Example {
        features: Some(Features { feature }),
    }
}

/// `label_map.pbtxt` contents for `sorted_labels`.
pub fn label_map_pbtxt(sorted_labels: &[String]) -> String {
    sorted_labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            format!(
                "item {{\n  id: {}\n  name: '{}'\n}}\n",
                i + 1,
                label.replace('\\', "\\\\").replace('\'', "\\'")
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn labels() -> Vec<String> {
        vec!["ball".to_string(), "robot".to_string()]
    }

    #[test]
    fn builds_normalised_boxes_and_class_ids() {
        let boxes = vec![
            BoundingBox {
                x1: 10,
                y1: 20,
                x2: 50,
                y2: 60,
                label: "robot".to_string(),
            },
            BoundingBox {
                x1: 0,
                y1: 0,
                x2: 1,
                y2: 1,
                label: "unknown".to_string(),
            },
        ];
        let frame = LabeledFrame {
            source_id: "v1/7",
            jpeg: &[0xFF, 0xD8],
            width: 100,
            height: 200,
            boxes: &boxes,
        };

        let example = object_detection_example(&frame, &labels());
        let decoded = Example::decode(example.encode_to_vec().as_slice()).unwrap();
        let features = decoded.features.unwrap().feature;

        let Some(feature::Kind::FloatList(xmin)) = &features["image/object/bbox/xmin"].kind else {
            panic!("xmin should be a float list");
        };
        assert_eq!(xmin.value, vec![0.1]);
        let Some(feature::Kind::FloatList(ymax)) = &features["image/object/bbox/ymax"].kind else {
            panic!("ymax should be a float list");
        };
        assert_eq!(ymax.value, vec![0.3]);
        let Some(feature::Kind::Int64List(ids)) = &features["image/object/class/label"].kind else {
            panic!("label should be an int64 list");
        };
        assert_eq!(ids.value, vec![2]);
        let Some(feature::Kind::BytesList(source)) = &features["image/source_id"].kind else {
            panic!("source id should be bytes");
        };
        assert_eq!(source.value, vec![b"v1/7".to_vec()]);
    }

    #[test]
    fn label_map_lists_one_based_ids() {
        assert_eq!(
            label_map_pbtxt(&labels()),
            "item {\n  id: 1\n  name: 'ball'\n}\nitem {\n  id: 2\n  name: 'robot'\n}\n"
        );
    }
}
