// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Training event files.
//!
//! Event files are TFRecord streams of `tensorflow.Event` messages. Only the
//! parts the training monitor mirrors are modelled: the step and the summary
//! values. Scalars come either as `simple_value` or as a one-element float
//! tensor; images come either as `Summary.Image` or as a string tensor
//! `[width, height, encoded...]`.

use prost::Message;

use crate::error::MediaError;
use crate::tfrecord::{TRUNCATED, TfRecordReader, TfRecordWriter};

/// `tensorflow.Event` (subset).
#[derive(Clone, PartialEq, Message)]
pub struct Event {
    /// Wall time in seconds.
    #[prost(double, tag = "1")]
    pub wall_time: f64,
    /// Global step.
    #[prost(int64, tag = "2")]
    pub step: i64,
    /// Version header of the first event in a file.
    #[prost(string, optional, tag = "3")]
    pub file_version: Option<String>,
    /// Summary payload.
    #[prost(message, optional, tag = "5")]
    pub summary: Option<Summary>,
}

/// `tensorflow.Summary`
#[derive(Clone, PartialEq, Message)]
pub struct Summary {
    /// Tagged values.
    #[prost(message, repeated, tag = "1")]
    pub value: Vec<SummaryValueProto>,
}

/// `tensorflow.Summary.Value` (subset).
#[derive(Clone, PartialEq, Message)]
pub struct SummaryValueProto {
    /// Tag.
    #[prost(string, tag = "1")]
    pub tag: String,
    /// Scalar (TF1 style).
    #[prost(float, optional, tag = "2")]
    pub simple_value: Option<f32>,
    /// Image (TF1 style).
    #[prost(message, optional, tag = "4")]
    pub image: Option<SummaryImage>,
    /// Tensor (TF2 style).
    #[prost(message, optional, tag = "8")]
    pub tensor: Option<TensorProto>,
}

/// `tensorflow.Summary.Image`
#[derive(Clone, PartialEq, Message)]
pub struct SummaryImage {
    /// Height in pixels.
    #[prost(int32, tag = "1")]
    pub height: i32,
    /// Width in pixels.
    #[prost(int32, tag = "2")]
    pub width: i32,
    /// Channel count.
    #[prost(int32, tag = "3")]
    pub colorspace: i32,
    /// PNG bytes.
    #[prost(bytes = "vec", tag = "4")]
    pub encoded_image_string: Vec<u8>,
}

/// `tensorflow.TensorProto` (subset).
#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    /// Element type.
    #[prost(int32, tag = "1")]
    pub dtype: i32,
    /// Packed element bytes.
    #[prost(bytes = "vec", tag = "4")]
    pub tensor_content: Vec<u8>,
    /// Float elements.
    #[prost(float, repeated, tag = "5")]
    pub float_val: Vec<f32>,
    /// Double elements.
    #[prost(double, repeated, tag = "6")]
    pub double_val: Vec<f64>,
    /// String elements.
    #[prost(bytes = "vec", repeated, tag = "8")]
    pub string_val: Vec<Vec<u8>>,
}

/// `DT_FLOAT`
pub const DT_FLOAT: i32 = 1;
/// `DT_DOUBLE`
pub const DT_DOUBLE: i32 = 2;
/// `DT_STRING`
pub const DT_STRING: i32 = 7;

/// A mirrored summary value.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryValue {
    /// A number.
    Scalar(f64),
    /// An encoded image.
    Image {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
        /// Encoded (PNG) bytes.
        encoded: Vec<u8>,
    },
}

/// One value at one step.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    /// Training step.
    pub step: i64,
    /// Summary tag.
    pub tag: String,
    /// The value.
    pub value: SummaryValue,
}

/// Extract all scalar and image summaries from an event file.
///
/// A truncated final record (the file is still being written) ends the
/// scan without error; it is picked up again once the file grows.
pub fn parse_event_file(bytes: &[u8]) -> Result<Vec<SummaryEntry>, MediaError> {
    let mut entries = Vec::new();
    for record in TfRecordReader::new(bytes) {
        let record = match record {
            Ok(record) => record,
            Err(MediaError::CorruptRecord {
                reason: TRUNCATED, ..
            }) => break,
            Err(e) => return Err(e),
        };
        let event = Event::decode(record)?;
        let Some(summary) = event.summary else {
            continue;
        };
        for value in summary.value {
            if let Some(parsed) = summary_value(&value) {
                entries.push(SummaryEntry {
                    step: event.step,
                    tag: value.tag,
                    value: parsed,
                });
            }
        }
    }
    Ok(entries)
}

fn summary_value(value: &SummaryValueProto) -> Option<SummaryValue> {
    if let Some(v) = value.simple_value {
        return Some(SummaryValue::Scalar(v as f64));
    }
    if let Some(image) = &value.image {
        return Some(SummaryValue::Image {
            width: image.width.max(0) as u32,
            height: image.height.max(0) as u32,
            encoded: image.encoded_image_string.clone(),
        });
    }
    let tensor = value.tensor.as_ref()?;

    if tensor.string_val.len() >= 3 {
        // Image tensors: [width, height, image_0, image_1, ...]; keep the first.
        let width = std::str::from_utf8(&tensor.string_val[0]).ok()?.parse().ok()?;
        let height = std::str::from_utf8(&tensor.string_val[1]).ok()?.parse().ok()?;
        return Some(SummaryValue::Image {
            width,
            height,
            encoded: tensor.string_val[2].clone(),
        });
    }
    if let Some(v) = tensor.float_val.first() {
        return Some(SummaryValue::Scalar(*v as f64));
    }
    if let Some(v) = tensor.double_val.first() {
        return Some(SummaryValue::Scalar(*v));
    }
    match (tensor.dtype, tensor.tensor_content.len()) {
        (DT_FLOAT, 4) => {
            let bytes: [u8; 4] = tensor.tensor_content[..4].try_into().ok()?;
            Some(SummaryValue::Scalar(f32::from_le_bytes(bytes) as f64))
        }
        (DT_DOUBLE, 8) => {
            let bytes: [u8; 8] = tensor.tensor_content[..8].try_into().ok()?;
            Some(SummaryValue::Scalar(f64::from_le_bytes(bytes)))
        }
        _ => None,
    }
}

/// Encode events as an event file.
pub fn encode_event_file(events: &[Event]) -> Vec<u8> {
    let mut writer = TfRecordWriter::new();
    for event in events {
        writer.write_record(&event.encode_to_vec());
    }
    writer.into_bytes()
}

/// A scalar summary event (TF1 style).
pub fn scalar_event(step: i64, tag: &str, value: f32) -> Event {
    Event {
        wall_time: 0.0,
        step,
        file_version: None,
        summary: Some(Summary {
            value: vec![SummaryValueProto {
                tag: tag.to_string(),
                simple_value: Some(value),
                image: None,
                tensor: None,
            }],
        }),
    }
}
