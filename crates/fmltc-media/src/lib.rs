// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Media codecs used by the fmltc action handlers.
//!
//! - [`video`]: frame-accurate sequential decoding (ffmpeg) and JPEG encoding
//! - [`bbox`]: the `x1,y1,x2,y2,label` text format of frame labels
//! - [`tfrecord`]: TFRecord framing (length + masked CRC32C)
//! - [`example`]: `tf.train.Example` messages for object detection and label maps
//! - [`event_file`]: scalar and image summaries from training event files
//! - [`tracker`]: single-object trackers used by interactive tracking
//!
//! Everything here is pure data transformation; no entity store or blob
//! store access.

#![deny(missing_docs)]

pub mod bbox;
pub mod error;
pub mod event_file;
pub mod example;
pub mod tfrecord;
pub mod tracker;
pub mod video;

pub use error::MediaError;
pub use image::RgbImage;
