// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Media error type.

/// Errors raised while decoding or encoding media.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// ffmpeg/ffprobe could not be started.
    #[error("ffprobe/ffmpeg binary not found: {0}")]
    ToolNotFound(std::io::Error),

    /// ffmpeg/ffprobe exited with an error.
    #[error("ffprobe/ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        /// Process exit code.
        exit_code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },

    /// Probe output could not be understood.
    #[error("failed to parse ffprobe output: {0}")]
    Probe(String),

    /// The input has no video stream.
    #[error("no video stream found")]
    NoVideoStream,

    /// Image decoding or encoding failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Protobuf decoding failed.
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A TFRecord frame is corrupt.
    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Byte offset of the record.
        offset: usize,
        /// What was wrong.
        reason: &'static str,
    },

    /// Bounding box text could not be parsed.
    #[error("invalid bounding box on line {line}: {reason}")]
    InvalidBox {
        /// One-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// No tracker with this name exists.
    #[error("unknown tracker '{0}'")]
    UnknownTracker(String),

    /// The tracker could not be initialised on the given box.
    #[error("tracker initialisation failed: {0}")]
    TrackerInit(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
