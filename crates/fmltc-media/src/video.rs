// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sequential video decoding and JPEG encoding.
//!
//! Frame extraction walks a video strictly in order: it first counts frames
//! with [`FrameSource::skip_frame`], then (possibly across several
//! invocations) skips the frames already extracted and decodes the rest with
//! [`FrameSource::read_frame`].
//!
//! [`FfmpegOpener`] decodes through an `ffmpeg` subprocess emitting raw RGB24
//! frames on stdout; [`InMemoryOpener`] serves prepared frames for tests.

use std::io::Cursor;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tracing::debug;

use crate::error::MediaError;

/// JPEG quality used for extracted frames.
pub const JPEG_QUALITY: u8 = 90;

/// Stream properties reported before decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProperties {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frames per second.
    pub fps: f64,
    /// Duration in seconds, 0 when unknown.
    pub duration_secs: f64,
}

/// An open video, read strictly in order.
#[async_trait]
pub trait FrameSource: Send {
    /// Properties of the video stream.
    fn properties(&self) -> VideoProperties;

    /// Advance past one frame. Returns false at the end of the stream.
    async fn skip_frame(&mut self) -> Result<bool, MediaError>;

    /// Decode the next frame. `None` at the end of the stream.
    async fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError>;
}

/// Opens video bytes for decoding.
#[async_trait]
pub trait VideoOpener: Send + Sync {
    /// Open `video` (the full file contents).
    async fn open(&self, video: &[u8]) -> Result<Box<dyn FrameSource>, MediaError>;
}

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, MediaError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(frame)?;
    Ok(out)
}

/// Decode a JPEG/PNG image into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, MediaError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Encode a frame as PNG.
pub fn encode_png(frame: &RgbImage) -> Result<Vec<u8>, MediaError> {
    let mut out = Cursor::new(Vec::new());
    frame.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    /// e.g. "30/1" or "24000/1001"
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0 && num > 0.0).then(|| num / den)
        }
        None => rate.trim().parse().ok().filter(|r: &f64| *r > 0.0),
    }
}

fn properties_from_probe(probe: &FfprobeOutput) -> Result<VideoProperties, MediaError> {
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(MediaError::NoVideoStream)?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(MediaError::Probe("video stream has no dimensions".into())),
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .ok_or_else(|| MediaError::Probe("video stream has no frame rate".into()))?;
    let duration_secs = stream
        .duration
        .as_deref()
        .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);

    Ok(VideoProperties {
        width,
        height,
        fps,
        duration_secs,
    })
}

async fn probe_video(path: &Path) -> Result<VideoProperties, MediaError> {
    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await
        .map_err(MediaError::ToolNotFound)?;

    if !output.status.success() {
        return Err(MediaError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let probe = serde_json::from_str::<FfprobeOutput>(&stdout)
        .map_err(|e| MediaError::Probe(format!("{e}: {stdout}")))?;
    properties_from_probe(&probe)
}

/// Decodes with the `ffmpeg` and `ffprobe` binaries on `PATH`.
#[derive(Debug, Default, Clone)]
pub struct FfmpegOpener;

impl FfmpegOpener {
    /// Create an opener.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VideoOpener for FfmpegOpener {
    async fn open(&self, video: &[u8]) -> Result<Box<dyn FrameSource>, MediaError> {
        let file = tempfile::NamedTempFile::new()?;
        tokio::fs::write(file.path(), video).await?;

        let properties = probe_video(file.path()).await?;
        let mut child = tokio::process::Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(file.path())
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(MediaError::ToolNotFound)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Probe("ffmpeg stdout unavailable".into()))?;

        debug!(
            width = properties.width,
            height = properties.height,
            fps = properties.fps,
            "Opened video for decoding"
        );

        Ok(Box::new(FfmpegSource {
            properties,
            frame_size: properties.width as usize * properties.height as usize * 3,
            stdout,
            _child: child,
            _file: file,
        }))
    }
}

struct FfmpegSource {
    properties: VideoProperties,
    frame_size: usize,
    stdout: ChildStdout,
    _child: Child,
    _file: tempfile::NamedTempFile,
}

impl FfmpegSource {
    /// Read one raw frame. A short read at the end counts as end of stream.
    async fn next_raw(&mut self) -> Result<Option<Vec<u8>>, MediaError> {
        let mut buf = vec![0u8; self.frame_size];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    fn properties(&self) -> VideoProperties {
        self.properties
    }

    async fn skip_frame(&mut self) -> Result<bool, MediaError> {
        Ok(self.next_raw().await?.is_some())
    }

    async fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        let Some(raw) = self.next_raw().await? else {
            return Ok(None);
        };
        RgbImage::from_raw(self.properties.width, self.properties.height, raw)
            .map(Some)
            .ok_or_else(|| MediaError::Probe("raw frame size mismatch".into()))
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Serves a fixed list of frames regardless of the input bytes.
#[derive(Debug, Clone)]
pub struct InMemoryOpener {
    frames: Vec<RgbImage>,
    fps: f64,
    decodable: Option<usize>,
    corrupt_at: Option<usize>,
}

impl InMemoryOpener {
    /// Frames all share the first frame's dimensions.
    pub fn new(frames: Vec<RgbImage>, fps: f64) -> Self {
        Self {
            frames,
            fps,
            decodable: None,
            corrupt_at: None,
        }
    }

    /// `count` solid-colour frames of `width`×`height`, each a different shade.
    pub fn solid(count: usize, width: u32, height: u32, fps: f64) -> Self {
        let frames = (0..count)
            .map(|i| RgbImage::from_pixel(width, height, image::Rgb([(i % 256) as u8, 64, 128])))
            .collect();
        Self::new(frames, fps)
    }

    /// Decoding stops after `count` frames even though skipping sees all of
    /// them, like a file whose tail is damaged.
    pub fn with_decodable_frames(mut self, count: usize) -> Self {
        self.decodable = Some(count);
        self
    }

    /// Skipping or decoding frame `index` fails, like a damaged packet in
    /// the middle of the stream.
    pub fn with_corrupt_packet_at(mut self, index: usize) -> Self {
        self.corrupt_at = Some(index);
        self
    }
}

#[async_trait]
impl VideoOpener for InMemoryOpener {
    async fn open(&self, _video: &[u8]) -> Result<Box<dyn FrameSource>, MediaError> {
        let first = self.frames.first().ok_or(MediaError::NoVideoStream)?;
        let properties = VideoProperties {
            width: first.width(),
            height: first.height(),
            fps: self.fps,
            duration_secs: self.frames.len() as f64 / self.fps,
        };
        Ok(Box::new(InMemorySource {
            frames: self.frames.clone(),
            decodable: self.decodable.unwrap_or(self.frames.len()),
            corrupt_at: self.corrupt_at,
            position: 0,
            properties,
        }))
    }
}

struct InMemorySource {
    frames: Vec<RgbImage>,
    decodable: usize,
    corrupt_at: Option<usize>,
    position: usize,
    properties: VideoProperties,
}

impl InMemorySource {
    fn check_packet(&self) -> Result<(), MediaError> {
        if self.corrupt_at == Some(self.position) {
            return Err(MediaError::ExecutionFailed {
                exit_code: Some(1),
                stderr: format!("corrupt packet at frame {}", self.position),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for InMemorySource {
    fn properties(&self) -> VideoProperties {
        self.properties
    }

    async fn skip_frame(&mut self) -> Result<bool, MediaError> {
        self.check_packet()?;
        if self.position < self.frames.len() {
            self.position += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        if self.position >= self.decodable.min(self.frames.len()) {
            return Ok(None);
        }
        self.check_packet()?;
        let frame = self.frames[self.position].clone();
        self.position += 1;
        Ok(Some(frame))
    }
}
