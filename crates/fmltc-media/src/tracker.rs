// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-object trackers.
//!
//! A tracker is initialised with a box on one frame and then fed the
//! following frames in order, reporting where the object moved. Trackers are
//! selected by name when tracking starts.

use image::{GrayImage, RgbImage};

use crate::bbox::BoundingBox;
use crate::error::MediaError;

/// Names accepted by [`create_tracker`].
pub const TRACKER_NAMES: &[&str] = &["template"];

/// Follows one box through consecutive frames.
pub trait ObjectTracker: Send {
    /// Start tracking `bbox` on `frame`.
    fn init(&mut self, frame: &RgbImage, bbox: &BoundingBox) -> Result<(), MediaError>;

    /// Locate the object on the next frame. `None` when it was lost.
    fn update(&mut self, frame: &RgbImage) -> Option<BoundingBox>;
}

/// Build a tracker by name.
pub fn create_tracker(name: &str) -> Result<Box<dyn ObjectTracker>, MediaError> {
    match name {
        "template" => Ok(Box::new(TemplateTracker::default())),
        other => Err(MediaError::UnknownTracker(other.to_string())),
    }
}

/// Sum-of-absolute-differences template matching in a window around the
/// previous position.
#[derive(Debug, Default)]
pub struct TemplateTracker {
    state: Option<TemplateState>,
}

#[derive(Debug)]
struct TemplateState {
    template: GrayImage,
    bbox: BoundingBox,
}

/// Mean absolute difference above which the object counts as lost.
const LOST_THRESHOLD: f64 = 60.0;
/// Template matches below this refresh the template.
const REFRESH_THRESHOLD: f64 = 12.0;
/// At most this many samples per template axis.
const MAX_SAMPLES: u32 = 32;

impl TemplateTracker {
    fn search_radius(bbox: &BoundingBox) -> i32 {
        (bbox.width().max(bbox.height()) / 2).clamp(8, 48)
    }

    /// Mean absolute difference of the template placed at (`x`, `y`).
    fn score(frame: &GrayImage, template: &GrayImage, x: i32, y: i32) -> Option<f64> {
        let (fw, fh) = frame.dimensions();
        let (tw, th) = template.dimensions();
        if x < 0 || y < 0 || x as u32 + tw > fw || y as u32 + th > fh {
            return None;
        }
        let step_x = (tw / MAX_SAMPLES).max(1);
        let step_y = (th / MAX_SAMPLES).max(1);

        let mut total = 0u64;
        let mut samples = 0u64;
        for ty in (0..th).step_by(step_y as usize) {
            for tx in (0..tw).step_by(step_x as usize) {
                let a = template.get_pixel(tx, ty)[0] as i32;
                let b = frame.get_pixel(x as u32 + tx, y as u32 + ty)[0] as i32;
                total += (a - b).unsigned_abs() as u64;
                samples += 1;
            }
        }
        (samples > 0).then(|| total as f64 / samples as f64)
    }

    fn best_in(
        frame: &GrayImage,
        template: &GrayImage,
        center: (i32, i32),
        radius: i32,
        step: usize,
    ) -> Option<(i32, i32, f64)> {
        let mut best: Option<(i32, i32, f64)> = None;
        for dy in (-radius..=radius).step_by(step) {
            for dx in (-radius..=radius).step_by(step) {
                let (x, y) = (center.0 + dx, center.1 + dy);
                if let Some(score) = Self::score(frame, template, x, y)
                    && best.is_none_or(|(_, _, s)| score < s)
                {
                    best = Some((x, y, score));
                }
            }
        }
        best
    }
}

fn crop(gray: &GrayImage, bbox: &BoundingBox) -> GrayImage {
    image::imageops::crop_imm(
        gray,
        bbox.x1 as u32,
        bbox.y1 as u32,
        bbox.width() as u32,
        bbox.height() as u32,
    )
    .to_image()
}

impl ObjectTracker for TemplateTracker {
    fn init(&mut self, frame: &RgbImage, bbox: &BoundingBox) -> Result<(), MediaError> {
        let (fw, fh) = frame.dimensions();
        if bbox.width() <= 0 || bbox.height() <= 0 {
            return Err(MediaError::TrackerInit("box has no area".into()));
        }
        if bbox.x1 < 0 || bbox.y1 < 0 || bbox.x2 as u32 > fw || bbox.y2 as u32 > fh {
            return Err(MediaError::TrackerInit(format!(
                "box {},{},{},{} is outside the {fw}x{fh} frame",
                bbox.x1, bbox.y1, bbox.x2, bbox.y2
            )));
        }
        let gray = image::imageops::grayscale(frame);
        self.state = Some(TemplateState {
            template: crop(&gray, bbox),
            bbox: bbox.clone(),
        });
        Ok(())
    }

    fn update(&mut self, frame: &RgbImage) -> Option<BoundingBox> {
        let state = self.state.as_mut()?;
        let gray = image::imageops::grayscale(frame);
        let radius = Self::search_radius(&state.bbox);
        let origin = (state.bbox.x1, state.bbox.y1);

        // Coarse pass on a grid, then refine around the best coarse hit.
        let (cx, cy, _) = Self::best_in(&gray, &state.template, origin, radius, 2)?;
        let (x, y, score) = Self::best_in(&gray, &state.template, (cx, cy), 2, 1)?;
        if score > LOST_THRESHOLD {
            return None;
        }

        let moved = BoundingBox {
            x1: x,
            y1: y,
            x2: x + state.bbox.width(),
            y2: y + state.bbox.height(),
            label: state.bbox.label.clone(),
        };
        if score < REFRESH_THRESHOLD {
            state.template = crop(&gray, &moved);
        }
        state.bbox = moved.clone();
        Some(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame_with_square(x: u32, y: u32) -> RgbImage {
        let mut frame = RgbImage::from_pixel(160, 120, Rgb([20, 20, 20]));
        for dy in 0..20 {
            for dx in 0..20 {
                // Gradient so the square has internal structure.
                let shade = 150 + (dx * 5) as u8;
                frame.put_pixel(x + dx, y + dy, Rgb([shade, shade, 255]));
            }
        }
        frame
    }

    fn square(x: i32, y: i32) -> BoundingBox {
        BoundingBox {
            x1: x,
            y1: y,
            x2: x + 20,
            y2: y + 20,
            label: "robot".to_string(),
        }
    }

    #[test]
    fn follows_a_moving_square() {
        let mut tracker = create_tracker("template").unwrap();
        tracker.init(&frame_with_square(40, 40), &square(40, 40)).unwrap();

        let moved = tracker.update(&frame_with_square(45, 43)).unwrap();
        assert_eq!(moved, square(45, 43));
        let moved = tracker.update(&frame_with_square(51, 40)).unwrap();
        assert_eq!(moved, square(51, 40));
    }

    #[test]
    fn reports_lost_object() {
        let mut tracker = TemplateTracker::default();
        tracker.init(&frame_with_square(40, 40), &square(40, 40)).unwrap();
        let empty = RgbImage::from_pixel(160, 120, Rgb([0, 0, 0]));
        assert!(tracker.update(&empty).is_none());
    }

    #[test]
    fn rejects_bad_boxes_and_names() {
        let mut tracker = TemplateTracker::default();
        let frame = frame_with_square(0, 0);
        assert!(tracker.init(&frame, &square(150, 110)).is_err());
        assert!(tracker.update(&frame).is_none());
        assert!(matches!(
            create_tracker("kcf"),
            Err(MediaError::UnknownTracker(_))
        ));
    }
}
