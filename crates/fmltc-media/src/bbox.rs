// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounding box text format.
//!
//! Frame labels are stored as text, one box per line:
//!
//! ```text
//! x1,y1,x2,y2,label
//! ```
//!
//! Coordinates are pixels in the frame. Blank lines are ignored.

use std::collections::BTreeMap;

use crate::error::MediaError;

/// One labeled box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    /// Left edge.
    pub x1: i32,
    /// Top edge.
    pub y1: i32,
    /// Right edge.
    pub x2: i32,
    /// Bottom edge.
    pub y2: i32,
    /// Object label.
    pub label: String,
}

impl BoundingBox {
    /// Box width in pixels.
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    /// Box height in pixels.
    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

/// Parse bounding box text. Corner order is normalised so `x1 <= x2` and
/// `y1 <= y2`; fractional coordinates are rounded.
pub fn parse_bboxes(text: &str) -> Result<Vec<BoundingBox>, MediaError> {
    let mut boxes = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let invalid = |reason: String| MediaError::InvalidBox {
            line: index + 1,
            reason,
        };

        let fields: Vec<&str> = line.splitn(5, ',').collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
        }
        let mut coords = [0i32; 4];
        for (slot, raw) in coords.iter_mut().zip(&fields[..4]) {
            let value: f64 = raw
                .trim()
                .parse()
                .map_err(|_| invalid(format!("'{}' is not a number", raw.trim())))?;
            *slot = value.round() as i32;
        }
        let label = fields[4].trim();
        if label.is_empty() {
            return Err(invalid("empty label".to_string()));
        }

        boxes.push(BoundingBox {
            x1: coords[0].min(coords[2]),
            y1: coords[1].min(coords[3]),
            x2: coords[0].max(coords[2]),
            y2: coords[1].max(coords[3]),
            label: label.to_string(),
        });
    }
    Ok(boxes)
}

/// Format boxes back to text, one line per box.
pub fn format_bboxes(boxes: &[BoundingBox]) -> String {
    boxes
        .iter()
        .map(|b| format!("{},{},{},{},{}\n", b.x1, b.y1, b.x2, b.y2, b.label))
        .collect()
}

/// Boxes per label.
pub fn label_counts(boxes: &[BoundingBox]) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for b in boxes {
        *counts.entry(b.label.clone()).or_insert(0) += 1;
    }
    counts
}
