//! Post-processing for single-shot face detectors.
//!
//! Output rows are `[image_id, label, confidence, x1, y1, x2, y2]` with box
//! corners normalised to 0..1.

use crate::detect::result::{BoundingBox, Detection, DetectionBatch};

pub const SSD_ROW_LEN: usize = 7;

/// Fraction of box width/height added on each side.
const BOX_PADDING: f32 = 0.1;

/// Turn raw detector rows into pixel-space detections.
///
/// Rows at or below `min_confidence` are dropped. Kept boxes are scaled to
/// the frame, padded and clamped to the frame bounds. Trailing partial rows
/// are ignored.
pub fn decode_rows(
    rows: &[f32],
    frame_width: u32,
    frame_height: u32,
    min_confidence: f32,
) -> DetectionBatch {
    let w = frame_width as f32;
    let h = frame_height as f32;
    let mut detections = Vec::new();
    for row in rows.chunks_exact(SSD_ROW_LEN) {
        let confidence = row[2];
        if !confidence.is_finite() || confidence <= min_confidence {
            continue;
        }
        let x1 = (row[3] * w) as i64;
        let y1 = (row[4] * h) as i64;
        let x2 = (row[5] * w) as i64;
        let y2 = (row[6] * h) as i64;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let pad_w = (BOX_PADDING * (x2 - x1) as f32) as i64;
        let pad_h = (BOX_PADDING * (y2 - y1) as f32) as i64;
        let x1 = (x1 - pad_w).max(0);
        let y1 = (y1 - pad_h).max(0);
        let x2 = (x2 + pad_w).min(frame_width as i64);
        let y2 = (y2 + pad_h).min(frame_height as i64);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        detections.push(Detection::new(
            BoundingBox::new(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32),
            confidence.min(1.0),
        ));
    }
    DetectionBatch::new(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_pads_and_clamps() {
        let rows = [
            0.0, 1.0, 0.9, 0.25, 0.25, 0.75, 0.75, // centred box
            0.0, 1.0, 0.8, 0.0, 0.0, 0.5, 0.5, // touches the origin
        ];
        let batch = decode_rows(&rows, 200, 100, 0.5);
        assert_eq!(batch.len(), 2);

        let first = batch.as_slice()[0];
        // 50..150 x 25..75, padded by 10 px and 5 px
        assert_eq!(first.bbox, BoundingBox::new(40, 20, 120, 60));
        assert_eq!(first.confidence, 0.9);

        let second = batch.as_slice()[1];
        assert_eq!(second.bbox, BoundingBox::new(0, 0, 110, 55));
    }

    #[test]
    fn drops_low_confidence_and_degenerate_rows() {
        let rows = [
            0.0, 1.0, 0.5, 0.1, 0.1, 0.2, 0.2, // at threshold
            0.0, 1.0, 0.95, 0.4, 0.4, 0.4, 0.6, // zero width
            0.0, 1.0, f32::NAN, 0.1, 0.1, 0.2, 0.2,
            0.0, 1.0, 0.9, // partial row
        ];
        assert!(decode_rows(&rows, 300, 300, 0.5).is_empty());
    }
}
