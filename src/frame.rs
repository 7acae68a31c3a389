//! Decoded video frames.
//!
//! - `Frame`: owned, packed 3-channel pixels with an explicit channel order.
//! - `PixelFormat`: channel order. Conversion happens at the detector boundary
//!   so each backend receives the order it declares.
//! - Annotation and JPEG encoding for the live view.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GenericImageView, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::{BoundingBox, DetectionBatch};

// Green is channel-order independent, so no RGB/BGR swap is needed.
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const CONFIDENCE_BAR_HEIGHT: u32 = 4;
const CONFIDENCE_BAR_GAP: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
}

/// One decoded frame. Pixels are row-major, 3 bytes per pixel.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    /// Decode a JPEG (or any format the `image` build supports) into RGB.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode jpeg")?;
        let (width, height) = image.dimensions();
        let rgb = image.into_rgb8();
        Self::new(rgb.into_raw(), width, height, PixelFormat::Rgb24)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Convert to the requested channel order. No-op when already there.
    pub fn into_format(mut self, target: PixelFormat) -> Self {
        if self.format != target {
            for px in self.data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            self.format = target;
        }
        self
    }

    /// Draw every detection box, plus a confidence bar above each box.
    pub fn annotate(&mut self, batch: &DetectionBatch) -> Result<()> {
        let data = std::mem::take(&mut self.data);
        let mut canvas = RgbImage::from_raw(self.width, self.height, data)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        let bounds = Rect::at(0, 0).of_size(self.width.max(1), self.height.max(1));

        for detection in batch {
            let Some(rect) = detection_rect(detection.bbox, bounds) else {
                continue;
            };
            draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
            if rect.width() > 2 && rect.height() > 2 {
                let inner = Rect::at(rect.left() + 1, rect.top() + 1)
                    .of_size(rect.width() - 2, rect.height() - 2);
                draw_hollow_rect_mut(&mut canvas, inner, BOX_COLOR);
            }
            if let Some(bar) = confidence_bar(rect, detection.confidence) {
                draw_filled_rect_mut(&mut canvas, bar, BOX_COLOR);
            }
        }

        self.data = canvas.into_raw();
        Ok(())
    }

    /// Encode as baseline JPEG. The output is always RGB-ordered.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let rgb;
        let pixels = match self.format {
            PixelFormat::Rgb24 => &self.data,
            PixelFormat::Bgr24 => {
                rgb = self.clone().into_format(PixelFormat::Rgb24);
                &rgb.data
            }
        };
        let mut out = Vec::with_capacity(self.data.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode jpeg")?;
        Ok(out)
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

/// Visible part of a detection box, or `None` when it lies outside the frame.
fn detection_rect(bbox: BoundingBox, bounds: Rect) -> Option<Rect> {
    if bbox.width == 0 || bbox.height == 0 {
        return None;
    }
    if bbox.x >= bounds.width() || bbox.y >= bounds.height() {
        return None;
    }
    let rect = Rect::at(bbox.x as i32, bbox.y as i32).of_size(
        bbox.width.min(bounds.width()),
        bbox.height.min(bounds.height()),
    );
    rect.intersect(bounds)
}

/// Bar above the box whose length is the confidence share of the box width.
fn confidence_bar(rect: Rect, confidence: f32) -> Option<Rect> {
    let len = (rect.width() as f32 * confidence.clamp(0.0, 1.0)).round() as u32;
    if len == 0 {
        return None;
    }
    let offset = (CONFIDENCE_BAR_HEIGHT + CONFIDENCE_BAR_GAP) as i32;
    let y = if rect.top() >= offset {
        rect.top() - offset
    } else {
        // No room above; draw just inside the top edge.
        rect.top() + BOX_THICKNESS as i32
    };
    Some(Rect::at(rect.left(), y).of_size(len, CONFIDENCE_BAR_HEIGHT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;

    fn black(width: u32, height: u32) -> Frame {
        Frame::new(vec![0u8; (width * height * 3) as usize], width, height, PixelFormat::Rgb24)
            .unwrap()
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let o = ((y * frame.width() + x) * 3) as usize;
        [frame.pixels()[o], frame.pixels()[o + 1], frame.pixels()[o + 2]]
    }

    #[test]
    fn rejects_length_mismatch() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, PixelFormat::Rgb24).is_err());
    }

    #[test]
    fn format_conversion_swaps_channels() -> Result<()> {
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Bgr24)?;
        let rgb = frame.into_format(PixelFormat::Rgb24);
        assert_eq!(rgb.pixels(), &[3, 2, 1, 6, 5, 4]);
        assert_eq!(rgb.format(), PixelFormat::Rgb24);

        let same = rgb.clone().into_format(PixelFormat::Rgb24);
        assert_eq!(same.pixels(), rgb.pixels());
        Ok(())
    }

    #[test]
    fn annotate_draws_two_pixel_outline_and_leaves_interior() -> Result<()> {
        let green = BOX_COLOR.0;
        let mut frame = black(40, 40);
        let batch = DetectionBatch::new(vec![Detection::new(
            BoundingBox::new(10, 10, 20, 20),
            0.5,
        )]);
        frame.annotate(&batch)?;

        assert_eq!(pixel(&frame, 10, 10), green);
        assert_eq!(pixel(&frame, 11, 20), green);
        assert_eq!(pixel(&frame, 29, 29), green);
        assert_eq!(pixel(&frame, 28, 15), green);
        assert_eq!(pixel(&frame, 12, 20), [0, 0, 0]);
        assert_eq!(pixel(&frame, 20, 20), [0, 0, 0]);
        // confidence bar: half the box width, above the box
        assert_eq!(pixel(&frame, 10, 5), green);
        assert_eq!(pixel(&frame, 19, 7), green);
        assert_eq!(pixel(&frame, 25, 5), [0, 0, 0]);
        assert_eq!(pixel(&frame, 10, 8), [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn annotate_clips_boxes_outside_frame() -> Result<()> {
        let mut frame = black(16, 16);
        let batch = DetectionBatch::new(vec![
            Detection::new(BoundingBox::new(8, 8, 100, 100), 0.9),
            Detection::new(BoundingBox::new(50, 50, 10, 10), 0.9),
            Detection::new(BoundingBox::new(2, 2, 0, 5), 0.9),
        ]);
        frame.annotate(&batch)?;
        assert_eq!(pixel(&frame, 15, 15), BOX_COLOR.0);
        assert_eq!(pixel(&frame, 2, 2), [0, 0, 0]);
        assert_eq!(frame.pixels().len(), 16 * 16 * 3);
        Ok(())
    }

    #[test]
    fn bar_moves_inside_box_near_top_edge() -> Result<()> {
        let mut frame = black(30, 30);
        let batch = DetectionBatch::new(vec![Detection::new(
            BoundingBox::new(4, 1, 20, 20),
            1.0,
        )]);
        frame.annotate(&batch)?;
        assert_eq!(pixel(&frame, 12, 1 + BOX_THICKNESS), BOX_COLOR.0);
        assert_eq!(pixel(&frame, 12, 0), [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() -> Result<()> {
        let frame = black(32, 24);
        let jpeg = frame.encode_jpeg(80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = Frame::from_jpeg(&jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        Ok(())
    }
}
