#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use tract_onnx::prelude::*;

use crate::detect::backend::FaceDetector;
use crate::detect::backends::ssd::decode_rows;
use crate::detect::result::DetectionBatch;
use crate::frame::{Frame, PixelFormat};

/// Per-channel mean subtracted from the input, in BGR order.
const CHANNEL_MEANS: [f32; 3] = [104.0, 177.0, 123.0];

/// Tract-based SSD face detector.
///
/// Loads a local ONNX model once and runs it on every frame. The model takes
/// a square BGR input with mean subtraction and emits SSD detection rows.
pub struct TractFaceDetector {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    min_confidence: f32,
}

impl TractFaceDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            min_confidence: 0.5,
        })
    }

    /// Override the default minimum confidence.
    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width(), frame.height(), frame.pixels().to_vec())
                .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let side = self.input_size;
        let resized = imageops::resize(&buffer, side, side, FilterType::Triangle);

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, side as usize, side as usize),
            |(_, channel, y, x)| {
                resized.get_pixel(x as u32, y as u32)[channel] as f32 - CHANNEL_MEANS[channel]
            },
        );
        Ok(input.into_tensor())
    }
}

impl FaceDetector for TractFaceDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_format(&self) -> PixelFormat {
        PixelFormat::Bgr24
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let rows: Vec<f32> = rows.iter().copied().collect();
        Ok(decode_rows(
            &rows,
            frame.width(),
            frame.height(),
            self.min_confidence,
        ))
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let len = (side as usize)
            .checked_mul(side as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("model input size {} overflows a frame", side))?;
        let blank = Frame::new(
            vec![0u8; len],
            side,
            side,
            PixelFormat::Bgr24,
        )?;
        self.detect(&blank).map(|_| ())
    }
}
