use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::backend::FaceDetector;
use crate::detect::result::{BoundingBox, Detection, DetectionBatch};
use crate::frame::Frame;

/// Scripted detector for tests and demos.
///
/// Each `detect` call pops the next scripted outcome. When the script is
/// exhausted the fallback batch is returned forever.
pub struct StubFaceDetector {
    script: VecDeque<Result<DetectionBatch, String>>,
    fallback: DetectionBatch,
    /// Demo mode: one face of this confidence in the middle third of the frame.
    centred_face: Option<f32>,
    calls: u64,
}

impl StubFaceDetector {
    /// Always return `batch`.
    pub fn fixed(batch: DetectionBatch) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: batch,
            centred_face: None,
            calls: 0,
        }
    }

    /// Demo detector: one centred face at 0.82 confidence.
    pub fn demo() -> Self {
        Self {
            centred_face: Some(0.82),
            ..Self::default()
        }
    }

    pub fn then_batch(mut self, batch: DetectionBatch) -> Self {
        self.script.push_back(Ok(batch));
        self
    }

    pub fn then_error(mut self, message: &str) -> Self {
        self.script.push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubFaceDetector {
    fn default() -> Self {
        Self::fixed(DetectionBatch::empty())
    }
}

impl FaceDetector for StubFaceDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(match self.centred_face {
                Some(confidence) => centred_face(frame, confidence),
                None => self.fallback.clone(),
            }),
        }
    }
}

fn centred_face(frame: &Frame, confidence: f32) -> DetectionBatch {
    let (w, h) = (frame.width() / 3, frame.height() / 3);
    DetectionBatch::new(vec![Detection::new(BoundingBox::new(w, h, w, h), confidence)])
}
