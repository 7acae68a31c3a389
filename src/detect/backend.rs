use anyhow::Result;

use crate::detect::result::DetectionBatch;
use crate::frame::{Frame, PixelFormat};

/// Face detector backend.
///
/// The model behind a backend is opaque: given a frame it returns zero or
/// more face boxes with confidence scores. Inference may take arbitrarily
/// long; callers must not hold shared locks across `detect`.
pub trait FaceDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Channel order the backend expects. Frames are converted before `detect`.
    fn input_format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    /// Run detection on a frame. Boxes are in the frame's pixel units.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn input_format(&self) -> PixelFormat {
        (**self).input_format()
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
