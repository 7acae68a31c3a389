mod assets;
mod backend;
mod backends;
mod result;

use anyhow::Result;

use crate::config::{DetectorBackend, DetectorSettings};

pub use assets::ModelAssets;
pub use backend::FaceDetector;
pub use backends::ssd::decode_rows;
pub use backends::StubFaceDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractFaceDetector;
pub use result::{BoundingBox, Detection, DetectionBatch};

/// Build the configured detector.
///
/// Model files are checked before anything is loaded; a missing file fails
/// with `AttendanceError::ModelAssetMissing`.
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn FaceDetector>> {
    match settings.backend {
        DetectorBackend::Stub => {
            log::warn!("using stub face detector; detections are synthetic");
            Ok(Box::new(StubFaceDetector::demo()))
        }
        DetectorBackend::Tract => {
            ModelAssets::new(&settings.model_dir)
                .require(&settings.model)
                .verify()?;
            build_tract(settings)
        }
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectorSettings) -> Result<Box<dyn FaceDetector>> {
    let detector = TractFaceDetector::new(settings.model_path(), settings.input_size)?
        .with_min_confidence(settings.min_confidence);
    log::info!("loaded face model {}", settings.model_path().display());
    Ok(Box::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &DetectorSettings) -> Result<Box<dyn FaceDetector>> {
    Err(anyhow::anyhow!(
        "detector backend 'tract' requires building with --features backend-tract"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttendanceError;
    use std::path::PathBuf;

    fn settings(backend: DetectorBackend, model_dir: PathBuf) -> DetectorSettings {
        DetectorSettings {
            backend,
            model_dir,
            model: "res10_300x300_ssd_iter_140000.onnx".to_string(),
            input_size: 300,
            min_confidence: 0.5,
        }
    }

    #[test]
    fn missing_model_is_reported_before_loading() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let err = build_detector(&settings(DetectorBackend::Tract, dir.path().to_path_buf()))
            .err()
            .expect("missing model must fail");
        match err.downcast_ref::<AttendanceError>() {
            Some(AttendanceError::ModelAssetMissing(path)) => {
                assert_eq!(path, &dir.path().join("res10_300x300_ssd_iter_140000.onnx"))
            }
            other => panic!("expected ModelAssetMissing, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn stub_backend_needs_no_assets() -> anyhow::Result<()> {
        let detector = build_detector(&settings(
            DetectorBackend::Stub,
            PathBuf::from("/nonexistent"),
        ))?;
        assert_eq!(detector.name(), "stub");
        Ok(())
    }
}
