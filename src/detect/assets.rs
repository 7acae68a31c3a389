use std::path::{Path, PathBuf};

use crate::error::AttendanceError;

/// Files a detector backend needs on disk before it can be built.
#[derive(Clone, Debug)]
pub struct ModelAssets {
    dir: PathBuf,
    required: Vec<String>,
}

impl ModelAssets {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            required: Vec::new(),
        }
    }

    pub fn require(mut self, file_name: &str) -> Self {
        self.required.push(file_name.to_string());
        self
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Fail with the first missing asset. Startup must abort on error.
    pub fn verify(&self) -> Result<(), AttendanceError> {
        for name in &self.required {
            let path = self.path(name);
            if !path.is_file() {
                return Err(AttendanceError::ModelAssetMissing(path));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_reports_first_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("present.onnx"), b"onnx")?;

        let assets = ModelAssets::new(dir.path())
            .require("present.onnx")
            .require("absent.onnx");
        match assets.verify() {
            Err(AttendanceError::ModelAssetMissing(path)) => {
                assert_eq!(path, dir.path().join("absent.onnx"));
            }
            other => panic!("expected ModelAssetMissing, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn verify_passes_when_all_present() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("model.onnx"), b"onnx")?;
        ModelAssets::new(dir.path()).require("model.onnx").verify()?;
        Ok(())
    }
}
