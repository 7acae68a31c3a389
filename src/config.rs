use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::pipeline::PipelineConfig;
use crate::policy::ApprovalPolicy;

const DEFAULT_DB_PATH: &str = "attendance.db";
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_CAMERA_URL: &str = "http://192.168.8.17:8080/video";
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_FALLBACK_PATHS: [&str; 2] = ["/mjpeg", "/stream"];
const DEFAULT_DETECTOR_BACKEND: &str = "tract";
const DEFAULT_MODEL_DIR: &str = "models";
const DEFAULT_MODEL: &str = "res10_300x300_ssd_iter_140000.onnx";
const DEFAULT_INPUT_SIZE: u32 = 300;
const MAX_INPUT_SIZE: u32 = 4096;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_APPROVAL_THRESHOLD: f32 = crate::policy::DEFAULT_APPROVAL_THRESHOLD;
const DEFAULT_DETECTION_INTERVAL_MS: u64 = 500;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
const DEFAULT_STREAM_IDLE_MS: u64 = 100;
const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Deserialize, Default)]
struct AttendancedConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    policy: Option<PolicyConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    read_timeout_ms: Option<u64>,
    fallback_paths: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_dir: Option<PathBuf>,
    model: Option<String>,
    input_size: Option<u32>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    approval_threshold: Option<f32>,
    detection_interval_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    stream_idle_ms: Option<u64>,
    history_limit: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorBackend {
    Tract,
    Stub,
}

impl DetectorBackend {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "tract" => Ok(DetectorBackend::Tract),
            "stub" => Ok(DetectorBackend::Stub),
            other => Err(anyhow!(
                "unknown detector backend '{}'; expected tract or stub",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttendancedConfig {
    pub db_path: String,
    pub api_addr: String,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub policy: PolicySettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub read_timeout: Duration,
    /// Paths tried on the camera host when `url` does not answer.
    pub fallback_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorBackend,
    pub model_dir: PathBuf,
    pub model: String,
    pub input_size: u32,
    pub min_confidence: f32,
}

impl DetectorSettings {
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model)
    }
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub approval_threshold: f32,
    pub detection_interval: Duration,
    pub reconnect_delay: Duration,
    pub stream_idle: Duration,
    pub history_limit: usize,
}

impl AttendancedConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ATTENDANCE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AttendancedConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            url: camera_file
                .url
                .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            read_timeout: Duration::from_millis(
                camera_file
                    .read_timeout_ms
                    .unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            fallback_paths: camera_file.fallback_paths.unwrap_or_else(|| {
                DEFAULT_FALLBACK_PATHS
                    .iter()
                    .map(|p| p.to_string())
                    .collect()
            }),
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: DetectorBackend::parse(
                detector_file
                    .backend
                    .as_deref()
                    .unwrap_or(DEFAULT_DETECTOR_BACKEND),
            )?,
            model_dir: detector_file
                .model_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_DIR)),
            model: detector_file
                .model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            input_size: detector_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            min_confidence: detector_file
                .min_confidence
                .unwrap_or(DEFAULT_MIN_CONFIDENCE),
        };

        let policy_file = file.policy.unwrap_or_default();
        let policy = PolicySettings {
            approval_threshold: policy_file
                .approval_threshold
                .unwrap_or(DEFAULT_APPROVAL_THRESHOLD),
            detection_interval: Duration::from_millis(
                policy_file
                    .detection_interval_ms
                    .unwrap_or(DEFAULT_DETECTION_INTERVAL_MS),
            ),
            reconnect_delay: Duration::from_millis(
                policy_file
                    .reconnect_delay_ms
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
            stream_idle: Duration::from_millis(
                policy_file.stream_idle_ms.unwrap_or(DEFAULT_STREAM_IDLE_MS),
            ),
            history_limit: policy_file.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        };

        Ok(Self {
            db_path,
            api_addr,
            camera,
            detector,
            policy,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("ATTENDANCE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("ATTENDANCE_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(path) = std::env::var("ATTENDANCE_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(backend) = std::env::var("ATTENDANCE_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = DetectorBackend::parse(&backend)?;
            }
        }
        if let Ok(dir) = std::env::var("ATTENDANCE_MODEL_DIR") {
            if !dir.trim().is_empty() {
                self.detector.model_dir = PathBuf::from(dir);
            }
        }
        if let Ok(threshold) = std::env::var("ATTENDANCE_APPROVAL_THRESHOLD") {
            self.policy.approval_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("ATTENDANCE_APPROVAL_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        ApprovalPolicy::new(self.policy.approval_threshold)?;
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(anyhow!(
                "detector min_confidence must be within [0, 1], got {}",
                self.detector.min_confidence
            ));
        }
        if self.detector.input_size == 0 || self.detector.input_size > MAX_INPUT_SIZE {
            return Err(anyhow!(
                "detector input_size must be within 1..={}, got {}",
                MAX_INPUT_SIZE,
                self.detector.input_size
            ));
        }
        for (name, value) in [
            ("camera read_timeout_ms", self.camera.read_timeout),
            ("detection_interval_ms", self.policy.detection_interval),
            ("reconnect_delay_ms", self.policy.reconnect_delay),
            ("stream_idle_ms", self.policy.stream_idle),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.policy.history_limit == 0 {
            return Err(anyhow!("history_limit must be greater than zero"));
        }

        let url = Url::parse(&self.camera.url)
            .map_err(|e| anyhow!("invalid camera url '{}': {}", self.camera.url, e))?;
        if !matches!(url.scheme(), "http" | "https" | "stub") {
            return Err(anyhow!(
                "camera url scheme '{}' not supported; expected http, https or stub",
                url.scheme()
            ));
        }
        if let Some(path) = self
            .camera
            .fallback_paths
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(anyhow!(
                "camera fallback path '{}' must start with '/'",
                path
            ));
        }
        Ok(())
    }

    pub fn approval_policy(&self) -> Result<ApprovalPolicy> {
        ApprovalPolicy::new(self.policy.approval_threshold)
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        Ok(PipelineConfig {
            policy: self.approval_policy()?,
            detection_interval: self.policy.detection_interval,
            reconnect_delay: self.policy.reconnect_delay,
        })
    }
}

fn read_config_file(path: &Path) -> Result<AttendancedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
