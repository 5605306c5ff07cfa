use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PerceptionError, Result};
use gatewatch_common::utils::generate_unique_id;
use gatewatch_common::CameraConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PerceptionConfig {
    pub node_id: String,
    /// Used when `registry.url` is unset.
    pub cameras: Vec<CameraConfig>,
    pub registry: RegistryConfig,
    pub capture: CaptureConfig,
    pub processing: ProcessingConfig,
    pub tracking: TrackingConfig,
    pub recognition: RecognitionConfig,
    pub inference: InferenceConfig,
    pub messaging: MessagingConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub backoff_floor_secs: f64,
    pub backoff_cap_secs: f64,
    /// Frames are scaled to this size by the capture process.
    pub width: u32,
    pub height: u32,
    pub ffmpeg_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestionMode {
    /// Each camera worker drives its own pipeline frame by frame.
    Inline,
    /// Workers push into the shared frame queue; one batch processor runs inference.
    Batched,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    pub ingestion: IngestionMode,
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub dedup_iou_threshold: f32,
    /// Padding around a person box when cropping for face work.
    pub person_roi_padding: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TrackingConfig {
    pub iou_threshold: f32,
    pub max_age_secs: f64,
    pub min_hits: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecognitionConfig {
    pub enabled: bool,
    pub embeddings_url: Option<String>,
    pub api_token: Option<String>,
    pub match_threshold: f32,
    /// 0 disables periodic reloads.
    pub reload_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct InferenceConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MessagingConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub channel: String,
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_check_interval_sec: u64,
    pub report_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            node_id: format!("perception-{}", &generate_unique_id()[..8]),
            cameras: Vec::new(),
            registry: RegistryConfig::default(),
            capture: CaptureConfig::default(),
            processing: ProcessingConfig::default(),
            tracking: TrackingConfig::default(),
            recognition: RecognitionConfig::default(),
            inference: InferenceConfig::default(),
            messaging: MessagingConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backoff_floor_secs: 1.0,
            backoff_cap_secs: 30.0,
            width: 1280,
            height: 720,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ingestion: IngestionMode::Inline,
            max_queue_size: 250,
            batch_size: 8,
            batch_timeout_ms: 20,
            dedup_iou_threshold: 0.8,
            person_roi_padding: 40.0,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age_secs: 2.0,
            min_hits: 3,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            embeddings_url: None,
            api_token: None,
            match_threshold: 0.45,
            reload_interval_secs: 300,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            timeout_ms: 2000,
            jpeg_quality: 85,
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            channel: "ai_events".to_string(),
            publish_timeout_ms: 500,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_sec: 30,
            report_interval_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl CaptureConfig {
    pub fn backoff_floor(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_floor_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_cap_secs)
    }
}

impl MessagingConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms.max(1))
    }
}

impl ProcessingConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

impl PerceptionConfig {
    /// Load from a config file (any format the `config` crate understands)
    /// overlaid with `GATEWATCH__*` environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("GATEWATCH").separator("__"))
            .build()?;

        let config: PerceptionConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn unit_range(name: &str, value: f32) -> Result<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(PerceptionError::ConfigError(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )))
            }
        }

        unit_range("processing.dedup_iou_threshold", self.processing.dedup_iou_threshold)?;
        unit_range("tracking.iou_threshold", self.tracking.iou_threshold)?;
        unit_range("recognition.match_threshold", self.recognition.match_threshold)?;

        if self.processing.max_queue_size == 0 || self.processing.batch_size == 0 {
            return Err(PerceptionError::ConfigError(
                "processing.max_queue_size and processing.batch_size must be positive".to_string(),
            ));
        }
        if !self.tracking.max_age_secs.is_finite() || self.tracking.max_age_secs <= 0.0 {
            return Err(PerceptionError::ConfigError(
                "tracking.max_age_secs must be positive".to_string(),
            ));
        }
        if !self.capture.backoff_floor_secs.is_finite()
            || !self.capture.backoff_cap_secs.is_finite()
            || self.capture.backoff_floor_secs <= 0.0
            || self.capture.backoff_cap_secs < self.capture.backoff_floor_secs
        {
            return Err(PerceptionError::ConfigError(
                "capture backoff requires 0 < floor <= cap".to_string(),
            ));
        }
        Ok(())
    }
}
