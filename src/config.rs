use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{BlobParams, ComputeTarget, ModelSpec};
use crate::ingest::{SourceSettings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_VIDEO_STRIDE};
use crate::labels::ClassLabels;
use crate::pipeline::{ClassResolution, PipelineConfig};

const DEFAULT_DB_PATH: &str = "detections.db";
const DEFAULT_MODEL_PATH: &str = "model.onnx";
const DEFAULT_CONFIDENCE_PERCENT: i64 = 75;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 50;
const DEFAULT_SMTP_PORT: u16 = 25;
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "detectord";

/// Source list value meaning "use the catalog's configured streams".
pub const SOURCES_FROM_CATALOG: &str = "--";

#[derive(Debug, Deserialize, Default)]
struct AgentConfigFile {
    run_env: Option<String>,
    db_path: Option<String>,
    sources: Option<Vec<String>>,
    confidence: Option<i64>,
    video_stride: Option<u32>,
    connect_timeout_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    class_resolution: Option<String>,
    model: Option<ModelConfigFile>,
    smtp: Option<SmtpConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    path: Option<PathBuf>,
    labels: Option<PathBuf>,
    backend: Option<String>,
    target: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    scale: Option<f32>,
    swap_rb: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SmtpConfigFile {
    host: Option<String>,
    port: Option<u16>,
    from: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic_prefix: Option<String>,
}

/// Production persists events and alerts; inspection only renders results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    Production,
    Inspection,
}

impl OperatingMode {
    /// `prod` selects production, anything else inspection.
    pub fn from_run_env(value: &str) -> Self {
        if value.trim() == "prod" {
            Self::Production
        } else {
            Self::Inspection
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Inspection => write!(f, "inspection"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub mode: OperatingMode,
    pub db_path: String,
    /// Empty means the catalog's configured stream addresses.
    pub sources: Vec<String>,
    /// Integer percent as configured; see `confidence_threshold`.
    pub confidence_percent: i64,
    pub video_stride: u32,
    pub connect_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub class_resolution: ClassResolution,
    pub model: ModelSettings,
    pub smtp: Option<SmtpSettings>,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub labels_path: Option<PathBuf>,
    /// Registered backend name; `None` selects the registry default.
    pub backend: Option<String>,
    pub target: ComputeTarget,
    pub blob: BlobParams,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub topic_prefix: String,
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETECTOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AgentConfigFile) -> Result<Self> {
        let mode = file
            .run_env
            .as_deref()
            .map(OperatingMode::from_run_env)
            .unwrap_or(OperatingMode::Inspection);
        let class_resolution = match file.class_resolution.as_deref() {
            Some(raw) => raw.parse()?,
            None => ClassResolution::default(),
        };

        let model_file = file.model.unwrap_or_default();
        let defaults = BlobParams::default();
        let target = match model_file.target.as_deref() {
            Some(raw) => raw.parse()?,
            None => ComputeTarget::default(),
        };
        let model = ModelSettings {
            path: model_file
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            labels_path: model_file.labels,
            backend: model_file.backend,
            target,
            blob: BlobParams {
                scale: model_file.scale.unwrap_or(defaults.scale),
                width: model_file.input_width.unwrap_or(defaults.width),
                height: model_file.input_height.unwrap_or(defaults.height),
                swap_rb: model_file.swap_rb.unwrap_or(defaults.swap_rb),
                ..defaults
            },
        };

        let smtp = file.smtp.and_then(|smtp| {
            smtp.host.map(|host| SmtpSettings {
                host,
                port: smtp.port.unwrap_or(DEFAULT_SMTP_PORT),
                from: smtp.from.unwrap_or_default(),
            })
        });
        let mqtt = file.mqtt.and_then(|mqtt| {
            mqtt.broker.map(|broker| MqttSettings {
                broker,
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            })
        });

        Ok(Self {
            mode,
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            sources: file.sources.unwrap_or_default(),
            confidence_percent: file.confidence.unwrap_or(DEFAULT_CONFIDENCE_PERCENT),
            video_stride: file.video_stride.unwrap_or(DEFAULT_VIDEO_STRIDE),
            connect_timeout: file
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            max_consecutive_failures: file
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            class_resolution,
            model,
            smtp,
            mqtt,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(run_env) = std::env::var("RUN_ENV") {
            self.mode = OperatingMode::from_run_env(&run_env);
        }
        if let Ok(path) = std::env::var("DETECTOR_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(sources) = std::env::var("DETECTOR_SOURCES") {
            self.sources = parse_sources(&sources);
        }
        if let Ok(confidence) = std::env::var("DETECTOR_CONFIDENCE") {
            self.confidence_percent = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECTOR_CONFIDENCE must be an integer percent"))?;
        }
        if let Ok(host) = std::env::var("SMTP_HOST") {
            if !host.trim().is_empty() {
                let smtp = self.smtp.get_or_insert_with(|| SmtpSettings {
                    host: String::new(),
                    port: DEFAULT_SMTP_PORT,
                    from: String::new(),
                });
                smtp.host = host;
            }
        }
        if let Some(smtp) = self.smtp.as_mut() {
            if let Ok(port) = std::env::var("SMTP_PORT") {
                smtp.port = port
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("SMTP_PORT must be a port number"))?;
            }
            if let Ok(from) = std::env::var("EMAIL_ADDR") {
                if !from.trim().is_empty() {
                    smtp.from = from;
                }
            }
        }
        if let Ok(broker) = std::env::var("MQTT_BROKER_ADDR") {
            if !broker.trim().is_empty() {
                let mqtt = self.mqtt.get_or_insert_with(|| MqttSettings {
                    broker: String::new(),
                    topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                });
                mqtt.broker = broker;
            }
        }
        if let Some(mqtt) = self.mqtt.as_mut() {
            if let Ok(prefix) = std::env::var("MQTT_TOPIC_PREFIX") {
                if !prefix.trim().is_empty() {
                    mqtt.topic_prefix = prefix;
                }
            }
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect timeout must be greater than zero"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be greater than zero"));
        }
        if self.model.blob.width == 0 || self.model.blob.height == 0 {
            return Err(anyhow!("model input size must be non-zero"));
        }
        if let Some(smtp) = &self.smtp {
            if smtp.from.trim().is_empty() {
                return Err(anyhow!("SMTP delivery requires a sender (EMAIL_ADDR)"));
            }
        }
        self.sources.retain(|source| !source.trim().is_empty());
        Ok(())
    }

    /// Threshold in (0, 1]; out-of-range percents fall back to 0.75.
    pub fn confidence_threshold(&self) -> f32 {
        PipelineConfig::threshold_from_percent(self.confidence_percent)
    }

    pub fn reads_sources_from_catalog(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            model_path: self.model.path.clone(),
            target: self.model.target,
            blob: self.model.blob.clone(),
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            video_stride: self.video_stride,
            connect_timeout: self.connect_timeout,
        }
    }

    pub fn pipeline_config(&self, labels: ClassLabels) -> PipelineConfig {
        PipelineConfig {
            confidence_threshold: self.confidence_threshold(),
            labels,
            blob: self.model.blob.clone(),
            max_consecutive_failures: self.max_consecutive_failures,
            class_resolution: self.class_resolution,
            ..PipelineConfig::default()
        }
    }

    /// One `key - value` line per effective setting.
    pub fn log_settings(&self) {
        log::info!("run mode - {}", self.mode);
        log::info!("database - {}", self.db_path);
        if self.sources.is_empty() {
            log::info!("sources - (from catalog)");
        } else {
            log::info!("sources - {}", self.sources.join(","));
        }
        log::info!("model - {}", self.model.path.display());
        if let Some(labels) = &self.model.labels_path {
            log::info!("class labels - {}", labels.display());
        }
        log::info!(
            "backend - {}",
            self.model.backend.as_deref().unwrap_or("(default)")
        );
        log::info!("target - {}", self.model.target);
        log::info!(
            "confidence threshold - {:.2}",
            self.confidence_threshold()
        );
        log::info!("video stride - {}", self.video_stride);
        log::info!("connect timeout - {:?}", self.connect_timeout);
        log::info!("class resolution - {}", self.class_resolution);
        match &self.smtp {
            Some(smtp) => log::info!("smtp - {}:{} as {}", smtp.host, smtp.port, smtp.from),
            None => log::info!("smtp - disabled"),
        }
        match &self.mqtt {
            Some(mqtt) => log::info!("mqtt - {} ({}/alerts)", mqtt.broker, mqtt.topic_prefix),
            None => log::info!("mqtt - disabled"),
        }
    }
}

/// Comma-separated source list. `--` (or nothing) means "from the catalog".
pub fn parse_sources(value: &str) -> Vec<String> {
    if value.trim() == SOURCES_FROM_CATALOG {
        return Vec::new();
    }
    split_csv(value)
}

fn read_config_file(path: &Path) -> Result<AgentConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
