use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("roi_fraction must be in (0, 1], got {0}")]
    RoiFraction(f32),
    #[error("occupancy_threshold must be in (0, 1), got {0}")]
    OccupancyThreshold(f32),
    #[error("diff_threshold must be positive, got {0}")]
    DiffThreshold(f32),
    #[error("learning_frames must be at least 1")]
    LearningFrames,
    #[error("background_decay must be in (0, 1), got {0}")]
    BackgroundDecay(f32),
    #[error("debounce_k must be at least 1")]
    DebounceK,
    #[error("bay id must be positive")]
    BayId,
    #[error("duplicate bay id {0}")]
    DuplicateBayId(u32),
    #[error("{0} must be positive")]
    NonPositiveDuration(&'static str),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub capture: CaptureConfig,
    pub reconnect: ReconnectConfig,
    pub detection: DetectionConfig,
    pub status: StatusConfig,
    pub bays: Vec<BayConfig>,
}

impl Config {
    /// Cross-bay checks; per-bay tunables are validated again when each
    /// monitor is constructed, so one bad bay refuses to start without
    /// taking the others down.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.capture.validate()?;
        self.reconnect.validate()?;
        let mut seen = std::collections::HashSet::new();
        for bay in &self.bays {
            if bay.id == 0 {
                return Err(ValidationError::BayId);
            }
            if !seen.insert(bay.id) {
                return Err(ValidationError::DuplicateBayId(bay.id));
            }
        }
        Ok(())
    }
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_frame_timeout_ms() -> u64 {
    5000
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::NonPositiveDuration("poll_interval_ms"));
        }
        if self.frame_timeout_ms == 0 {
            return Err(ValidationError::NonPositiveDuration("frame_timeout_ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.initial_delay_ms == 0 {
            return Err(ValidationError::NonPositiveDuration("initial_delay_ms"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ValidationError::NonPositiveDuration("max_delay_ms"));
        }
        Ok(())
    }
}

/// Detection tunables. The numeric defaults are operational starting
/// points, not derived constants.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_roi_fraction")]
    pub roi_fraction: f32,
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: f32,
    #[serde(default = "default_occupancy_threshold")]
    pub occupancy_threshold: f32,
    #[serde(default = "default_learning_frames")]
    pub learning_frames: u32,
    #[serde(default = "default_probe_after")]
    pub probe_after: u32,
    #[serde(default = "default_background_decay")]
    pub background_decay: f32,
}

fn default_roi_fraction() -> f32 {
    0.4
}

fn default_diff_threshold() -> f32 {
    25.0
}

fn default_occupancy_threshold() -> f32 {
    0.4
}

fn default_learning_frames() -> u32 {
    100
}

fn default_probe_after() -> u32 {
    10
}

fn default_background_decay() -> f32 {
    0.05
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            roi_fraction: default_roi_fraction(),
            diff_threshold: default_diff_threshold(),
            occupancy_threshold: default_occupancy_threshold(),
            learning_frames: default_learning_frames(),
            probe_after: default_probe_after(),
            background_decay: default_background_decay(),
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.roi_fraction > 0.0 && self.roi_fraction <= 1.0) {
            return Err(ValidationError::RoiFraction(self.roi_fraction));
        }
        if !(self.occupancy_threshold > 0.0 && self.occupancy_threshold < 1.0) {
            return Err(ValidationError::OccupancyThreshold(self.occupancy_threshold));
        }
        if !(self.diff_threshold > 0.0) {
            return Err(ValidationError::DiffThreshold(self.diff_threshold));
        }
        if self.learning_frames == 0 {
            return Err(ValidationError::LearningFrames);
        }
        if !(self.background_decay > 0.0 && self.background_decay < 1.0) {
            return Err(ValidationError::BackgroundDecay(self.background_decay));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    #[serde(default = "default_debounce_k")]
    pub debounce_k: u32,
}

fn default_debounce_k() -> u32 {
    3
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            debounce_k: default_debounce_k(),
        }
    }
}

impl StatusConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.debounce_k == 0 {
            return Err(ValidationError::DebounceK);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BayConfig {
    pub id: u32,
    pub address: String,
    /// Per-bay override; falls back to the global detection tunables.
    #[serde(default)]
    pub detection: Option<DetectionConfig>,
}

impl BayConfig {
    pub fn effective_detection(&self, global: &DetectionConfig) -> DetectionConfig {
        self.detection.clone().unwrap_or_else(|| global.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("BAYMON")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    config.try_deserialize::<Config>()
}
