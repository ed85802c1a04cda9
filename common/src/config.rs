use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_port")]
    pub port: u16,
    #[serde(default = "default_boundary")]
    pub boundary: String,
    /// Pacing delay between two parts on one viewer connection.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_port")]
    pub port: u16,
    /// Reject threshold commands with `low < 0` or `low > high`.
    #[serde(default = "default_true")]
    pub validate_thresholds: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// `synthetic` or `mjpeg`.
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_low")]
    pub low: i32,
    #[serde(default = "default_high")]
    pub high: i32,
    #[serde(default = "default_quality")]
    pub jpeg_quality: u8,
    /// Rotate the streamed image 90 degrees clockwise.
    #[serde(default = "default_true")]
    pub rotate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// Delay between render ticks; 0 renders as fast as possible.
    #[serde(default = "default_render_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_surface_width")]
    pub surface_width: u32,
    #[serde(default = "default_surface_height")]
    pub surface_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port: default_stream_port(),
            boundary: default_boundary(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_control_port(),
            validate_thresholds: true,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            url: String::new(),
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            low: default_low(),
            high: default_high(),
            jpeg_quality: default_quality(),
            rotate: true,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_render_interval_ms(),
            surface_width: default_surface_width(),
            surface_height: default_surface_height(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Upper bound on `capture.fps`; keeps the tick period at 1 ms or more.
pub const MAX_CAPTURE_FPS: f64 = 1000.0;

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if !config.capture.fps.is_finite()
            || config.capture.fps <= 0.0
            || config.capture.fps > MAX_CAPTURE_FPS
        {
            return Err(ConfigError::Invalid(format!(
                "capture.fps must be in (0, {MAX_CAPTURE_FPS}], got {}",
                config.capture.fps
            )));
        }
        if config.stream.boundary.is_empty() {
            return Err(ConfigError::Invalid("stream.boundary must not be empty".into()));
        }
        if !matches!(config.capture.source.as_str(), "synthetic" | "mjpeg") {
            return Err(ConfigError::Invalid(format!(
                "capture.source must be 'synthetic' or 'mjpeg', got '{}'",
                config.capture.source
            )));
        }
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_stream_port() -> u16 {
    8080
}
fn default_boundary() -> String {
    "mjpegstream".into()
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_control_port() -> u16 {
    8081
}
fn default_true() -> bool {
    true
}
fn default_source() -> String {
    "synthetic".into()
}
fn default_fps() -> f64 {
    30.0
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_low() -> i32 {
    50
}
fn default_high() -> i32 {
    150
}
fn default_quality() -> u8 {
    80
}
fn default_render_interval_ms() -> u64 {
    16
}
fn default_surface_width() -> u32 {
    1280
}
fn default_surface_height() -> u32 {
    720
}
fn default_snapshot_dir() -> String {
    "snapshots".into()
}
fn default_log_level() -> String {
    "info".into()
}
