use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ConfigurationError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CameraId(pub String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids name image directories, so only `[A-Za-z0-9_-]` is accepted.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CameraProtocol {
    #[serde(rename = "RTSP")]
    Rtsp,
    #[serde(rename = "GigE")]
    GigE,
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "USB")]
    Usb,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    #[default]
    Auto,
    Snapshot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Software,
    Hardware,
    Timer,
    External,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSettings {
    pub resolution: FrameSize,
    pub frame_rate: u32,
    pub exposure: f32,
    pub gain: f32,
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            resolution: FrameSize { width: 1920, height: 1080 },
            frame_rate: 30,
            exposure: 10_000.0,
            gain: 0.0,
            brightness: 50,
            contrast: 50,
            saturation: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub id: CameraId,
    #[serde(default)]
    pub name: String,
    pub protocol: CameraProtocol,
    /// RTSP/HTTP URL, GigE address or USB device path.
    pub connection_string: String,
    #[serde(default)]
    pub mode: CameraMode,
    #[serde(default)]
    pub trigger_source: Option<TriggerSource>,
    /// Timer trigger period in milliseconds.
    #[serde(default)]
    pub trigger_interval: Option<u64>,
    /// Wait applied between frame acquisition and the forward decision.
    #[serde(default)]
    pub trigger_delay: Option<u64>,
    #[serde(default)]
    pub settings: CaptureSettings,
}

impl Camera {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.id.is_valid() {
            return Err(ConfigurationError::new(
                "id",
                "camera id must be 1-64 characters of letters, digits, '_' or '-'",
            ));
        }
        if self.connection_string.trim().is_empty() {
            return Err(ConfigurationError::new("connectionString", "must not be empty"));
        }
        validate_settings(&self.settings)?;
        if self.mode == CameraMode::Snapshot
            && self.trigger_source == Some(TriggerSource::Timer)
            && self.trigger_interval.unwrap_or(0) == 0
        {
            return Err(ConfigurationError::new(
                "triggerInterval",
                "timer trigger requires a positive interval",
            ));
        }
        Ok(())
    }

    /// Minimum spacing between forwarded frames in auto mode.
    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.settings.frame_rate.max(1)))
    }

    pub fn timer_interval(&self) -> Option<Duration> {
        match (self.mode, self.trigger_source) {
            (CameraMode::Snapshot, Some(TriggerSource::Timer)) => {
                self.trigger_interval.filter(|ms| *ms > 0).map(Duration::from_millis)
            }
            _ => None,
        }
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay.unwrap_or(0))
    }
}

pub fn validate_settings(settings: &CaptureSettings) -> Result<(), ConfigurationError> {
    if settings.resolution.width == 0 || settings.resolution.height == 0 {
        return Err(ConfigurationError::new("resolution", "width and height must be positive"));
    }
    if !(1..=1000).contains(&settings.frame_rate) {
        return Err(ConfigurationError::new("frameRate", "must be between 1 and 1000"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}
