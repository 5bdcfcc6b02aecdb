//! Process configuration: command line / environment knobs and the optional
//! project bootstrap file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::application::{backoff::RetryPolicy, config::PipelineConfig};
use crate::domain::{action::ActionConfig, camera::Camera, inspection::ProjectContext, model::Model};

/// facvision - machine-vision inspection server
#[derive(Parser, Debug, Clone)]
#[command(name = "facvision")]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    /// Address the dashboard API listens on
    #[arg(long, env = "FACVISION_BIND", default_value = "0.0.0.0:8090")]
    pub bind: SocketAddr,

    /// Directory with the dashboard's static files
    #[arg(long, env = "FACVISION_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// JSON file with the project, cameras, models and actions to load at startup
    #[arg(long, env = "FACVISION_PROJECT")]
    pub project_file: Option<PathBuf>,

    /// Project id used when no project file is given
    #[arg(long, env = "FACVISION_PROJECT_ID", default_value = "default")]
    pub project_id: String,

    /// Directory holding the .onnx model artifacts
    #[arg(long, env = "FACVISION_MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    /// ffmpeg binary used to read RTSP cameras
    #[arg(long, env = "FACVISION_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Camera pipelines allowed to run inference concurrently
    #[arg(long, env = "FACVISION_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Per-frame inference deadline in milliseconds
    #[arg(long, env = "FACVISION_INFERENCE_DEADLINE_MS", default_value_t = 500)]
    pub inference_deadline_ms: u64,

    /// Camera silence (ms) before the connection is declared lost
    #[arg(long, env = "FACVISION_SILENCE_TIMEOUT_MS", default_value_t = 5000)]
    pub silence_timeout_ms: u64,

    /// Connect timeout for cameras and sinks in milliseconds
    #[arg(long, env = "FACVISION_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "FACVISION_RECONNECT_BASE_MS", default_value_t = 500)]
    pub reconnect_base_ms: u64,

    #[arg(long, env = "FACVISION_RECONNECT_CAP_MS", default_value_t = 30_000)]
    pub reconnect_cap_ms: u64,

    /// How long a trigger waits for a fresh frame in milliseconds
    #[arg(long, env = "FACVISION_FRAME_WAIT_MS", default_value_t = 2000)]
    pub frame_wait_ms: u64,

    /// Queue snapshot triggers that arrive during inference instead of coalescing them
    #[arg(long, env = "FACVISION_QUEUE_SNAPSHOTS")]
    pub queue_snapshots: bool,

    #[arg(long, env = "FACVISION_SNAPSHOT_QUEUE", default_value_t = 8)]
    pub snapshot_queue: usize,

    /// Results buffered per dashboard client, rounded up to a power of two
    #[arg(long, env = "FACVISION_LIVE_BUFFER", default_value_t = 64)]
    pub live_buffer: usize,

    /// Delivery attempts per result and sink
    #[arg(long, env = "FACVISION_SINK_ATTEMPTS", default_value_t = 4)]
    pub sink_attempts: u32,

    #[arg(long, env = "FACVISION_SINK_BACKOFF_MS", default_value_t = 200)]
    pub sink_backoff_ms: u64,

    #[arg(long, env = "FACVISION_SINK_BACKOFF_CAP_MS", default_value_t = 5000)]
    pub sink_backoff_cap_ms: u64,

    /// Results queued per sink before new ones are refused
    #[arg(long, env = "FACVISION_SINK_QUEUE", default_value_t = 256)]
    pub sink_queue: usize,

    /// SQLite file for the database action
    #[arg(long, env = "FACVISION_DATABASE", default_value = "facvision.db")]
    pub database: PathBuf,

    /// Where saved inspection images are written
    #[arg(long, env = "FACVISION_IMAGE_DIR", default_value = "images")]
    pub image_dir: PathBuf,
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl AppConfig {
    pub fn connect_timeout(&self) -> Duration {
        ms(self.connect_timeout_ms)
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            worker_limit: self.workers.max(1),
            inference_deadline: ms(self.inference_deadline_ms),
            silence_timeout: ms(self.silence_timeout_ms),
            connect_timeout: self.connect_timeout(),
            reconnect_base: ms(self.reconnect_base_ms),
            reconnect_cap: ms(self.reconnect_cap_ms),
            frame_wait: ms(self.frame_wait_ms),
            queued_snapshots: self.queue_snapshots,
            snapshot_queue_limit: self.snapshot_queue,
            live_buffer: self.live_buffer.max(1),
            sink_retry: RetryPolicy {
                max_attempts: self.sink_attempts.max(1),
                base_delay: ms(self.sink_backoff_ms),
                max_delay: ms(self.sink_backoff_cap_ms),
                attempt_timeout: self.connect_timeout(),
            },
            sink_queue: self.sink_queue.max(1),
        }
    }
}

/// Cameras, models and actions loaded at startup. Every entry goes through
/// the same validation as the HTTP API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    pub project: ProjectContext,
    #[serde(default)]
    pub cameras: Vec<Camera>,
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub actions: Option<ActionConfig>,
}

impl ProjectFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}
