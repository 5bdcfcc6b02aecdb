use std::time::Duration;

use super::backoff::RetryPolicy;

/// Timing and capacity knobs shared by every camera pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Camera pipelines allowed to run inference at the same time.
    pub worker_limit: usize,
    /// Per-frame budget for all models bound to a camera.
    pub inference_deadline: Duration,
    /// Silence after which a camera connection is considered dead.
    pub silence_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// How long a trigger waits for a frame captured after it fired.
    pub frame_wait: Duration,
    /// Queue snapshot triggers instead of coalescing them.
    pub queued_snapshots: bool,
    pub snapshot_queue_limit: usize,
    /// Results buffered per dashboard consumer before the oldest are dropped,
    /// rounded up to the next power of two.
    pub live_buffer: usize,
    pub sink_retry: RetryPolicy,
    pub sink_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            inference_deadline: Duration::from_millis(500),
            silence_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(30),
            frame_wait: Duration::from_secs(2),
            queued_snapshots: false,
            snapshot_queue_limit: 8,
            live_buffer: 64,
            sink_retry: RetryPolicy::default(),
            sink_queue: 256,
        }
    }
}

impl PipelineConfig {
    /// Triggers that may wait behind an in-flight inference.
    pub fn pending_trigger_limit(&self) -> usize {
        if self.queued_snapshots {
            self.snapshot_queue_limit.max(1)
        } else {
            1
        }
    }
}
