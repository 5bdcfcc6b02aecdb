//! Connection supervisor for one camera.
//!
//! Keeps a single connection alive, stamps every decoded frame with the
//! camera id and a per-session sequence number, and publishes it into a
//! latest-value slot. Nothing queues here: a consumer that is busy simply
//! finds a newer frame when it looks again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::backoff::Backoff;
use crate::application::live::LiveChannel;
use crate::application::ports::{FrameSourcePort, FrameStream};
use crate::application::session::SessionToken;
use crate::domain::{
    camera::{Camera, CameraStatus},
    errors::{ConnectionError, ConnectionFailure},
    frame::Frame,
};

#[derive(Debug, Clone)]
pub struct CaptureTimings {
    pub connect_timeout: Duration,
    pub silence_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

pub struct CaptureSupervisor {
    camera: Camera,
    source: Arc<dyn FrameSourcePort>,
    live: Arc<LiveChannel>,
    timings: CaptureTimings,
    frames: watch::Sender<Option<Frame>>,
    token: SessionToken,
    sequence: u64,
}

impl CaptureSupervisor {
    pub fn new(
        camera: Camera,
        source: Arc<dyn FrameSourcePort>,
        live: Arc<LiveChannel>,
        timings: CaptureTimings,
        frames: watch::Sender<Option<Frame>>,
        token: SessionToken,
    ) -> Self {
        Self { camera, source, live, timings, frames, token, sequence: 0 }
    }

    /// Runs until the protocol is reported unsupported or every frame
    /// receiver is gone. Any other failure leads to a backoff and reconnect.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.timings.reconnect_base, self.timings.reconnect_cap);

        loop {
            if self.frames.is_closed() {
                debug!(camera = %self.camera.id, "no frame consumers left, capture stops");
                return;
            }
            self.set_status(CameraStatus::Connecting, None);

            let connected =
                tokio::time::timeout(self.timings.connect_timeout, self.source.connect(&self.camera)).await;
            let err = match connected {
                Ok(Ok(stream)) => {
                    info!(camera = %self.camera.id, "camera connected");
                    self.set_status(CameraStatus::Connected, None);
                    self.pump(stream, &mut backoff).await
                }
                Ok(Err(err)) => err,
                Err(_) => ConnectionError::new(ConnectionFailure::Timeout, "connect timed out"),
            };

            if self.frames.is_closed() {
                return;
            }
            self.set_status(CameraStatus::Error, Some(err.to_string()));
            if err.reason == ConnectionFailure::Unsupported {
                warn!(camera = %self.camera.id, "camera cannot be opened: {err}");
                return;
            }

            let delay = backoff.next_delay();
            warn!(
                camera = %self.camera.id,
                attempt = backoff.attempts(),
                "camera connection lost ({err}), retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Reads frames until the stream fails or goes silent.
    async fn pump(&mut self, mut stream: Box<dyn FrameStream>, backoff: &mut Backoff) -> ConnectionError {
        loop {
            match tokio::time::timeout(self.timings.silence_timeout, stream.next_frame()).await {
                Ok(Ok(mut frame)) => {
                    backoff.reset();
                    self.sequence += 1;
                    frame.sequence = self.sequence;
                    frame.camera_id = self.camera.id.clone();
                    if self.frames.send(Some(frame)).is_err() {
                        return ConnectionError::new(ConnectionFailure::Unreachable, "capture stopped");
                    }
                }
                Ok(Err(err)) => return err,
                Err(_) => {
                    return ConnectionError::new(
                        ConnectionFailure::Timeout,
                        format!("no frame for {:?}", self.timings.silence_timeout),
                    )
                }
            }
        }
    }

    /// Only touches a camera that is still on the board, and only while the
    /// session is live, so a stop or removal is never undone.
    fn set_status(&self, status: CameraStatus, detail: Option<String>) {
        self.live.update_status(|board| {
            if !self.token.is_live() {
                return;
            }
            if let Some(report) = board.cameras.get_mut(&self.camera.id) {
                report.status = status;
                report.detail = detail;
            }
        });
    }
}
