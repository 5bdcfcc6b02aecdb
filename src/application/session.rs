//! A running inspection session: capture supervisor plus trigger loop for
//! one camera bound to a set of models.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::aggregator::aggregate;
use crate::application::capture::{CaptureSupervisor, CaptureTimings};
use crate::application::dispatcher::ActionDispatcher;
use crate::application::live::LiveChannel;
use crate::application::ports::FrameSourcePort;
use crate::application::scheduler::InferenceScheduler;
use crate::application::trigger::{TriggerController, TriggerDecision, TriggerPolicy};
use crate::domain::{
    camera::{Camera, CameraMode},
    frame::Frame,
    inspection::{InspectionResult, ProjectContext},
    model::ModelId,
    stream::{summarize_detections, SessionState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Trigger,
    Pause,
    Resume,
}

/// Every finished result goes to the dashboards and the sinks.
pub struct ResultHub {
    live: Arc<LiveChannel>,
    dispatcher: Arc<ActionDispatcher>,
}

impl ResultHub {
    pub fn new(live: Arc<LiveChannel>, dispatcher: Arc<ActionDispatcher>) -> Self {
        Self { live, dispatcher }
    }

    pub fn publish(&self, result: InspectionResult) {
        let result = Arc::new(result);
        self.live.publish_result(result.clone());
        self.dispatcher.dispatch(result);
    }
}

/// Cleared when a session is stopped. Aborting a task only takes effect at
/// its next await, so session tasks check this before writing shared state.
#[derive(Debug, Clone)]
pub struct SessionToken(Arc<AtomicBool>);

impl SessionToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SessionSettings {
    pub timings: CaptureTimings,
    pub frame_wait: Duration,
    pub pending_limit: usize,
}

/// Owns the session tasks; dropping it stops capture and inference.
pub struct SessionHandle {
    pub models: Vec<ModelId>,
    commands: mpsc::Sender<SessionCommand>,
    token: SessionToken,
    capture: JoinHandle<()>,
    pipeline: JoinHandle<()>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            // A full queue means triggers are already waiting; they coalesce anyway.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.pipeline.is_finished()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.token.revoke();
        self.capture.abort();
        self.pipeline.abort();
    }
}

#[derive(Clone)]
struct Inspector {
    project: ProjectContext,
    models: Arc<[ModelId]>,
    scheduler: Arc<InferenceScheduler>,
    hub: Arc<ResultHub>,
    token: SessionToken,
}

impl Inspector {
    async fn inspect(&self, frame: Frame, forwarded_at: Instant) {
        let outcomes = self.scheduler.run(&frame, &self.models).await;
        let result = aggregate(&self.project, &frame, &self.models, outcomes, forwarded_at);
        debug!(
            camera = %result.camera_id,
            sequence = result.sequence,
            verdict = result.verdict.as_str(),
            detections = %summarize_detections(&result.detections),
            "frame inspected in {:.1} ms",
            result.processing_time_ms
        );
        if !self.token.is_live() {
            debug!(camera = %result.camera_id, sequence = result.sequence, "session stopped, result discarded");
            return;
        }
        self.hub.publish(result);
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_session(
    project: ProjectContext,
    camera: Camera,
    models: Vec<ModelId>,
    source: Arc<dyn FrameSourcePort>,
    scheduler: Arc<InferenceScheduler>,
    hub: Arc<ResultHub>,
    live: Arc<LiveChannel>,
    settings: SessionSettings,
) -> SessionHandle {
    let (frames_tx, frames_rx) = watch::channel(None);
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let token = SessionToken::new();

    let supervisor = CaptureSupervisor::new(
        camera.clone(),
        source,
        live.clone(),
        settings.timings,
        frames_tx,
        token.clone(),
    );
    let capture = tokio::spawn(supervisor.run());

    let pipeline = CameraPipeline {
        controller: TriggerController::new(TriggerPolicy::for_camera(&camera, settings.pending_limit)),
        camera,
        inspector: Inspector {
            project,
            models: models.clone().into(),
            scheduler,
            hub,
            token: token.clone(),
        },
        live,
        frames: frames_rx,
        commands: commands_rx,
        frame_wait: settings.frame_wait,
        paused: false,
        in_flight: JoinSet::new(),
    };
    let pipeline = tokio::spawn(pipeline.run());

    SessionHandle { models, commands: commands_tx, token, capture, pipeline }
}

struct CameraPipeline {
    camera: Camera,
    controller: TriggerController,
    inspector: Inspector,
    live: Arc<LiveChannel>,
    frames: watch::Receiver<Option<Frame>>,
    commands: mpsc::Receiver<SessionCommand>,
    frame_wait: Duration,
    paused: bool,
    in_flight: JoinSet<()>,
}

impl CameraPipeline {
    async fn run(mut self) {
        info!(camera = %self.camera.id, models = self.inspector.models.len(), "session started");
        self.set_session(SessionState::Running);

        let mut timer = self.camera.timer_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let auto = self.camera.mode == CameraMode::Auto;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(_) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if self.controller.complete() && !self.paused {
                        self.fire_snapshot();
                    }
                },
                changed = self.frames.changed(), if auto && !self.paused => {
                    if changed.is_err() {
                        break;
                    }
                    self.on_frame();
                },
                _ = tick(&mut timer), if !self.paused => self.on_trigger(),
            }
        }
        debug!(camera = %self.camera.id, "session loop ended");
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Trigger if self.paused => {
                debug!(camera = %self.camera.id, "trigger ignored while paused");
            }
            SessionCommand::Trigger => self.on_trigger(),
            SessionCommand::Pause => {
                self.paused = true;
                self.controller.clear_pending();
                self.set_session(SessionState::Paused);
                info!(camera = %self.camera.id, "session paused");
            }
            SessionCommand::Resume => {
                self.paused = false;
                // Frames seen while paused are stale.
                self.frames.borrow_and_update();
                self.set_session(SessionState::Running);
                info!(camera = %self.camera.id, "session resumed");
            }
        }
    }

    fn on_trigger(&mut self) {
        match self.controller.on_trigger() {
            TriggerDecision::Fire => self.fire_snapshot(),
            TriggerDecision::Pending => debug!(camera = %self.camera.id, "trigger queued behind inference"),
            TriggerDecision::Coalesced => debug!(camera = %self.camera.id, "trigger coalesced"),
            TriggerDecision::Ignored => debug!(camera = %self.camera.id, "trigger ignored in auto mode"),
        }
    }

    fn on_frame(&mut self) {
        let now = Instant::now();
        let frame = self.frames.borrow_and_update().clone();
        let Some(frame) = frame else { return };
        if !self.controller.accept_frame(now) {
            return;
        }
        self.controller.begin(now);
        let inspector = self.inspector.clone();
        self.in_flight.spawn(async move { inspector.inspect(frame, now).await });
    }

    fn fire_snapshot(&mut self) {
        self.controller.begin(Instant::now());
        let inspector = self.inspector.clone();
        let mut frames = self.frames.clone();
        let delay = self.controller.policy().delay;
        let wait = self.frame_wait;
        let camera = self.camera.id.clone();
        self.in_flight.spawn(async move {
            let Some(frame) = next_fresh_frame(&mut frames, wait).await else {
                warn!(camera = %camera, "no frame captured within {:?} of trigger", wait);
                return;
            };
            // The delay holds back the forward decision, not the capture.
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inspector.inspect(frame, Instant::now()).await;
        });
    }

    fn set_session(&self, state: SessionState) {
        let token = &self.inspector.token;
        self.live.update_status(|board| {
            if let Some(report) = board.cameras.get_mut(&self.camera.id).filter(|_| token.is_live()) {
                report.session = state;
            }
        });
    }
}

/// First frame published after the call.
async fn next_fresh_frame(
    frames: &mut watch::Receiver<Option<Frame>>,
    wait: Duration,
) -> Option<Frame> {
    frames.borrow_and_update();
    let deadline = Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, frames.changed()).await {
            Ok(Ok(())) => {
                if let Some(frame) = frames.borrow_and_update().clone() {
                    return Some(frame);
                }
            }
            _ => return None,
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

