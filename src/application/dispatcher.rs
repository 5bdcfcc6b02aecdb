//! Fire-and-forget fan-out of results to the configured sinks.
//!
//! Each enabled sink owns a bounded queue and a worker task. The worker
//! delivers strictly in arrival order and retries transient failures with
//! capped backoff before giving up on that one result and marking the sink
//! degraded. A sink that fails never slows the pipeline or another sink.
//!
//! Workers belong to the configuration that started them. Applying a new
//! configuration aborts them and discards whatever they still had queued;
//! a report from an older generation is ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::backoff::RetryPolicy;
use crate::application::live::LiveChannel;
use crate::application::ports::{ResultSink, SinkFactoryPort};
use crate::domain::{
    action::{ActionConfig, SinkKind},
    errors::{
        DomainError, DomainResult, ModbusFailure, MqttFailure, PersistenceFailure, SinkError,
    },
    inspection::{InspectionResult, ProjectContext},
    stream::{SinkReport, SinkState},
};

struct SinkWorker {
    kind: SinkKind,
    tx: mpsc::Sender<Arc<InspectionResult>>,
    handle: JoinHandle<()>,
}

struct DispatcherState {
    config: ActionConfig,
    workers: Vec<SinkWorker>,
}

pub struct ActionDispatcher {
    project: ProjectContext,
    factory: Arc<dyn SinkFactoryPort>,
    live: Arc<LiveChannel>,
    policy: RetryPolicy,
    queue_capacity: usize,
    generation: Arc<AtomicU64>,
    state: Mutex<DispatcherState>,
}

impl ActionDispatcher {
    pub fn new(
        project: ProjectContext,
        factory: Arc<dyn SinkFactoryPort>,
        live: Arc<LiveChannel>,
        policy: RetryPolicy,
        queue_capacity: usize,
    ) -> Self {
        live.update_status(|board| {
            for kind in SinkKind::ALL {
                board.sinks.entry(kind).or_default();
            }
        });
        Self {
            project,
            factory,
            live,
            policy,
            queue_capacity: queue_capacity.max(1),
            generation: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(DispatcherState { config: ActionConfig::default(), workers: Vec::new() }),
        }
    }

    /// Validates and installs a new configuration, replacing every worker.
    pub fn apply(&self, config: ActionConfig) -> DomainResult<()> {
        config.validate()?;

        let mut state = self.lock()?;
        let generation = self.retire(&mut state);
        let mut workers = Vec::new();
        for kind in SinkKind::ALL {
            if !config.is_enabled(kind) {
                self.set_report(kind, |r| {
                    r.state = SinkState::Disabled;
                    r.last_error = None;
                });
                continue;
            }
            match self.factory.build(kind, &config) {
                Ok(sink) => {
                    self.set_report(kind, |r| {
                        r.state = SinkState::Enabled;
                        r.last_error = None;
                    });
                    workers.push(self.spawn_worker(kind, sink, generation));
                }
                Err(err) => {
                    warn!(sink = %kind, "sink could not be created: {err}");
                    self.set_report(kind, |r| {
                        r.state = SinkState::Degraded;
                        r.last_error = Some(err.to_string());
                    });
                }
            }
        }

        state.config = config;
        state.workers = workers;
        info!(sinks = state.workers.len(), "action configuration applied");
        Ok(())
    }

    pub fn config(&self) -> ActionConfig {
        self.state.lock().map(|s| s.config.clone()).unwrap_or_default()
    }

    /// Queues `result` for every active sink without waiting on any of them.
    pub fn dispatch(&self, result: Arc<InspectionResult>) {
        let Ok(state) = self.state.lock() else {
            error!("dispatcher state poisoned; result {} not dispatched", result.id);
            return;
        };
        for worker in &state.workers {
            match worker.tx.try_send(result.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(sink = %worker.kind, result = %result.id, "sink queue full, result refused");
                    self.set_report(worker.kind, |r| {
                        r.state = SinkState::Degraded;
                        r.dropped += 1;
                        r.last_error = Some("queue full".into());
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(sink = %worker.kind, "sink worker stopped");
                }
            }
        }
    }

    /// One-off connection test using the current configuration.
    pub async fn probe(&self, kind: SinkKind) -> Result<(), SinkError> {
        let config = self.config();
        let sink = self.factory.build(kind, &config)?;
        match tokio::time::timeout(self.policy.attempt_timeout, sink.probe()).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(kind)),
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            self.retire(&mut state);
        }
    }

    /// Aborts the current workers and opens the next generation.
    fn retire(&self, state: &mut DispatcherState) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        for worker in state.workers.drain(..) {
            let queued = worker.tx.max_capacity() - worker.tx.capacity();
            if queued > 0 {
                info!(sink = %worker.kind, queued, "discarding results queued for the previous configuration");
            }
            worker.handle.abort();
        }
        generation
    }

    fn spawn_worker(&self, kind: SinkKind, sink: Arc<dyn ResultSink>, generation: u64) -> SinkWorker {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let reports = Reports { live: self.live.clone(), current: self.generation.clone(), generation };
        let handle = tokio::spawn(run_sink_worker(sink, rx, self.project.clone(), self.policy, reports));
        SinkWorker { kind, tx, handle }
    }

    fn set_report(&self, kind: SinkKind, f: impl FnOnce(&mut SinkReport)) {
        update_report(&self.live, kind, f);
    }

    fn lock(&self) -> DomainResult<std::sync::MutexGuard<'_, DispatcherState>> {
        self.state
            .lock()
            .map_err(|_| DomainError::OperationFailed("dispatcher state poisoned".into()))
    }
}

fn update_report(live: &LiveChannel, kind: SinkKind, f: impl FnOnce(&mut SinkReport)) {
    live.update_status(|board| f(board.sinks.entry(kind).or_default()));
}

/// Status writes from one worker, dropped once its generation is retired.
struct Reports {
    live: Arc<LiveChannel>,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl Reports {
    fn update(&self, kind: SinkKind, f: impl FnOnce(&mut SinkReport)) {
        // Checked inside the board update; apply bumps the generation before
        // writing its own reports.
        self.live.update_status(|board| {
            if self.current.load(Ordering::SeqCst) == self.generation {
                f(board.sinks.entry(kind).or_default());
            }
        });
    }
}

fn timed_out(kind: SinkKind) -> SinkError {
    match kind {
        SinkKind::Database => SinkError::persistence(PersistenceFailure::ConnectionLost, "timed out"),
        SinkKind::Modbus => SinkError::modbus(ModbusFailure::ConnectTimeout, "timed out"),
        SinkKind::Mqtt => SinkError::mqtt(MqttFailure::PublishTimeout, "timed out"),
    }
}

async fn run_sink_worker(
    sink: Arc<dyn ResultSink>,
    mut rx: mpsc::Receiver<Arc<InspectionResult>>,
    project: ProjectContext,
    policy: RetryPolicy,
    reports: Reports,
) {
    let kind = sink.kind();
    let mut degraded = false;

    while let Some(result) = rx.recv().await {
        let mut backoff = policy.backoff();
        let mut attempt = 1u32;
        loop {
            let outcome = match tokio::time::timeout(
                policy.attempt_timeout,
                sink.deliver(&project, &result),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(timed_out(kind)),
            };

            match outcome {
                Ok(()) => {
                    if degraded {
                        info!(sink = %kind, "sink recovered");
                        degraded = false;
                    }
                    reports.update(kind, |r| {
                        r.state = SinkState::Enabled;
                        r.delivered += 1;
                        r.last_error = None;
                    });
                    break;
                }
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        sink = %kind,
                        result = %result.id,
                        attempt,
                        "delivery failed, retrying in {:?}: {}",
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(sink = %kind, result = %result.id, attempt, "delivery abandoned: {err}");
                    degraded = true;
                    reports.update(kind, |r| {
                        r.state = SinkState::Degraded;
                        r.dropped += 1;
                        r.last_error = Some(err.to_string());
                    });
                    break;
                }
            }
        }
    }
}
