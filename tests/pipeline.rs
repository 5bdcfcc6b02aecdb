//! End-to-end runs of the inspection pipeline against in-memory cameras,
//! engines and sinks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use tokio::time::{sleep, timeout, Instant};

use facvision::application::backoff::RetryPolicy;
use facvision::application::config::PipelineConfig;
use facvision::application::live::LiveSubscription;
use facvision::application::ports::{
    FrameSourcePort, FrameStream, InferenceEngine, ModelLoaderPort, ResultSink, SinkFactoryPort,
};
use facvision::application::services::InspectionService;
use facvision::domain::action::{ActionConfig, SinkKind};
use facvision::domain::camera::{
    Camera, CameraId, CameraMode, CameraProtocol, CameraStatus, CaptureSettings, FrameSize,
    TriggerSource,
};
use facvision::domain::detection::{BoundingBox, RawDetection};
use facvision::domain::errors::{
    ConnectionError, ConnectionFailure, InferenceError, ModbusFailure, SinkError,
};
use facvision::domain::frame::Frame;
use facvision::domain::inspection::{InspectionResult, ProjectContext, Verdict};
use facvision::domain::model::{Model, ModelClass, ModelId, ModelState, YoloParams};
use facvision::domain::stream::{LiveEvent, SinkState, StatusBoard};

// ---- camera ----

/// Frames every `period`. The first connection stalls after `stall_after`
/// frames; later connections only stall when `stall_always` is set.
struct TestCamera {
    period: Duration,
    stall_after: Option<u64>,
    stall_always: bool,
    connects: AtomicUsize,
}

impl TestCamera {
    fn steady(period: Duration) -> Self {
        Self { period, stall_after: None, stall_always: false, connects: AtomicUsize::new(0) }
    }

    fn stalling_once(period: Duration, stall_after: u64) -> Self {
        Self { period, stall_after: Some(stall_after), stall_always: false, connects: AtomicUsize::new(0) }
    }

    fn stalling_always(period: Duration, stall_after: u64) -> Self {
        Self { period, stall_after: Some(stall_after), stall_always: true, connects: AtomicUsize::new(0) }
    }
}

/// Routes each camera id to its own test camera.
struct CameraRack(HashMap<CameraId, TestCamera>);

#[async_trait]
impl FrameSourcePort for CameraRack {
    async fn connect(&self, camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
        match self.0.get(&camera.id) {
            Some(source) => source.connect(camera).await,
            None => Err(ConnectionError::new(
                ConnectionFailure::Unreachable,
                format!("no test camera {}", camera.id),
            )),
        }
    }
}

struct TestStream {
    period: Duration,
    remaining: Option<u64>,
}

#[async_trait]
impl FrameSourcePort for TestCamera {
    async fn connect(&self, _: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
        let first = self.connects.fetch_add(1, Ordering::SeqCst) == 0;
        let remaining = if first || self.stall_always { self.stall_after } else { None };
        Ok(Box::new(TestStream { period: self.period, remaining }))
    }
}

#[async_trait]
impl FrameStream for TestStream {
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                std::future::pending::<()>().await;
            }
            *remaining -= 1;
        }
        sleep(self.period).await;
        let image = RgbImage::from_pixel(64, 48, Rgb([90, 90, 90]));
        Ok(Frame::new(CameraId::new(""), image, None))
    }
}

// ---- model ----

struct FixedEngine {
    output: Vec<RawDetection>,
    work: Duration,
    calls: Arc<AtomicUsize>,
}

impl InferenceEngine for FixedEngine {
    fn infer(&self, _: &RgbImage, _: &YoloParams) -> Result<Vec<RawDetection>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.work);
        Ok(self.output.clone())
    }
}

struct FixedLoader {
    output: Vec<RawDetection>,
    work: Duration,
    calls: Arc<AtomicUsize>,
}

impl ModelLoaderPort for FixedLoader {
    fn load(&self, _: &Model) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
        Ok(Arc::new(FixedEngine {
            output: self.output.clone(),
            work: self.work,
            calls: self.calls.clone(),
        }))
    }
}

fn raw(class_id: u32, confidence: f32) -> RawDetection {
    RawDetection { class_id, confidence, bbox: BoundingBox::new(4.0, 4.0, 10.0, 10.0) }
}

// ---- sinks ----

#[derive(Default)]
struct Recorded {
    database: Mutex<Vec<u64>>,
    modbus_attempts: AtomicUsize,
}

struct RecordingSink {
    kind: SinkKind,
    recorded: Arc<Recorded>,
}

#[async_trait]
impl ResultSink for RecordingSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn deliver(&self, _: &ProjectContext, result: &InspectionResult) -> Result<(), SinkError> {
        match self.kind {
            SinkKind::Modbus => {
                self.recorded.modbus_attempts.fetch_add(1, Ordering::SeqCst);
                // A PLC that never answers.
                sleep(Duration::from_secs(60)).await;
                Err(SinkError::modbus(ModbusFailure::ConnectTimeout, "unreachable"))
            }
            _ => {
                self.recorded.database.lock().unwrap().push(result.sequence);
                Ok(())
            }
        }
    }

    async fn probe(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

struct RecordingSinks(Arc<Recorded>);

impl SinkFactoryPort for RecordingSinks {
    fn build(&self, kind: SinkKind, _: &ActionConfig) -> Result<Arc<dyn ResultSink>, SinkError> {
        Ok(Arc::new(RecordingSink { kind, recorded: self.0.clone() }))
    }
}

// ---- harness ----

struct Harness {
    service: InspectionService,
    recorded: Arc<Recorded>,
    inferences: Arc<AtomicUsize>,
    camera: CameraId,
    model: ModelId,
}

struct Setup {
    mode: CameraMode,
    source: Arc<dyn FrameSourcePort>,
    output: Vec<RawDetection>,
    work: Duration,
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        inference_deadline: Duration::from_secs(2),
        silence_timeout: Duration::from_millis(150),
        connect_timeout: Duration::from_secs(1),
        reconnect_base: Duration::from_millis(100),
        reconnect_cap: Duration::from_millis(200),
        frame_wait: Duration::from_secs(1),
        sink_retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            attempt_timeout: Duration::from_millis(100),
        },
        ..PipelineConfig::default()
    }
}

fn camera(mode: CameraMode) -> Camera {
    Camera {
        id: CameraId::new("cam-1"),
        name: "Line 1".into(),
        protocol: CameraProtocol::Http,
        connection_string: "http://camera.local/stream".into(),
        mode,
        trigger_source: None,
        trigger_interval: None,
        trigger_delay: None,
        settings: CaptureSettings {
            resolution: FrameSize { width: 64, height: 48 },
            frame_rate: 30,
            ..CaptureSettings::default()
        },
    }
}

fn model() -> Model {
    Model {
        id: ModelId::new("pcb-defects"),
        name: "PCB defects".into(),
        filename: "pcb.onnx".into(),
        file_size: 0,
        classes: vec![
            ModelClass { id: 0, name: "OK".into(), color: "#00ff00".into() },
            ModelClass { id: 1, name: "scratch".into(), color: "#ff0000".into() },
        ],
        confidence: 0.7,
        roi: None,
        params: YoloParams::default(),
    }
}

async fn harness(setup: Setup) -> Harness {
    let recorded = Arc::new(Recorded::default());
    let inferences = Arc::new(AtomicUsize::new(0));
    let service = InspectionService::new(
        ProjectContext { id: "pcb-line".into(), name: "PCB line".into() },
        pipeline_config(),
        setup.source,
        Arc::new(FixedLoader { output: setup.output, work: setup.work, calls: inferences.clone() }),
        Arc::new(RecordingSinks(recorded.clone())),
    );
    let camera = camera(setup.mode);
    let model = model();
    let (camera_id, model_id) = (camera.id.clone(), model.id.clone());
    service.register_camera(camera).unwrap();
    service.register_model(model).unwrap();

    wait_until(Duration::from_secs(2), || {
        service.list_models().iter().all(|m| m.status == ModelState::Ready)
    })
    .await;

    Harness { service, recorded, inferences, camera: camera_id, model: model_id }
}

/// Registers another camera like the harness one under `id`.
fn add_camera(h: &Harness, id: &str, mode: CameraMode) -> CameraId {
    let camera = Camera { id: CameraId::new(id), name: id.into(), ..camera(mode) };
    h.service.register_camera(camera).unwrap().id
}

fn rack(cameras: [(&str, TestCamera); 2]) -> Arc<dyn FrameSourcePort> {
    Arc::new(CameraRack(cameras.into_iter().map(|(id, cam)| (CameraId::new(id), cam)).collect()))
}

fn connected(board: &StatusBoard, id: &CameraId) -> bool {
    board.cameras.get(id).is_some_and(|c| c.status == CameraStatus::Connected)
}

async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached within {limit:?}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn next_result(sub: &mut LiveSubscription, limit: Duration) -> Arc<InspectionResult> {
    timeout(limit, async {
        loop {
            match sub.next().await {
                Some(LiveEvent::Result(result)) => return result,
                Some(_) => continue,
                None => panic!("live channel closed"),
            }
        }
    })
    .await
    .expect("no result in time")
}

async fn wait_for_status(sub: &mut LiveSubscription, limit: Duration, check: impl Fn(&StatusBoard) -> bool) {
    timeout(limit, async {
        loop {
            match sub.next().await {
                Some(LiveEvent::Status(board)) if check(&board) => return,
                Some(_) => continue,
                None => panic!("live channel closed"),
            }
        }
    })
    .await
    .expect("status not reached in time")
}

// ---- scenarios ----

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn defect_above_threshold_fails_and_reaches_database() {
    let h = harness(Setup {
        mode: CameraMode::Auto,
        source: Arc::new(TestCamera::steady(Duration::from_millis(20))),
        output: vec![raw(1, 0.95), raw(0, 0.5)],
        work: Duration::ZERO,
    })
    .await;
    h.service.apply_actions(ActionConfig::default()).unwrap();
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();

    let result = next_result(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(result.verdict, Verdict::Fail);
    assert_eq!(result.detections.len(), 1);
    assert_eq!(result.detections[0].class_id, 1);
    assert_eq!(result.detections[0].class_name, "scratch");
    assert!((result.detections[0].confidence - 0.95).abs() < f32::EPSILON);
    assert_eq!(result.project_id, "pcb-line");
    assert_eq!(result.camera_id, h.camera);

    wait_until(Duration::from_secs(2), || !h.recorded.database.lock().unwrap().is_empty()).await;
    let stored = h.recorded.database.lock().unwrap().clone();
    assert!(stored.windows(2).all(|w| w[0] < w[1]), "database order {stored:?}");
    h.service.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ok_class_only_passes() {
    let h = harness(Setup {
        mode: CameraMode::Snapshot,
        source: Arc::new(TestCamera::steady(Duration::from_millis(10))),
        output: vec![raw(0, 0.9)],
        work: Duration::ZERO,
    })
    .await;
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();
    wait_for_status(&mut sub, Duration::from_secs(2), |b| {
        b.cameras.get(&h.camera).is_some_and(|c| c.status == CameraStatus::Connected)
    })
    .await;

    h.service.trigger(&h.camera).unwrap();
    let result = next_result(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(result.verdict, Verdict::Pass);
    assert_eq!(result.detections.len(), 1);
    assert_eq!(result.detections[0].class_id, 0);
    assert_eq!(h.service.status().stats.pass_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn triggers_during_inference_coalesce_into_one_more_run() {
    let h = harness(Setup {
        mode: CameraMode::Snapshot,
        source: Arc::new(TestCamera::steady(Duration::from_millis(10))),
        output: vec![raw(1, 0.9)],
        work: Duration::from_millis(250),
    })
    .await;
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();
    wait_for_status(&mut sub, Duration::from_secs(2), |b| {
        b.cameras.get(&h.camera).is_some_and(|c| c.status == CameraStatus::Connected)
    })
    .await;

    for _ in 0..5 {
        h.service.trigger(&h.camera).unwrap();
    }
    let first = next_result(&mut sub, Duration::from_secs(2)).await;
    let second = next_result(&mut sub, Duration::from_secs(2)).await;
    assert!(second.sequence > first.sequence);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(h.inferences.load(Ordering::SeqCst), 2);
    assert_eq!(h.service.status().stats.total_inspections, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_session_ignores_triggers_until_resumed() {
    let h = harness(Setup {
        mode: CameraMode::Snapshot,
        source: Arc::new(TestCamera::steady(Duration::from_millis(10))),
        output: vec![],
        work: Duration::ZERO,
    })
    .await;
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();
    wait_for_status(&mut sub, Duration::from_secs(2), |b| {
        b.cameras.get(&h.camera).is_some_and(|c| c.status == CameraStatus::Connected)
    })
    .await;

    h.service.pause(&h.camera).unwrap();
    h.service.trigger(&h.camera).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.inferences.load(Ordering::SeqCst), 0);

    h.service.resume(&h.camera).unwrap();
    h.service.trigger(&h.camera).unwrap();
    let result = next_result(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(result.verdict, Verdict::Pass);
    assert!(result.detections.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_camera_is_flagged_and_reconnected() {
    let h = harness(Setup {
        mode: CameraMode::Auto,
        source: Arc::new(TestCamera::stalling_once(Duration::from_millis(10), 3)),
        output: vec![],
        work: Duration::ZERO,
    })
    .await;
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();

    wait_for_status(&mut sub, Duration::from_secs(2), |b| {
        b.cameras.get(&h.camera).is_some_and(|c| c.status == CameraStatus::Error)
    })
    .await;
    wait_for_status(&mut sub, Duration::from_secs(2), |b| {
        b.cameras.get(&h.camera).is_some_and(|c| c.status == CameraStatus::Connected)
    })
    .await;

    // Sequence numbers keep counting across the reconnect.
    let mut last = next_result(&mut sub, Duration::from_secs(2)).await.sequence;
    while last <= 3 {
        last = next_result(&mut sub, Duration::from_secs(2)).await.sequence;
    }
    assert!(last > 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_plc_does_not_hold_back_the_database() {
    let h = harness(Setup {
        mode: CameraMode::Auto,
        source: Arc::new(TestCamera::steady(Duration::from_millis(20))),
        output: vec![raw(1, 0.95)],
        work: Duration::ZERO,
    })
    .await;
    let mut actions = ActionConfig::default();
    actions.modbus.enabled = true;
    h.service.apply_actions(actions).unwrap();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();

    wait_until(Duration::from_secs(3), || h.recorded.database.lock().unwrap().len() >= 5).await;
    wait_until(Duration::from_secs(3), || {
        h.service.status().sinks[&SinkKind::Modbus].state == SinkState::Degraded
    })
    .await;

    let status = h.service.status();
    assert!(h.recorded.modbus_attempts.load(Ordering::SeqCst) >= 1);
    assert_eq!(status.sinks[&SinkKind::Database].state, SinkState::Enabled);
    assert!(status.sinks[&SinkKind::Modbus].last_error.is_some());
    h.service.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_camera_does_not_hold_back_another() {
    let h = harness(Setup {
        mode: CameraMode::Auto,
        source: rack([
            ("cam-1", TestCamera::stalling_always(Duration::from_millis(10), 2)),
            ("cam-2", TestCamera::steady(Duration::from_millis(20))),
        ]),
        output: vec![],
        work: Duration::ZERO,
    })
    .await;
    let other = add_camera(&h, "cam-2", CameraMode::Auto);
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();
    h.service.start(&other, vec![h.model.clone()]).unwrap();

    wait_for_status(&mut sub, Duration::from_secs(2), |b| {
        b.cameras.get(&h.camera).is_some_and(|c| c.status == CameraStatus::Error)
    })
    .await;

    // cam-1 keeps cycling through silence and reconnects meanwhile.
    let mut sequences = Vec::new();
    while sequences.len() < 5 {
        let result = next_result(&mut sub, Duration::from_secs(2)).await;
        if result.camera_id == other {
            sequences.push(result.sequence);
        }
    }
    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "cam-2 order {sequences:?}");
    h.service.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_discards_in_flight_inference_of_that_camera_only() {
    let h = harness(Setup {
        mode: CameraMode::Snapshot,
        source: rack([
            ("cam-1", TestCamera::steady(Duration::from_millis(10))),
            ("cam-2", TestCamera::steady(Duration::from_millis(10))),
        ]),
        output: vec![raw(1, 0.9)],
        work: Duration::from_millis(300),
    })
    .await;
    let other = add_camera(&h, "cam-2", CameraMode::Snapshot);
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();
    h.service.start(&other, vec![h.model.clone()]).unwrap();
    wait_for_status(&mut sub, Duration::from_secs(2), |b| connected(b, &h.camera) && connected(b, &other)).await;

    h.service.trigger(&h.camera).unwrap();
    wait_until(Duration::from_secs(2), || h.inferences.load(Ordering::SeqCst) >= 1).await;
    h.service.stop(&h.camera).unwrap();
    h.service.trigger(&other).unwrap();

    let result = next_result(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(result.camera_id, other);
    // Outlast the abandoned inference before looking for strays.
    sleep(Duration::from_millis(500)).await;
    let mut stray = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(20), sub.next()).await {
        if let LiveEvent::Result(result) = event {
            stray.push(result.camera_id.clone());
        }
    }
    assert!(!stray.contains(&h.camera), "results after stop: {stray:?}");
    assert_eq!(h.service.status().stats.total_inspections, 1);
    assert_eq!(h.service.status().cameras[&h.camera].status, CameraStatus::Disconnected);
    h.service.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_trigger_inspects_without_being_asked() {
    let h = harness(Setup {
        mode: CameraMode::Snapshot,
        source: Arc::new(TestCamera::steady(Duration::from_millis(10))),
        output: vec![],
        work: Duration::ZERO,
    })
    .await;
    let camera = Camera {
        trigger_source: Some(TriggerSource::Timer),
        trigger_interval: Some(100),
        ..camera(CameraMode::Snapshot)
    };
    h.service.update_camera(&h.camera, camera).unwrap();
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();

    let started = Instant::now();
    let mut last = 0;
    for _ in 0..3 {
        let result = next_result(&mut sub, Duration::from_secs(2)).await;
        assert!(result.sequence > last);
        last = result.sequence;
    }
    // Three ticks of a 100 ms timer.
    assert!(started.elapsed() >= Duration::from_millis(250));
    h.service.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trigger_delay_holds_back_the_captured_frame() {
    let h = harness(Setup {
        mode: CameraMode::Snapshot,
        source: Arc::new(TestCamera::steady(Duration::from_millis(10))),
        output: vec![],
        work: Duration::ZERO,
    })
    .await;
    let camera = Camera { trigger_delay: Some(200), ..camera(CameraMode::Snapshot) };
    h.service.update_camera(&h.camera, camera).unwrap();
    let mut sub = h.service.subscribe();
    h.service.start(&h.camera, vec![h.model.clone()]).unwrap();
    wait_for_status(&mut sub, Duration::from_secs(2), |b| connected(b, &h.camera)).await;

    let triggered = Instant::now();
    h.service.trigger(&h.camera).unwrap();
    let result = next_result(&mut sub, Duration::from_secs(2)).await;

    assert!(triggered.elapsed() >= Duration::from_millis(200));
    // Processing time starts at the forward decision, after the delay.
    assert!(result.processing_time_ms < 200.0, "{} ms", result.processing_time_ms);
    h.service.shutdown();
}
