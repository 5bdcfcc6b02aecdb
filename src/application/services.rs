use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::application::{
    capture::CaptureTimings,
    config::PipelineConfig,
    dispatcher::ActionDispatcher,
    live::{LiveChannel, LiveSubscription},
    ports::{FrameSourcePort, ModelLoaderPort, SinkFactoryPort},
    registry::{ModelRegistry, ModelView},
    scheduler::{InferenceScheduler, ModelOutcome},
    session::{spawn_session, ResultHub, SessionCommand, SessionHandle, SessionSettings},
};
use crate::domain::{
    action::{ActionConfig, SinkKind},
    camera::{Camera, CameraId, CameraStatus, FrameSize},
    errors::{ConfigurationError, DomainError, DomainResult, SinkError},
    frame::Frame,
    inspection::ProjectContext,
    model::{Model, ModelId, ModelState, ModelUpdate},
    stream::{CameraReport, SessionState, StatusBoard},
};

struct CameraEntry {
    camera: Camera,
    session: Option<SessionHandle>,
}

/// Use cases of one inspection project: camera and model inventory,
/// session control, action configuration and the live feed.
pub struct InspectionService {
    project: ProjectContext,
    config: PipelineConfig,
    source: Arc<dyn FrameSourcePort>,
    loader: Arc<dyn ModelLoaderPort>,
    registry: Arc<ModelRegistry>,
    scheduler: Arc<InferenceScheduler>,
    dispatcher: Arc<ActionDispatcher>,
    hub: Arc<ResultHub>,
    live: Arc<LiveChannel>,
    cameras: Mutex<HashMap<CameraId, CameraEntry>>,
}

impl InspectionService {
    pub fn new(
        project: ProjectContext,
        config: PipelineConfig,
        source: Arc<dyn FrameSourcePort>,
        loader: Arc<dyn ModelLoaderPort>,
        sinks: Arc<dyn SinkFactoryPort>,
    ) -> Self {
        let live = Arc::new(LiveChannel::new(&project.id, config.live_buffer));
        let registry = Arc::new(ModelRegistry::new());
        let scheduler = Arc::new(InferenceScheduler::new(
            registry.clone(),
            config.inference_deadline,
            config.worker_limit,
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            project.clone(),
            sinks,
            live.clone(),
            config.sink_retry,
            config.sink_queue,
        ));
        let hub = Arc::new(ResultHub::new(live.clone(), dispatcher.clone()));
        Self {
            project,
            config,
            source,
            loader,
            registry,
            scheduler,
            dispatcher,
            hub,
            live,
            cameras: Mutex::new(HashMap::new()),
        }
    }

    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    // ---- cameras ----

    pub fn register_camera(&self, camera: Camera) -> DomainResult<Camera> {
        camera.validate()?;
        let mut cameras = self.lock_cameras()?;
        if cameras.contains_key(&camera.id) {
            return Err(ConfigurationError::new("id", format!("camera {} already exists", camera.id)).into());
        }
        info!(camera = %camera.id, protocol = ?camera.protocol, "camera registered");
        cameras.insert(camera.id.clone(), CameraEntry { camera: camera.clone(), session: None });
        let id = camera.id.clone();
        self.live.update_status(|board| {
            board.cameras.insert(id, CameraReport::default());
        });
        Ok(camera)
    }

    pub fn list_cameras(&self) -> DomainResult<Vec<Camera>> {
        let cameras = self.lock_cameras()?;
        let mut list: Vec<_> = cameras.values().map(|e| e.camera.clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    /// Replaces a camera's configuration. A running session is restarted with
    /// the new settings; a resolution that would cut off a bound model's ROI
    /// is refused.
    pub fn update_camera(&self, id: &CameraId, mut camera: Camera) -> DomainResult<Camera> {
        camera.id = id.clone();
        camera.validate()?;
        let mut cameras = self.lock_cameras()?;
        let entry = cameras
            .get_mut(id)
            .ok_or_else(|| DomainError::NotFound(format!("camera {id}")))?;

        if let Some(session) = &entry.session {
            let models = session.models.clone();
            self.check_rois(&models, camera.settings.resolution)?;
            entry.session = None;
            entry.camera = camera.clone();
            entry.session = Some(self.spawn(&camera, models));
            info!(camera = %id, "camera updated, session restarted");
        } else {
            entry.camera = camera.clone();
            info!(camera = %id, "camera updated");
        }
        Ok(camera)
    }

    pub fn remove_camera(&self, id: &CameraId) -> DomainResult<()> {
        let Some(removed) = self.lock_cameras()?.remove(id) else {
            return Err(DomainError::NotFound(format!("camera {id}")));
        };
        drop(removed);
        let id = id.clone();
        self.live.update_status(|board| {
            board.cameras.remove(&id);
        });
        info!(camera = %id, "camera removed");
        Ok(())
    }

    // ---- models ----

    /// Registers a model and loads its artifact in the background. The model
    /// reports `loading` until the load finishes.
    pub fn register_model(&self, model: Model) -> DomainResult<ModelView> {
        model.validate()?;
        self.registry.insert_loading(model.clone())?;
        info!(model = %model.id, file = %model.filename, "model registered, loading");

        let registry = self.registry.clone();
        let loader = self.loader.clone();
        let view = ModelView {
            model: model.clone(),
            status: ModelState::Loading,
            detail: None,
        };
        tokio::spawn(async move {
            let id = model.id.clone();
            match tokio::task::spawn_blocking(move || loader.load(&model)).await {
                Ok(Ok(engine)) => {
                    info!(model = %id, "model ready");
                    registry.set_ready(&id, engine);
                }
                Ok(Err(err)) => {
                    warn!(model = %id, "model failed to load: {err}");
                    registry.set_failed(&id, err.to_string());
                }
                Err(err) => {
                    warn!(model = %id, "model load task failed: {err}");
                    registry.set_failed(&id, err.to_string());
                }
            }
        });
        Ok(view)
    }

    pub fn list_models(&self) -> Vec<ModelView> {
        self.registry.list()
    }

    /// Confidence, ROI and class edits take effect from the next scheduled
    /// frame; inferences already running keep their snapshot.
    pub fn update_model(&self, id: &ModelId, update: ModelUpdate) -> DomainResult<Model> {
        if let Some(roi) = update.roi.filter(|_| !update.clear_roi) {
            let cameras = self.lock_cameras()?;
            for entry in cameras.values() {
                let bound = entry.session.as_ref().is_some_and(|s| s.models.contains(id));
                if bound && !roi.fits_within(entry.camera.settings.resolution) {
                    return Err(ConfigurationError::new(
                        "roi",
                        format!("exceeds resolution of running camera {}", entry.camera.id),
                    )
                    .into());
                }
            }
        }
        let model = self.registry.update(id, &update)?;
        info!(model = %id, confidence = model.confidence, roi = ?model.roi, "model updated");
        Ok(model)
    }

    /// Runs one uploaded JPEG through a model with its current confidence
    /// threshold and ROI, outside any camera session.
    pub async fn test_model(&self, id: &ModelId, jpeg: Vec<u8>) -> DomainResult<ModelOutcome> {
        if self.registry.get(id).is_none() {
            return Err(DomainError::NotFound(format!("model {id}")));
        }
        let frame = tokio::task::spawn_blocking(move || Frame::from_jpeg(CameraId::new("model-test"), jpeg))
            .await
            .map_err(|e| DomainError::OperationFailed(e.to_string()))?
            .map_err(|e| ConfigurationError::new("image", format!("not a readable JPEG: {e}")))?;
        let outcome = self
            .scheduler
            .run(&frame, std::slice::from_ref(id))
            .await
            .pop()
            .ok_or_else(|| DomainError::OperationFailed(format!("model {id} produced no outcome")))?;
        info!(model = %id, "model test finished");
        Ok(outcome)
    }

    pub fn remove_model(&self, id: &ModelId) -> DomainResult<()> {
        {
            let cameras = self.lock_cameras()?;
            if let Some(entry) = cameras
                .values()
                .find(|e| e.session.as_ref().is_some_and(|s| s.models.contains(id)))
            {
                return Err(ConfigurationError::new(
                    "model",
                    format!("model {id} is in use by camera {}", entry.camera.id),
                )
                .into());
            }
        }
        self.registry.remove(id)?;
        info!(model = %id, "model removed");
        Ok(())
    }

    // ---- sessions ----

    /// Starts (or restarts) inspection on `camera_id` with `models`.
    pub fn start(&self, camera_id: &CameraId, models: Vec<ModelId>) -> DomainResult<()> {
        if models.is_empty() {
            return Err(ConfigurationError::new("models", "at least one model is required").into());
        }
        for id in &models {
            if self.registry.get(id).is_none() {
                return Err(DomainError::NotFound(format!("model {id}")));
            }
        }
        let mut cameras = self.lock_cameras()?;
        let entry = cameras
            .get_mut(camera_id)
            .ok_or_else(|| DomainError::NotFound(format!("camera {camera_id}")))?;
        self.check_rois(&models, entry.camera.settings.resolution)?;

        entry.session = None;
        entry.session = Some(self.spawn(&entry.camera, models));
        Ok(())
    }

    pub fn stop(&self, camera_id: &CameraId) -> DomainResult<()> {
        let session = {
            let mut cameras = self.lock_cameras()?;
            let entry = cameras
                .get_mut(camera_id)
                .ok_or_else(|| DomainError::NotFound(format!("camera {camera_id}")))?;
            entry.session.take()
        };
        // Dropping the handle cancels capture and any in-flight inference.
        drop(session);
        let id = camera_id.clone();
        self.live.update_status(|board| {
            let report = board.cameras.entry(id).or_default();
            report.status = CameraStatus::Disconnected;
            report.session = SessionState::Idle;
            report.detail = None;
        });
        info!(camera = %camera_id, "session stopped");
        Ok(())
    }

    pub fn pause(&self, camera_id: &CameraId) -> DomainResult<()> {
        self.send(camera_id, SessionCommand::Pause)
    }

    pub fn resume(&self, camera_id: &CameraId) -> DomainResult<()> {
        self.send(camera_id, SessionCommand::Resume)
    }

    /// Software, hardware and external triggers all arrive here.
    pub fn trigger(&self, camera_id: &CameraId) -> DomainResult<()> {
        self.send(camera_id, SessionCommand::Trigger)
    }

    // ---- actions ----

    pub fn apply_actions(&self, config: ActionConfig) -> DomainResult<()> {
        self.dispatcher.apply(config)
    }

    pub fn actions(&self) -> ActionConfig {
        self.dispatcher.config()
    }

    pub async fn probe_sink(&self, kind: SinkKind) -> Result<(), SinkError> {
        self.dispatcher.probe(kind).await
    }

    // ---- live ----

    pub fn subscribe(&self) -> LiveSubscription {
        self.live.subscribe()
    }

    pub fn status(&self) -> StatusBoard {
        self.live.status()
    }

    pub fn shutdown(&self) {
        if let Ok(mut cameras) = self.cameras.lock() {
            for entry in cameras.values_mut() {
                entry.session = None;
            }
        }
        self.dispatcher.shutdown();
        info!(project = %self.project.id, "inspection service stopped");
    }

    fn send(&self, camera_id: &CameraId, command: SessionCommand) -> DomainResult<()> {
        let cameras = self.lock_cameras()?;
        let entry = cameras
            .get(camera_id)
            .ok_or_else(|| DomainError::NotFound(format!("camera {camera_id}")))?;
        match &entry.session {
            Some(session) if session.send(command) => Ok(()),
            _ => Err(DomainError::OperationFailed(format!("camera {camera_id} has no running session"))),
        }
    }

    fn spawn(&self, camera: &Camera, models: Vec<ModelId>) -> SessionHandle {
        let settings = SessionSettings {
            timings: CaptureTimings {
                connect_timeout: self.config.connect_timeout,
                silence_timeout: self.config.silence_timeout,
                reconnect_base: self.config.reconnect_base,
                reconnect_cap: self.config.reconnect_cap,
            },
            frame_wait: self.config.frame_wait,
            pending_limit: self.config.pending_trigger_limit(),
        };
        spawn_session(
            self.project.clone(),
            camera.clone(),
            models,
            self.source.clone(),
            self.scheduler.clone(),
            self.hub.clone(),
            self.live.clone(),
            settings,
        )
    }

    fn check_rois(&self, models: &[ModelId], resolution: FrameSize) -> DomainResult<()> {
        for id in models {
            let Some(entry) = self.registry.get(id) else { continue };
            if let Some(roi) = entry.config.roi {
                if !roi.fits_within(resolution) {
                    return Err(ConfigurationError::new(
                        "roi",
                        format!(
                            "ROI of model {id} exceeds camera resolution {}x{}",
                            resolution.width, resolution.height
                        ),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    fn lock_cameras(&self) -> DomainResult<MutexGuard<'_, HashMap<CameraId, CameraEntry>>> {
        self.cameras
            .lock()
            .map_err(|_| DomainError::OperationFailed("camera table poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{FrameStream, InferenceEngine, ResultSink};
    use crate::domain::camera::{CameraMode, CameraProtocol, CaptureSettings};
    use crate::domain::detection::RawDetection;
    use crate::domain::errors::{ConnectionError, ConnectionFailure, InferenceError};
    use crate::domain::model::{ModelClass, Roi, YoloParams};
    use async_trait::async_trait;
    use image::RgbImage;

    struct NoSource;

    #[async_trait]
    impl FrameSourcePort for NoSource {
        async fn connect(&self, _: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
            Err(ConnectionError::new(ConnectionFailure::Unreachable, "offline"))
        }
    }

    struct Idle;

    impl InferenceEngine for Idle {
        fn infer(&self, _: &RgbImage, _: &YoloParams) -> Result<Vec<RawDetection>, InferenceError> {
            Ok(vec![])
        }
    }

    struct Loader;

    impl ModelLoaderPort for Loader {
        fn load(&self, _: &Model) -> Result<Arc<dyn InferenceEngine>, InferenceError> {
            Ok(Arc::new(Idle))
        }
    }

    struct NoSinks;

    impl SinkFactoryPort for NoSinks {
        fn build(&self, kind: SinkKind, _: &ActionConfig) -> Result<Arc<dyn ResultSink>, SinkError> {
            Err(SinkError::mqtt(crate::domain::errors::MqttFailure::BrokerUnreachable, kind.label()))
        }
    }

    fn service() -> InspectionService {
        InspectionService::new(
            ProjectContext { id: "p".into(), name: "P".into() },
            PipelineConfig::default(),
            Arc::new(NoSource),
            Arc::new(Loader),
            Arc::new(NoSinks),
        )
    }

    fn camera(width: u32, height: u32) -> Camera {
        Camera {
            id: CameraId::new("cam-1"),
            name: String::new(),
            protocol: CameraProtocol::Rtsp,
            connection_string: "rtsp://cam".into(),
            mode: CameraMode::Auto,
            trigger_source: None,
            trigger_interval: None,
            trigger_delay: None,
            settings: CaptureSettings {
                resolution: FrameSize { width, height },
                ..CaptureSettings::default()
            },
        }
    }

    fn model(roi: Option<Roi>) -> Model {
        Model {
            id: ModelId::new("model-1"),
            name: String::new(),
            filename: "m.onnx".into(),
            file_size: 0,
            classes: vec![
                ModelClass { id: 0, name: "OK".into(), color: "#0f0".into() },
                ModelClass { id: 1, name: "scratch".into(), color: "#f00".into() },
            ],
            confidence: 0.7,
            roi,
            params: YoloParams::default(),
        }
    }

    async fn wait_ready(service: &InspectionService) {
        for _ in 0..100 {
            if service.list_models().iter().all(|m| m.status == ModelState::Ready) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("model never became ready");
    }

    #[tokio::test]
    async fn roi_outside_resolution_blocks_start_and_resize() {
        let service = service();
        service.register_camera(camera(640, 480)).unwrap();
        service
            .register_model(model(Some(Roi { x: 600, y: 0, width: 100, height: 100 })))
            .unwrap();
        wait_ready(&service).await;

        let id = CameraId::new("cam-1");
        let err = service.start(&id, vec![ModelId::new("model-1")]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput(_)));

        service.update_camera(&id, camera(1280, 720)).unwrap();
        service.start(&id, vec![ModelId::new("model-1")]).unwrap();
        assert!(service.update_camera(&id, camera(640, 480)).is_err());
        assert!(service.remove_model(&ModelId::new("model-1")).is_err());

        service.stop(&id).unwrap();
        assert_eq!(service.status().cameras[&id].session, SessionState::Idle);
        service.remove_model(&ModelId::new("model-1")).unwrap();
    }

    #[tokio::test]
    async fn commands_need_a_running_session() {
        let service = service();
        service.register_camera(camera(640, 480)).unwrap();
        let id = CameraId::new("cam-1");
        assert!(matches!(service.trigger(&id), Err(DomainError::OperationFailed(_))));
        assert!(matches!(service.pause(&CameraId::new("nope")), Err(DomainError::NotFound(_))));
        assert!(service.register_camera(camera(640, 480)).is_err());
        service.remove_camera(&id).unwrap();
        assert!(service.list_cameras().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_and_removed_cameras_stay_that_way() {
        let config = PipelineConfig {
            reconnect_base: std::time::Duration::from_millis(5),
            reconnect_cap: std::time::Duration::from_millis(10),
            ..PipelineConfig::default()
        };
        let service = InspectionService::new(
            ProjectContext { id: "p".into(), name: "P".into() },
            config,
            Arc::new(NoSource),
            Arc::new(Loader),
            Arc::new(NoSinks),
        );
        let id = CameraId::new("cam-1");
        service.register_camera(camera(640, 480)).unwrap();
        service.register_model(model(None)).unwrap();
        wait_ready(&service).await;

        // The capture task keeps cycling through connecting and error.
        service.start(&id, vec![ModelId::new("model-1")]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        service.stop(&id).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let report = &service.status().cameras[&id];
        assert_eq!(report.status, CameraStatus::Disconnected);
        assert_eq!(report.session, SessionState::Idle);

        service.start(&id, vec![ModelId::new("model-1")]).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        service.remove_camera(&id).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!service.status().cameras.contains_key(&id));
    }

    #[tokio::test]
    async fn model_test_runs_an_uploaded_image() {
        let service = service();
        let mut confident = model(None);
        confident.id = ModelId::new("model-2");
        service.register_model(confident).unwrap();
        wait_ready(&service).await;

        let mut jpeg = Vec::new();
        RgbImage::new(32, 32)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        let outcome = service.test_model(&ModelId::new("model-2"), jpeg.clone()).await.unwrap();
        match outcome {
            ModelOutcome::Completed { model_id, detections, .. } => {
                assert_eq!(model_id, ModelId::new("model-2"));
                assert!(detections.is_empty());
            }
            ModelOutcome::Failed(failure) => panic!("unexpected failure {failure:?}"),
        }

        let err = service.test_model(&ModelId::new("model-2"), b"not a jpeg".to_vec()).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput(_)));
        let err = service.test_model(&ModelId::new("missing"), jpeg).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }
}
