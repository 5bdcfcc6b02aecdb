//! Runs the models bound to a camera against one forwarded frame.
//!
//! Every model gets its own blocking task; all of them share one deadline.
//! ROI cropping happens before inference, confidence and class filtering
//! after, so nothing sub-threshold ever leaves this module.

use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::application::registry::{LoadedModel, ModelRegistry};
use crate::domain::{
    detection::{Detection, RawDetection},
    errors::{InferenceError, InferenceFailure},
    frame::Frame,
    inspection::ModelFailure,
    model::{Model, ModelId, ModelState},
};

#[derive(Debug, Clone)]
pub enum ModelOutcome {
    Completed { model_id: ModelId, detections: Vec<Detection>, elapsed: Duration },
    Failed(ModelFailure),
}

impl ModelOutcome {
    fn failed(model_id: &ModelId, err: InferenceError) -> Self {
        ModelOutcome::Failed(ModelFailure {
            model_id: model_id.clone(),
            reason: err.reason,
            detail: err.detail,
        })
    }
}

pub struct InferenceScheduler {
    registry: Arc<ModelRegistry>,
    deadline: Duration,
    workers: Arc<Semaphore>,
}

impl InferenceScheduler {
    pub fn new(registry: Arc<ModelRegistry>, deadline: Duration, worker_limit: usize) -> Self {
        Self { registry, deadline, workers: Arc::new(Semaphore::new(worker_limit.max(1))) }
    }

    /// One outcome per requested model, in request order.
    pub async fn run(&self, frame: &Frame, model_ids: &[ModelId]) -> Vec<ModelOutcome> {
        let deadline_at = Instant::now() + self.deadline;
        let snapshot = self.registry.snapshot(model_ids);

        let _permit = match tokio::time::timeout_at(deadline_at, self.workers.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!(camera = %frame.camera_id, "no inference worker free before deadline");
                return model_ids
                    .iter()
                    .map(|id| {
                        ModelOutcome::failed(
                            id,
                            InferenceError::new(InferenceFailure::Timeout, "no worker available"),
                        )
                    })
                    .collect();
            }
        };

        let mut outcomes: Vec<Option<ModelOutcome>> = (0..snapshot.len()).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (idx, (id, entry)) in snapshot.into_iter().enumerate() {
            let model = match ready_model(&id, entry) {
                Ok(model) => model,
                Err(err) => {
                    debug!(camera = %frame.camera_id, model = %id, "skipping model: {}", err);
                    outcomes[idx] = Some(ModelOutcome::failed(&id, err));
                    continue;
                }
            };
            let image = frame.image.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let work = tokio::task::spawn_blocking(move || run_model(&model, &image));
                let result = match tokio::time::timeout_at(deadline_at, work).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(InferenceError::new(
                        InferenceFailure::RuntimeFault,
                        format!("inference task failed: {join_err}"),
                    )),
                    Err(_) => Err(InferenceError::new(
                        InferenceFailure::Timeout,
                        "per-frame deadline exceeded",
                    )),
                };
                (idx, id, result, started.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, id, Ok(detections), elapsed)) => {
                    outcomes[idx] = Some(ModelOutcome::Completed { model_id: id, detections, elapsed });
                }
                Ok((idx, id, Err(err), _)) => {
                    warn!(camera = %frame.camera_id, model = %id, "model excluded from frame: {}", err);
                    outcomes[idx] = Some(ModelOutcome::failed(&id, err));
                }
                Err(err) => warn!(camera = %frame.camera_id, "inference join failed: {err}"),
            }
        }

        outcomes
            .into_iter()
            .zip(model_ids)
            .map(|(outcome, id)| {
                outcome.unwrap_or_else(|| {
                    ModelOutcome::failed(
                        id,
                        InferenceError::new(InferenceFailure::RuntimeFault, "inference task lost"),
                    )
                })
            })
            .collect()
    }
}

fn ready_model(
    id: &ModelId,
    entry: Option<Arc<LoadedModel>>,
) -> Result<Arc<LoadedModel>, InferenceError> {
    let Some(model) = entry else {
        return Err(InferenceError::new(
            InferenceFailure::ModelNotReady,
            format!("model {id} is not registered"),
        ));
    };
    if model.state != ModelState::Ready || model.engine.is_none() {
        return Err(InferenceError::new(
            InferenceFailure::ModelNotReady,
            format!("model {id} is {:?}", model.state),
        ));
    }
    Ok(model)
}

fn run_model(model: &LoadedModel, image: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
    let engine = model.engine.as_ref().ok_or_else(|| {
        InferenceError::new(InferenceFailure::ModelNotReady, "engine not loaded")
    })?;
    let config = &model.config;

    let cropped;
    let (input, offset) = match config.roi {
        Some(roi) => {
            let size = crate::domain::camera::FrameSize { width: image.width(), height: image.height() };
            if !roi.fits_within(size) {
                return Err(InferenceError::new(
                    InferenceFailure::IncompatibleInput,
                    format!(
                        "roi {}x{}+{}+{} exceeds frame {}x{}",
                        roi.width, roi.height, roi.x, roi.y, size.width, size.height
                    ),
                ));
            }
            cropped = image::imageops::crop_imm(image, roi.x, roi.y, roi.width, roi.height).to_image();
            (&cropped, (roi.x as f32, roi.y as f32))
        }
        None => (image, (0.0, 0.0)),
    };

    let raw = engine.infer(input, &config.params)?;
    Ok(filter_detections(config, raw, offset))
}

/// Maps engine output back to native pixels, clips to the ROI and drops
/// sub-threshold or unknown-class detections.
pub fn filter_detections(model: &Model, raw: Vec<RawDetection>, offset: (f32, f32)) -> Vec<Detection> {
    let roi_box = model.roi.map(|roi| roi.as_box());
    raw.into_iter()
        .filter_map(|det| {
            if !det.confidence.is_finite() || det.confidence < model.confidence {
                return None;
            }
            let Some(class) = model.class(det.class_id) else {
                debug!(model = %model.id, class_id = det.class_id, "dropping detection of unknown class");
                return None;
            };
            let mut bbox = det.bbox.translate(offset.0, offset.1);
            if let Some(roi) = &roi_box {
                bbox = bbox.clip_to(roi)?;
            }
            Some(Detection {
                model_id: model.id.clone(),
                class_id: det.class_id,
                class_name: class.name.clone(),
                confidence: det.confidence,
                bounding_box: bbox,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::InferenceEngine;
    use crate::domain::camera::CameraId;
    use crate::domain::detection::BoundingBox;
    use crate::domain::model::{ModelClass, Roi, YoloParams};
    use std::sync::Mutex;

    struct FixedEngine {
        detections: Vec<RawDetection>,
        delay: Duration,
        seen_sizes: Mutex<Vec<(u32, u32)>>,
    }

    impl InferenceEngine for FixedEngine {
        fn infer(&self, image: &RgbImage, _: &YoloParams) -> Result<Vec<RawDetection>, InferenceError> {
            self.seen_sizes.lock().unwrap().push((image.width(), image.height()));
            std::thread::sleep(self.delay);
            Ok(self.detections.clone())
        }
    }

    fn model(id: &str, roi: Option<Roi>) -> Model {
        Model {
            id: ModelId::new(id),
            name: String::new(),
            filename: String::new(),
            file_size: 0,
            classes: vec![
                ModelClass { id: 0, name: "OK".into(), color: String::new() },
                ModelClass { id: 1, name: "scratch".into(), color: String::new() },
            ],
            confidence: 0.7,
            roi,
            params: YoloParams::default(),
        }
    }

    fn raw(class_id: u32, confidence: f32, bbox: BoundingBox) -> RawDetection {
        RawDetection { class_id, confidence, bbox }
    }

    fn register(registry: &ModelRegistry, model: Model, engine: Arc<FixedEngine>) {
        let id = model.id.clone();
        registry.insert_loading(model).unwrap();
        registry.set_ready(&id, engine);
    }

    fn frame() -> Frame {
        Frame::new(CameraId::new("cam-1"), RgbImage::new(640, 480), None)
    }

    #[test]
    fn drops_below_threshold_and_unknown_classes() {
        let m = model("m", None);
        let out = filter_detections(
            &m,
            vec![
                raw(1, 0.95, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                raw(0, 0.5, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                raw(5, 0.99, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                raw(1, f32::NAN, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            ],
            (0.0, 0.0),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert_eq!(out[0].class_name, "scratch");
    }

    #[test]
    fn roi_offsets_and_clips_boxes() {
        let m = model("m", Some(Roi { x: 100, y: 50, width: 200, height: 100 }));
        let out = filter_detections(
            &m,
            vec![
                raw(1, 0.9, BoundingBox::new(10.0, 10.0, 20.0, 20.0)),
                raw(1, 0.9, BoundingBox::new(190.0, 90.0, 50.0, 50.0)),
                raw(1, 0.9, BoundingBox::new(-500.0, 0.0, 10.0, 10.0)),
            ],
            (100.0, 50.0),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bounding_box, BoundingBox::new(110.0, 60.0, 20.0, 20.0));
        assert_eq!(out[1].bounding_box, BoundingBox::new(290.0, 140.0, 10.0, 10.0));
    }

    #[tokio::test]
    async fn crops_input_to_roi() {
        let registry = Arc::new(ModelRegistry::new());
        let engine = Arc::new(FixedEngine {
            detections: vec![],
            delay: Duration::ZERO,
            seen_sizes: Mutex::new(vec![]),
        });
        register(&registry, model("m", Some(Roi { x: 0, y: 0, width: 64, height: 32 })), engine.clone());
        let scheduler = InferenceScheduler::new(registry, Duration::from_secs(2), 1);

        let outcomes = scheduler.run(&frame(), &[ModelId::new("m")]).await;
        assert!(matches!(outcomes[0], ModelOutcome::Completed { .. }));
        assert_eq!(engine.seen_sizes.lock().unwrap().as_slice(), &[(64, 32)]);
    }

    #[tokio::test]
    async fn not_ready_and_slow_models_fail_without_blocking_others() {
        let registry = Arc::new(ModelRegistry::new());
        let fast = Arc::new(FixedEngine {
            detections: vec![raw(1, 0.9, BoundingBox::new(0.0, 0.0, 5.0, 5.0))],
            delay: Duration::ZERO,
            seen_sizes: Mutex::new(vec![]),
        });
        let slow = Arc::new(FixedEngine {
            detections: vec![],
            delay: Duration::from_millis(800),
            seen_sizes: Mutex::new(vec![]),
        });
        register(&registry, model("fast", None), fast);
        register(&registry, model("slow", None), slow);
        registry.insert_loading(model("loading", None)).unwrap();

        let scheduler = InferenceScheduler::new(registry, Duration::from_millis(150), 2);
        let ids = [ModelId::new("fast"), ModelId::new("slow"), ModelId::new("loading")];
        let outcomes = scheduler.run(&frame(), &ids).await;

        match &outcomes[0] {
            ModelOutcome::Completed { detections, .. } => assert_eq!(detections.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        match &outcomes[1] {
            ModelOutcome::Failed(f) => assert_eq!(f.reason, InferenceFailure::Timeout),
            other => panic!("unexpected {other:?}"),
        }
        match &outcomes[2] {
            ModelOutcome::Failed(f) => assert_eq!(f.reason, InferenceFailure::ModelNotReady),
            other => panic!("unexpected {other:?}"),
        }
    }
}
