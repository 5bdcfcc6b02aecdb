use crate::domain::detection::{BoundingBox, RawDetection};

/// Candidates below this score never reach NMS. Per-model confidence
/// thresholds are applied later by the scheduler.
pub const SCORE_FLOOR: f32 = 0.01;

#[cfg(feature = "onnx")]
pub use engine::OnnxYoloEngine;

#[cfg(feature = "onnx")]
mod engine {
    use std::path::Path;
    use std::sync::Mutex;

    use image::{imageops::FilterType, RgbImage};
    use ndarray::{Array4, ArrayViewD, Axis, IxDyn};
    use ort::execution_providers::CUDAExecutionProvider;
    use ort::session::Session;
    use ort::value::Value;

    use super::{decode_candidates, non_max_suppression, SCORE_FLOOR};
    use crate::application::ports::InferenceEngine;
    use crate::domain::detection::RawDetection;
    use crate::domain::errors::{InferenceError, InferenceFailure};
    use crate::domain::model::YoloParams;

    fn fault(err: impl std::fmt::Display) -> InferenceError {
        InferenceError::new(InferenceFailure::RuntimeFault, err.to_string())
    }

    /// YOLOv8-style detector: one output of shape `[1, 4 + classes, candidates]`.
    pub struct OnnxYoloEngine {
        session: Mutex<Session>,
    }

    impl OnnxYoloEngine {
        pub fn load(path: &Path) -> Result<Self, InferenceError> {
            let mut builder = Session::builder().map_err(fault)?.with_intra_threads(4).map_err(fault)?;

            // CUDA is optional; fall back to CPU when it cannot be registered.
            let cuda = CUDAExecutionProvider::default().build();
            if let Ok(with_cuda) = builder.clone().with_execution_providers([cuda]) {
                builder = with_cuda;
            }

            let bytes = std::fs::read(path).map_err(fault)?;
            let session = builder.commit_from_memory(&bytes).map_err(fault)?;
            tracing::info!(model = %path.display(), "onnx session created");
            Ok(Self { session: Mutex::new(session) })
        }
    }

    impl InferenceEngine for OnnxYoloEngine {
        fn infer(&self, rgb: &RgbImage, params: &YoloParams) -> Result<Vec<RawDetection>, InferenceError> {
            if rgb.width() == 0 || rgb.height() == 0 {
                return Err(InferenceError::new(InferenceFailure::IncompatibleInput, "empty image"));
            }
            let imgsz = params.input_size as usize;
            let resized = image::imageops::resize(rgb, imgsz as u32, imgsz as u32, FilterType::Triangle);

            let mut input = Array4::<f32>::zeros((1, 3, imgsz, imgsz));
            for (x, y, pixel) in resized.enumerate_pixels() {
                let (x, y) = (x as usize, y as usize);
                input[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
                input[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
                input[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
            }
            let shape = vec![1, 3, imgsz as i64, imgsz as i64];
            let tensor = Value::from_array((shape, input.into_raw_vec_and_offset().0)).map_err(fault)?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| fault("onnx session lock poisoned"))?;
            let outputs = session.run(ort::inputs![tensor]).map_err(fault)?;
            let (shape_out, data_out) = outputs[0].try_extract_tensor::<f32>().map_err(fault)?;

            let dims: Vec<usize> = shape_out.iter().map(|&d| d as usize).collect();
            if dims.len() != 3 || dims[1] < 5 {
                return Err(InferenceError::new(
                    InferenceFailure::IncompatibleInput,
                    format!("unexpected output shape {dims:?}"),
                ));
            }
            let view = ArrayViewD::from_shape(IxDyn(&dims), data_out).map_err(fault)?;
            let view = view.index_axis(Axis(0), 0);

            let scale = (
                rgb.width() as f32 / imgsz as f32,
                rgb.height() as f32 / imgsz as f32,
            );
            let candidates = decode_candidates(
                view.shape()[0],
                view.shape()[1],
                |row, col| view[[row, col]],
                scale,
                SCORE_FLOOR,
            );
            Ok(non_max_suppression(candidates, params.iou_threshold, params.max_detections))
        }
    }
}

/// Reads a `[4 + classes, candidates]` YOLO head: centre box then one score
/// per class. Boxes are scaled back to source pixels.
pub fn decode_candidates(
    rows: usize,
    candidates: usize,
    at: impl Fn(usize, usize) -> f32,
    scale: (f32, f32),
    floor: f32,
) -> Vec<RawDetection> {
    let mut out = Vec::new();
    for i in 0..candidates {
        let best = (4..rows)
            .map(|row| (row - 4, at(row, i)))
            .filter(|(_, score)| score.is_finite())
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let Some((class_id, score)) = best else { continue };
        if score < floor {
            continue;
        }
        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        out.push(RawDetection {
            class_id: class_id as u32,
            confidence: score,
            bbox: BoundingBox::new((cx - w / 2.0) * scale.0, (cy - h / 2.0) * scale.1, w * scale.0, h * scale.1),
        });
    }
    out
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter = a.clip_to(b).map(|i| i.width * i.height).unwrap_or(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy per-class NMS, highest score first.
pub fn non_max_suppression(
    mut detections: Vec<RawDetection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::new();
    for det in detections {
        if kept.len() >= max_detections {
            break;
        }
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == det.class_id && iou(&k.bbox, &det.bbox) > iou_threshold);
        if !overlaps {
            kept.push(det);
        }
    }
    kept
}
