use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::application::scheduler::ModelOutcome;
use crate::domain::{
    detection::Detection,
    frame::Frame,
    inspection::{InspectionResult, ModelFailure, ProjectContext, Verdict},
    model::ModelId,
};

/// Stable order: class id ascending, then confidence descending.
pub fn sort_detections(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        a.class_id
            .cmp(&b.class_id)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });
}

/// Fuses the per-model outcomes of one frame into a single result.
/// `forwarded_at` is when the trigger controller released the frame.
pub fn aggregate(
    project: &ProjectContext,
    frame: &Frame,
    model_ids: &[ModelId],
    outcomes: Vec<ModelOutcome>,
    forwarded_at: Instant,
) -> InspectionResult {
    let mut detections = Vec::new();
    let mut failures: Vec<ModelFailure> = Vec::new();
    for outcome in outcomes {
        match outcome {
            ModelOutcome::Completed { detections: found, .. } => detections.extend(found),
            ModelOutcome::Failed(failure) => failures.push(failure),
        }
    }
    sort_detections(&mut detections);

    let id = Uuid::new_v4();
    let image_ref = frame
        .jpeg
        .as_ref()
        .map(|_| format!("{}/{}.jpg", frame.camera_id, id));

    InspectionResult {
        id,
        timestamp: Utc::now(),
        project_id: project.id.clone(),
        camera_id: frame.camera_id.clone(),
        sequence: frame.sequence,
        model_ids: model_ids.to_vec(),
        image_ref,
        verdict: Verdict::from_detections(&detections),
        detections,
        processing_time_ms: forwarded_at.elapsed().as_secs_f64() * 1000.0,
        failures,
        image: frame.jpeg.clone(),
    }
}
