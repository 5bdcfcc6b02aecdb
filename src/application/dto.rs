use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::application::registry::ModelRegistry;
use crate::application::scheduler::ModelOutcome;
use crate::domain::{
    action::ActionConfig,
    camera::CameraId,
    detection::{BoundingBox, Detection},
    inspection::{InspectionResult, ModelFailure, Verdict},
    model::ModelId,
    stream::StatusBoard,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub models: Vec<ModelId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Commands a dashboard may send over the stream socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    Start {
        camera: CameraId,
        models: Vec<ModelId>,
    },
    Stop {
        camera: CameraId,
    },
    Pause {
        camera: CameraId,
    },
    Resume {
        camera: CameraId,
    },
    Trigger {
        camera: CameraId,
    },
    Actions {
        config: ActionConfig,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionView {
    pub model_id: ModelId,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub color: Option<String>,
}

/// Result as shown on the dashboard. Class colours come from the model
/// registry at send time, so a recolour shows up on the next result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub camera_id: CameraId,
    pub sequence: u64,
    pub verdict: Verdict,
    pub detections: Vec<DetectionView>,
    pub processing_time_ms: f64,
    pub image_ref: Option<String>,
    pub failures: Vec<ModelFailure>,
    pub has_image: bool,
}

impl ResultView {
    pub fn resolve(result: &InspectionResult, registry: &ModelRegistry) -> Self {
        Self {
            id: result.id,
            timestamp: result.timestamp,
            project_id: result.project_id.clone(),
            camera_id: result.camera_id.clone(),
            sequence: result.sequence,
            verdict: result.verdict,
            detections: result.detections.iter().map(|d| detection_view(d, registry)).collect(),
            processing_time_ms: result.processing_time_ms,
            image_ref: result.image_ref.clone(),
            failures: result.failures.clone(),
            has_image: result.image.is_some(),
        }
    }
}

/// Reply to a single-image model test.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTestResponse {
    pub model_id: ModelId,
    pub detections: Vec<DetectionView>,
    pub inference_time_ms: f64,
    pub failure: Option<ModelFailure>,
}

impl ModelTestResponse {
    pub fn resolve(outcome: ModelOutcome, registry: &ModelRegistry) -> Self {
        match outcome {
            ModelOutcome::Completed { model_id, detections, elapsed } => Self {
                model_id,
                detections: detections.iter().map(|d| detection_view(d, registry)).collect(),
                inference_time_ms: elapsed.as_secs_f64() * 1000.0,
                failure: None,
            },
            ModelOutcome::Failed(failure) => Self {
                model_id: failure.model_id.clone(),
                detections: Vec::new(),
                inference_time_ms: 0.0,
                failure: Some(failure),
            },
        }
    }
}

fn detection_view(detection: &Detection, registry: &ModelRegistry) -> DetectionView {
    DetectionView {
        model_id: detection.model_id.clone(),
        class_id: detection.class_id,
        class_name: detection.class_name.clone(),
        confidence: detection.confidence,
        bounding_box: detection.bounding_box,
        color: registry.class_color(&detection.model_id, detection.class_id),
    }
}

/// Server-to-dashboard text messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Result(ResultView),
    Status(StatusBoard),
    Gap { missed: u64 },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_socket_commands() {
        let cmd: ClientCommand =
            serde_json::from_value(json!({"type": "start", "camera": "cam-1", "models": ["model-1"]}))
                .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Start { camera: CameraId::new("cam-1"), models: vec![ModelId::new("model-1")] }
        );
        let cmd: ClientCommand = serde_json::from_value(json!({"type": "trigger", "camera": "cam-2"})).unwrap();
        assert_eq!(cmd, ClientCommand::Trigger { camera: CameraId::new("cam-2") });
        assert!(serde_json::from_value::<ClientCommand>(json!({"type": "reboot"})).is_err());
    }

    #[test]
    fn gap_message_shape() {
        let text = serde_json::to_value(ServerMessage::Gap { missed: 3 }).unwrap();
        assert_eq!(text, json!({"type": "gap", "missed": 3}));
    }
}
