use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::camera::CameraId;
use super::detection::Detection;
use super::errors::InferenceFailure;
use super::model::ModelId;

/// Project a pipeline runs on behalf of. Passed explicitly into every
/// pipeline and sink call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectContext {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    /// FAIL iff any detection carries a class other than OK.
    pub fn from_detections(detections: &[Detection]) -> Self {
        if detections.iter().any(Detection::is_defect) {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        }
    }
}

/// A model that contributed nothing to a result, and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelFailure {
    pub model_id: ModelId,
    pub reason: InferenceFailure,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub camera_id: CameraId,
    /// Per-camera capture sequence number.
    pub sequence: u64,
    pub model_ids: Vec<ModelId>,
    pub image_ref: Option<String>,
    pub detections: Vec<Detection>,
    pub processing_time_ms: f64,
    pub verdict: Verdict,
    #[serde(default)]
    pub failures: Vec<ModelFailure>,
    /// Encoded JPEG of the inspected frame, kept out of the JSON form.
    #[serde(skip)]
    pub image: Option<Arc<Vec<u8>>>,
}

impl InspectionResult {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InspectionStats {
    pub total_inspections: u64,
    pub pass_count: u64,
    pub fail_count: u64,
    pub avg_processing_time: f64,
}

impl InspectionStats {
    pub fn record(&mut self, result: &InspectionResult) {
        let previous = self.total_inspections as f64;
        self.total_inspections += 1;
        match result.verdict {
            Verdict::Pass => self.pass_count += 1,
            Verdict::Fail => self.fail_count += 1,
        }
        self.avg_processing_time = (self.avg_processing_time * previous
            + result.processing_time_ms)
            / self.total_inspections as f64;
    }
}
