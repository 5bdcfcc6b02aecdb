use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::action::SinkKind;
use super::camera::{CameraId, CameraStatus};
use super::detection::Detection;
use super::inspection::{InspectionResult, InspectionStats};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CameraReport {
    pub status: CameraStatus,
    pub session: SessionState,
    pub detail: Option<String>,
}

impl Default for CameraReport {
    fn default() -> Self {
        Self { status: CameraStatus::Disconnected, session: SessionState::Idle, detail: None }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkState {
    Disabled,
    Enabled,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SinkReport {
    pub state: SinkState,
    pub last_error: Option<String>,
    pub delivered: u64,
    pub dropped: u64,
}

impl Default for SinkReport {
    fn default() -> Self {
        Self { state: SinkState::Disabled, last_error: None, delivered: 0, dropped: 0 }
    }
}

/// Latest known state of every camera and sink. Consumers only ever see the
/// newest board, never a backlog.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusBoard {
    pub project_id: String,
    pub cameras: BTreeMap<CameraId, CameraReport>,
    pub sinks: BTreeMap<SinkKind, SinkReport>,
    pub stats: InspectionStats,
}

#[derive(Debug, Clone)]
pub enum LiveEvent {
    Result(Arc<InspectionResult>),
    Status(StatusBoard),
    /// Results dropped because this consumer fell behind.
    Gap { missed: u64 },
}

/// Compact "2 scratch, 1 OK" summary used in logs.
pub fn summarize_detections(detections: &[Detection]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for det in detections {
        *counts.entry(det.class_name.as_str()).or_insert(0) += 1;
    }
    let mut parts: Vec<_> = counts.into_iter().collect();
    parts.sort_unstable();
    parts
        .iter()
        .map(|(label, count)| format!("{} {}", count, label))
        .collect::<Vec<_>>()
        .join(", ")
}
