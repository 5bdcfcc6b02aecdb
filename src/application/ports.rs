use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;

use crate::domain::{
    action::{ActionConfig, SinkKind},
    camera::Camera,
    detection::RawDetection,
    errors::{ConnectionError, InferenceError, SinkError},
    frame::Frame,
    inspection::{InspectionResult, ProjectContext},
    model::{Model, YoloParams},
};

/// Opens a transport for one camera.
#[async_trait]
pub trait FrameSourcePort: Send + Sync {
    async fn connect(&self, camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError>;
}

/// Infinite sequence of frames from an open connection. Partial frames are
/// discarded inside the adapter; any error is terminal and the caller must
/// reconnect.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError>;
}

/// Blocking inference over an RGB image. Boxes are in the pixel space of
/// the image passed in.
pub trait InferenceEngine: Send + Sync {
    fn infer(&self, image: &RgbImage, params: &YoloParams)
        -> Result<Vec<RawDetection>, InferenceError>;
}

/// Turns a model artifact into a runnable engine. Blocking.
pub trait ModelLoaderPort: Send + Sync {
    fn load(&self, model: &Model) -> Result<Arc<dyn InferenceEngine>, InferenceError>;
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    async fn deliver(
        &self,
        project: &ProjectContext,
        result: &InspectionResult,
    ) -> Result<(), SinkError>;

    /// Connection test without writing a result.
    async fn probe(&self) -> Result<(), SinkError>;
}

/// Builds sink adapters from the project's action configuration.
pub trait SinkFactoryPort: Send + Sync {
    fn build(&self, kind: SinkKind, config: &ActionConfig) -> Result<Arc<dyn ResultSink>, SinkError>;
}
