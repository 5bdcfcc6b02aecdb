use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};

use super::camera::{CameraId, FrameSize};

/// One decoded frame from a camera. Pixel data is shared so the frame can be
/// handed to several models without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: CameraId,
    /// Assigned by the capture supervisor in arrival order.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<RgbImage>,
    /// Original JPEG when the transport delivered one.
    pub jpeg: Option<Arc<Vec<u8>>>,
}

impl Frame {
    pub fn new(camera_id: CameraId, image: RgbImage, jpeg: Option<Vec<u8>>) -> Self {
        Self {
            camera_id,
            sequence: 0,
            captured_at: Utc::now(),
            image: Arc::new(image),
            jpeg: jpeg.map(Arc::new),
        }
    }

    pub fn from_jpeg(camera_id: CameraId, jpeg: Vec<u8>) -> Result<Self, image::ImageError> {
        let rgb = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?.to_rgb8();
        Ok(Self::new(camera_id, rgb, Some(jpeg)))
    }

    pub fn size(&self) -> FrameSize {
        FrameSize { width: self.image.width(), height: self.image.height() }
    }
}
