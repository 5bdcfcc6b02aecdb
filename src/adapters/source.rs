use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::adapters::mjpeg;
use crate::application::ports::{FrameSourcePort, FrameStream};
use crate::domain::{
    camera::{Camera, CameraProtocol},
    errors::{ConnectionError, ConnectionFailure},
};

/// Routes each camera to the transport its protocol needs.
pub struct CameraSources {
    http: Client,
    ffmpeg: String,
}

impl CameraSources {
    pub fn new(ffmpeg: impl Into<String>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { http, ffmpeg: ffmpeg.into() })
    }
}

#[async_trait]
impl FrameSourcePort for CameraSources {
    async fn connect(&self, camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
        match camera.protocol {
            CameraProtocol::Http => mjpeg::http::open(&self.http, camera).await,
            CameraProtocol::Rtsp => mjpeg::rtsp::open(&self.ffmpeg, camera).await,
            CameraProtocol::Usb => open_usb(camera).await,
            CameraProtocol::GigE => Err(ConnectionError::new(
                ConnectionFailure::Unsupported,
                "GigE Vision needs a vendor GenTL producer, none is installed",
            )),
        }
    }
}

#[cfg(feature = "v4l2")]
async fn open_usb(camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
    crate::adapters::v4l2::capture::open(camera).await
}

#[cfg(not(feature = "v4l2"))]
async fn open_usb(_camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
    Err(ConnectionError::new(
        ConnectionFailure::Unsupported,
        "USB capture requires the `v4l2` feature",
    ))
}
