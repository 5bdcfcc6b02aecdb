use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Response, StatusCode};
use tokio::time::Instant;
use tracing::debug;

use super::{decode_frame, JpegSplitter};
use crate::application::ports::FrameStream;
use crate::domain::{
    camera::{Camera, CameraId},
    errors::{ConnectionError, ConnectionFailure},
    frame::Frame,
};

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn map_request_error(err: reqwest::Error) -> ConnectionError {
    let reason = if err.is_timeout() {
        ConnectionFailure::Timeout
    } else {
        ConnectionFailure::Unreachable
    };
    ConnectionError::new(reason, err.to_string())
}

fn check_status(response: &Response) -> Result<(), ConnectionError> {
    match response.status() {
        status if status.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ConnectionError::new(
            ConnectionFailure::Auth,
            format!("camera rejected credentials ({})", response.status()),
        )),
        status => Err(ConnectionError::new(
            ConnectionFailure::Unreachable,
            format!("camera answered {status}"),
        )),
    }
}

/// Opens an HTTP camera. A `multipart/x-mixed-replace` answer is read as a
/// continuous MJPEG stream; anything else is treated as a snapshot endpoint
/// polled at the configured frame rate.
pub async fn open(client: &Client, camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
    let url = camera.connection_string.clone();
    let response = client.get(&url).send().await.map_err(map_request_error)?;
    check_status(&response)?;

    let multipart = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/"));

    if multipart {
        debug!(camera = %camera.id, "reading multipart MJPEG stream");
        Ok(Box::new(MultipartStream {
            camera_id: camera.id.clone(),
            response,
            splitter: JpegSplitter::new(MAX_FRAME_BYTES),
        }))
    } else {
        debug!(camera = %camera.id, "polling snapshot endpoint");
        let first = response.bytes().await.map_err(map_request_error)?.to_vec();
        Ok(Box::new(SnapshotStream {
            camera_id: camera.id.clone(),
            client: client.clone(),
            url,
            interval: camera.min_frame_interval(),
            last_request: Instant::now(),
            pending: Some(first),
        }))
    }
}

struct MultipartStream {
    camera_id: CameraId,
    response: Response,
    splitter: JpegSplitter,
}

#[async_trait]
impl FrameStream for MultipartStream {
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            while let Some(jpeg) = self.splitter.next_frame() {
                if let Some(frame) = decode_frame(&self.camera_id, jpeg).await {
                    return Ok(frame);
                }
            }
            match self.response.chunk().await.map_err(map_request_error)? {
                Some(chunk) => self.splitter.push(&chunk),
                None => {
                    return Err(ConnectionError::new(ConnectionFailure::Unreachable, "stream closed by camera"))
                }
            }
        }
    }
}

struct SnapshotStream {
    camera_id: CameraId,
    client: Client,
    url: String,
    interval: Duration,
    last_request: Instant,
    pending: Option<Vec<u8>>,
}

#[async_trait]
impl FrameStream for SnapshotStream {
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            let jpeg = match self.pending.take() {
                Some(jpeg) => jpeg,
                None => {
                    tokio::time::sleep_until(self.last_request + self.interval).await;
                    self.last_request = Instant::now();
                    let response = self.client.get(&self.url).send().await.map_err(map_request_error)?;
                    check_status(&response)?;
                    response.bytes().await.map_err(map_request_error)?.to_vec()
                }
            };
            if let Some(frame) = decode_frame(&self.camera_id, jpeg).await {
                return Ok(frame);
            }
        }
    }
}
