use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use tokio::sync::{mpsc, oneshot};
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::application::ports::FrameStream;
use crate::domain::{
    camera::{Camera, CaptureSettings},
    errors::{ConnectionError, ConnectionFailure},
    frame::Frame,
};

// Standard V4L2 user-class control ids.
const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_SATURATION: u32 = 0x0098_0902;
const CID_GAIN: u32 = 0x0098_0913;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

/// Resolves `/dev/videoN` or a bare index.
pub fn device_path(connection_string: &str) -> String {
    match connection_string.trim().parse::<u32>() {
        Ok(index) => format!("/dev/video{index}"),
        Err(_) => connection_string.trim().to_string(),
    }
}

/// Opens the device on a dedicated blocking thread; frames come back over a
/// small channel. The thread ends once the stream is dropped.
pub async fn open(camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
    let path = device_path(&camera.connection_string);
    let settings = camera.settings.clone();
    let camera_id = camera.id.clone();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (frames_tx, frames_rx) = mpsc::channel(2);

    std::thread::Builder::new()
        .name(format!("v4l2-{camera_id}"))
        .spawn(move || capture_loop(&path, &settings, ready_tx, frames_tx))
        .map_err(|e| ConnectionError::new(ConnectionFailure::Unreachable, e.to_string()))?;

    match ready_rx.await {
        Ok(Ok(())) => Ok(Box::new(V4l2Stream { camera_id, frames: frames_rx })),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ConnectionError::new(ConnectionFailure::Unreachable, "capture thread exited")),
    }
}

struct V4l2Stream {
    camera_id: crate::domain::camera::CameraId,
    frames: mpsc::Receiver<Result<(RgbImage, Vec<u8>), ConnectionError>>,
}

#[async_trait]
impl FrameStream for V4l2Stream {
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        match self.frames.recv().await {
            Some(Ok((rgb, jpeg))) => Ok(Frame::new(self.camera_id.clone(), rgb, Some(jpeg))),
            Some(Err(err)) => Err(err),
            None => Err(ConnectionError::new(ConnectionFailure::Unreachable, "device closed")),
        }
    }
}

fn unreachable(err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::new(ConnectionFailure::Unreachable, err.to_string())
}

fn capture_loop(
    path: &str,
    settings: &CaptureSettings,
    ready: oneshot::Sender<Result<(), ConnectionError>>,
    frames: mpsc::Sender<Result<(RgbImage, Vec<u8>), ConnectionError>>,
) {
    let opened = configure(path, settings);
    let (dev, fourcc, width, height) = match opened {
        Ok(v) => v,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let mut stream = match Stream::with_buffers(&dev, v4l::buffer::Type::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(unreachable(err)));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    loop {
        let decoded = match stream.next() {
            Ok((data, _)) => decode(data, fourcc, width, height),
            Err(err) => {
                let _ = frames.blocking_send(Err(unreachable(err)));
                return;
            }
        };
        match decoded {
            Ok(frame) => {
                if frames.blocking_send(Ok(frame)).is_err() {
                    return;
                }
            }
            // Corrupt or partial buffer: skip it.
            Err(err) => tracing::trace!(device = path, "dropping undecodable buffer: {err}"),
        }
    }
}

fn configure(path: &str, settings: &CaptureSettings) -> Result<(Device, FourCC, u32, u32), ConnectionError> {
    let dev = Device::with_path(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            ConnectionError::new(ConnectionFailure::Auth, format!("{path}: {e}"))
        }
        _ => ConnectionError::new(ConnectionFailure::Unreachable, format!("{path}: {e}")),
    })?;

    let mut fmt = dev.format().map_err(unreachable)?;
    fmt.fourcc = FourCC::new(b"MJPG");
    fmt.width = settings.resolution.width;
    fmt.height = settings.resolution.height;
    // The driver may pick the closest supported mode.
    let actual = dev.set_format(&fmt).map_err(unreachable)?;

    if let Ok(mut params) = dev.params() {
        params.interval.numerator = 1;
        params.interval.denominator = settings.frame_rate;
        let _ = dev.set_params(&params);
    }

    let controls = [
        (CID_BRIGHTNESS, i64::from(settings.brightness)),
        (CID_CONTRAST, i64::from(settings.contrast)),
        (CID_SATURATION, i64::from(settings.saturation)),
        (CID_GAIN, settings.gain.round() as i64),
        // V4L2 exposure is in 100 µs units.
        (CID_EXPOSURE_ABSOLUTE, (settings.exposure / 100.0).round() as i64),
    ];
    for (id, value) in controls {
        if let Err(err) = dev.set_control(Control { id, value: Value::Integer(value) }) {
            tracing::debug!(device = path, control = id, "control not applied: {err}");
        }
    }

    tracing::info!(
        device = path,
        "camera opened: {}x{} [{}] at {} fps",
        actual.width,
        actual.height,
        actual.fourcc,
        settings.frame_rate
    );
    Ok((dev, actual.fourcc, actual.width, actual.height))
}

fn decode(data: &[u8], fourcc: FourCC, width: u32, height: u32) -> Result<(RgbImage, Vec<u8>), String> {
    match fourcc.str().map_err(|e| e.to_string())? {
        "MJPG" => {
            let rgb = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                .map_err(|e| e.to_string())?
                .to_rgb8();
            Ok((rgb, data.to_vec()))
        }
        "YUYV" => {
            let rgb = yuyv_to_rgb(data, width, height);
            let mut jpeg = Vec::new();
            let mut enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 80);
            enc.encode(rgb.as_raw(), width, height, image::ExtendedColorType::Rgb8)
                .map_err(|e| e.to_string())?;
            Ok((rgb, jpeg))
        }
        other => Err(format!("pixel format {other} not supported")),
    }
}

/// YUYV 4:2:2 to RGB, BT.601. Each 4-byte group `[Y0 U Y1 V]` holds two pixels.
fn yuyv_to_rgb(yuyv: &[u8], w: u32, h: u32) -> RgbImage {
    let mut out = RgbImage::new(w, h);
    let convert = |y: f32, u: f32, v: f32| {
        image::Rgb([
            (y + 1.402 * v).clamp(0.0, 255.0) as u8,
            (y - 0.344_136 * u - 0.714_136 * v).clamp(0.0, 255.0) as u8,
            (y + 1.772 * u).clamp(0.0, 255.0) as u8,
        ])
    };
    for (i, chunk) in yuyv.chunks_exact(4).enumerate() {
        let u = f32::from(chunk[1]) - 128.0;
        let v = f32::from(chunk[3]) - 128.0;
        let idx = i as u32 * 2;
        let (x, y) = (idx % w, idx / w);
        if y >= h {
            break;
        }
        out.put_pixel(x, y, convert(f32::from(chunk[0]), u, v));
        if x + 1 < w {
            out.put_pixel(x + 1, y, convert(f32::from(chunk[2]), u, v));
        }
    }
    out
}
