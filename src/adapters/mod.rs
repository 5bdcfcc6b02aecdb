pub mod http;
pub mod mjpeg;
pub mod onnx;
pub mod sinks;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;
