use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{decode_frame, JpegSplitter};
use crate::application::ports::FrameStream;
use crate::domain::{
    camera::{Camera, CameraId},
    errors::{ConnectionError, ConnectionFailure},
    frame::Frame,
};

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 20;
const STDERR_LINE_CHARS: usize = 512;
const STDERR_FLUSH: Duration = Duration::from_millis(500);

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Reads ffmpeg's stderr for the life of the process so a chatty decoder
/// never blocks on a full pipe. The last lines are kept to explain an exit.
fn drain_stderr(camera_id: CameraId, stderr: ChildStderr) -> (StderrTail, JoinHandle<()>) {
    let tail = StderrTail::default();
    let keep = tail.clone();
    let handle = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let mut line = String::from_utf8_lossy(&raw).trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            debug!(camera = %camera_id, "ffmpeg: {line}");
            if line.len() > STDERR_LINE_CHARS {
                let cut = (0..=STDERR_LINE_CHARS).rev().find(|&i| line.is_char_boundary(i)).unwrap_or(0);
                line.truncate(cut);
            }
            let Ok(mut tail) = keep.lock() else { break };
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
    (tail, handle)
}

fn ffmpeg_command(ffmpeg: &str, camera: &Camera) -> Command {
    let res = camera.settings.resolution;
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-fflags")
        .arg("nobuffer+discardcorrupt")
        .arg("-flags")
        .arg("low_delay")
        .arg("-i")
        .arg(&camera.connection_string)
        .arg("-an")
        // Frames leave in the camera's configured pixel space so ROIs line up.
        .arg("-vf")
        .arg(format!("scale={}:{}", res.width, res.height))
        .arg("-q:v")
        .arg("4")
        .arg("-f")
        .arg("mjpeg")
        .arg("-");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Starts ffmpeg and waits for the first decoded frame, so an unreachable
/// camera or bad credentials surface as a connect failure.
pub async fn open(ffmpeg: &str, camera: &Camera) -> Result<Box<dyn FrameStream>, ConnectionError> {
    let mut child = ffmpeg_command(ffmpeg, camera).spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ConnectionError::new(ConnectionFailure::Unsupported, format!("{ffmpeg} not found: {e}"))
        }
        _ => ConnectionError::new(ConnectionFailure::Unreachable, e.to_string()),
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ConnectionError::new(ConnectionFailure::Unreachable, "ffmpeg stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ConnectionError::new(ConnectionFailure::Unreachable, "ffmpeg stderr unavailable"))?;
    let (stderr_tail, stderr_task) = drain_stderr(camera.id.clone(), stderr);

    let mut stream = RtspStream {
        camera_id: camera.id.clone(),
        child,
        stdout: BufReader::with_capacity(READ_CHUNK, stdout),
        splitter: JpegSplitter::new(MAX_FRAME_BYTES),
        buf: vec![0u8; READ_CHUNK],
        pending: None,
        stderr_tail,
        stderr_task: Some(stderr_task),
    };
    let first = stream.read_frame().await?;
    debug!(camera = %camera.id, "rtsp stream delivering frames");
    stream.pending = Some(first);
    Ok(Box::new(stream))
}

struct RtspStream {
    camera_id: CameraId,
    child: Child,
    stdout: BufReader<ChildStdout>,
    splitter: JpegSplitter,
    buf: Vec<u8>,
    pending: Option<Frame>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

impl RtspStream {
    async fn read_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            while let Some(jpeg) = self.splitter.next_frame() {
                if let Some(frame) = decode_frame(&self.camera_id, jpeg).await {
                    return Ok(frame);
                }
            }
            let n = self
                .stdout
                .read(&mut self.buf)
                .await
                .map_err(|e| ConnectionError::new(ConnectionFailure::Unreachable, e.to_string()))?;
            if n == 0 {
                return Err(self.exit_error().await);
            }
            self.splitter.push(&self.buf[..n]);
        }
    }

    /// Classifies ffmpeg's exit from what it printed.
    async fn exit_error(&mut self) -> ConnectionError {
        let status = self.child.wait().await.ok();
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_FLUSH, task).await;
        }
        let lines: Vec<String> = match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };
        let stderr = lines.join("\n");
        let detail = lines.last().map_or("ffmpeg exited", String::as_str).to_string();
        warn!(camera = %self.camera_id, ?status, "ffmpeg ended: {detail}");
        let reason = if stderr.contains("401") || stderr.contains("Unauthorized") {
            ConnectionFailure::Auth
        } else if stderr.contains("timed out") {
            ConnectionFailure::Timeout
        } else {
            ConnectionFailure::Unreachable
        };
        ConnectionError::new(reason, detail)
    }
}

#[async_trait]
impl FrameStream for RtspStream {
    async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        match self.pending.take() {
            Some(frame) => Ok(frame),
            None => self.read_frame().await,
        }
    }
}
