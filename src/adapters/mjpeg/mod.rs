//! Cameras that deliver JPEG bytes: HTTP (multipart MJPEG or snapshot
//! endpoints) and RTSP transcoded to MJPEG by an ffmpeg child process.

pub mod http;
pub mod rtsp;

use tracing::trace;

use crate::domain::{camera::CameraId, frame::Frame};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Cuts complete JPEG images out of an arbitrary byte stream.
///
/// Marker segments ahead of the scan data (APPn, quantisation tables and
/// so on) are skipped by their length field, so an embedded EXIF thumbnail
/// does not end the outer image early. A frame cut short by transport loss shows up as a second start marker
/// before the end marker; the partial frame is discarded and parsing
/// resumes at the new image.
pub struct JpegSplitter {
    buffer: Vec<u8>,
    max_frame: usize,
}

impl JpegSplitter {
    pub fn new(max_frame: usize) -> Self {
        Self { buffer: Vec::with_capacity(64 * 1024), max_frame }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(start) = find_marker(&self.buffer, &SOI, 0) else {
                // Keep a trailing 0xFF that may begin a marker.
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let cut = self.buffer.len() - keep;
                self.buffer.drain(..cut);
                return None;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            let Some(body) = header_end(&self.buffer) else {
                if self.buffer.len() > self.max_frame {
                    trace!(bytes = self.buffer.len(), "jpeg header exceeds size limit, resyncing");
                    self.buffer.drain(..2);
                    continue;
                }
                return None;
            };
            let end = find_marker(&self.buffer, &EOI, body);
            let restart = find_marker(&self.buffer, &SOI, body);
            match (end, restart) {
                (Some(end), Some(next)) if next < end => {
                    trace!(bytes = next, "dropping truncated jpeg");
                    self.buffer.drain(..next);
                }
                (Some(end), _) => {
                    let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
                    return Some(frame);
                }
                (None, Some(next)) => {
                    trace!(bytes = next, "dropping truncated jpeg");
                    self.buffer.drain(..next);
                }
                (None, None) => {
                    if self.buffer.len() > self.max_frame {
                        trace!(bytes = self.buffer.len(), "jpeg exceeds size limit, discarding");
                        self.buffer.clear();
                    }
                    return None;
                }
            }
        }
    }
}

/// Offset past the length-prefixed segments that follow SOI, or `None`
/// while one of them is still incomplete.
fn header_end(buffer: &[u8]) -> Option<usize> {
    let mut pos = 2;
    loop {
        match buffer.get(pos) {
            None => return None,
            Some(&0xFF) => {}
            Some(_) => return Some(pos),
        }
        let marker = *buffer.get(pos + 1)?;
        match marker {
            // fill byte
            0xFF => pos += 1,
            // SOS, SOI, EOI, RSTn and TEM carry no length to skip
            0xDA | 0xD0..=0xD9 | 0x01 | 0x00 => return Some(pos),
            _ => {
                let len = usize::from(u16::from_be_bytes([*buffer.get(pos + 2)?, *buffer.get(pos + 3)?]));
                if len < 2 {
                    return Some(pos);
                }
                pos += 2 + len;
            }
        }
    }
}

fn find_marker(buffer: &[u8], marker: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|pos| pos + from)
}

/// Decodes off the async workers; undecodable images are skipped.
pub async fn decode_frame(camera_id: &CameraId, jpeg: Vec<u8>) -> Option<Frame> {
    let id = camera_id.clone();
    match tokio::task::spawn_blocking(move || Frame::from_jpeg(id, jpeg)).await {
        Ok(Ok(frame)) => Some(frame),
        Ok(Err(err)) => {
            trace!(camera = %camera_id, "dropping undecodable jpeg: {err}");
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, body, body, 0xFF, 0xD9]
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut splitter = JpegSplitter::new(1024);
        let mut stream = b"--boundary\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        stream.extend(jpeg(1));
        stream.extend(b"\r\n--boundary\r\n");
        stream.extend(jpeg(2));

        let (a, b) = stream.split_at(9);
        splitter.push(a);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(b);
        assert_eq!(splitter.next_frame(), Some(jpeg(1)));
        assert_eq!(splitter.next_frame(), Some(jpeg(2)));
        assert_eq!(splitter.next_frame(), None);
    }

    #[test]
    fn truncated_frame_is_dropped() {
        let mut splitter = JpegSplitter::new(1024);
        splitter.push(&[0xFF, 0xD8, 7, 7, 7]);
        splitter.push(&jpeg(3));
        assert_eq!(splitter.next_frame(), Some(jpeg(3)));
    }

    #[test]
    fn exif_thumbnail_stays_inside_its_frame() {
        let mut app1 = vec![0xFF, 0xE1, 0x00, 0x0E];
        app1.extend(b"Exif\0\0");
        app1.extend(jpeg(9));
        let mut frame = vec![0xFF, 0xD8];
        frame.extend(&app1);
        frame.extend([0xFF, 0xDA, 0x00, 0x02, 5, 5, 0xFF, 0xD9]);

        let mut splitter = JpegSplitter::new(1024);
        let (a, b) = frame.split_at(7);
        splitter.push(a);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(b);
        splitter.push(&jpeg(4));
        assert_eq!(splitter.next_frame(), Some(frame));
        assert_eq!(splitter.next_frame(), Some(jpeg(4)));
    }

    #[test]
    fn oversized_garbage_is_discarded() {
        let mut splitter = JpegSplitter::new(8);
        splitter.push(&[0xFF, 0xD8]);
        splitter.push(&[0u8; 32]);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(&jpeg(4));
        assert_eq!(splitter.next_frame(), Some(jpeg(4)));
    }
}
