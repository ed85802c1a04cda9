use bytes::{Buf, Bytes, BytesMut};
use edge_viewer_common::frame::RawFrame;
use futures_util::StreamExt;
use image::ImageFormat;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{CaptureBridge, CaptureError};

const HEADER_END: &[u8] = b"\r\n\r\n";
const DEFAULT_BOUNDARY: &str = "frame";

/// Parse state for a multipart/x-mixed-replace body.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Part announced its size; wait for exactly that many bytes.
    CollectingSized(usize),
    /// No Content-Length: collect until the next boundary marker.
    /// `scanned` is how far the buffer has already been searched.
    CollectingUnsized { scanned: usize },
}

/// Incremental splitter for MJPEG streams.
///
/// Feed it arbitrary chunks of the response body; it returns every part
/// body that became complete. Parts with a `Content-Length` header are cut
/// by length; others end at the next boundary marker.
pub struct MultipartSplitter {
    marker: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
}

impl MultipartSplitter {
    pub fn new(boundary: &str) -> Self {
        Self {
            marker: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        self.buffer.advance(pos + self.marker.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the marker spans chunks.
                        let keep = self.marker.len() - 1;
                        if self.buffer.len() > keep {
                            let excess = self.buffer.len() - keep;
                            self.buffer.advance(excess);
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let Some(pos) = find_subsequence(&self.buffer, HEADER_END) else {
                        break;
                    };
                    let length = content_length(&self.buffer[..pos]);
                    self.buffer.advance(pos + HEADER_END.len());
                    self.state = match length {
                        Some(n) => ParseState::CollectingSized(n),
                        None => ParseState::CollectingUnsized { scanned: 0 },
                    };
                }
                ParseState::CollectingSized(n) => {
                    if self.buffer.len() < n {
                        break;
                    }
                    let body = self.buffer.split_to(n).freeze();
                    if !body.is_empty() {
                        parts.push(body);
                    }
                    // The trailing CRLF is skipped while seeking the next marker.
                    self.state = ParseState::SeekingBoundary;
                }
                ParseState::CollectingUnsized { scanned } => {
                    let Some(pos) = find_subsequence(&self.buffer[scanned..], &self.marker) else {
                        self.state = ParseState::CollectingUnsized {
                            scanned: self.buffer.len().saturating_sub(self.marker.len()),
                        };
                        break;
                    };
                    let body_end = scanned + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..body_end].ends_with(b"\r\n") {
                        body_end - 2
                    } else {
                        body_end
                    };
                    let body = Bytes::copy_from_slice(&self.buffer[..end]);
                    self.buffer.advance(body_end + self.marker.len());
                    if !body.is_empty() {
                        parts.push(body);
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }
}

/// Pull an upstream MJPEG stream and feed its frames into the bridge.
/// Reconnects with exponential backoff on failure until shutdown.
pub async fn run_mjpeg_source(
    url: String,
    bridge: Arc<CaptureBridge>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url, "connecting to upstream MJPEG stream");
        tokio::select! {
            result = consume_stream(&url, &bridge) => match result {
                Ok(()) => {
                    info!("upstream stream ended cleanly, reconnecting");
                    backoff = Duration::from_secs(2);
                }
                Err(e) => {
                    error!(error = %e, "upstream stream error, reconnecting in {:?}", backoff);
                }
            },
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(max_backoff);
    }
    info!("MJPEG capture source stopped");
}

async fn consume_stream(url: &str, bridge: &CaptureBridge) -> Result<(), CaptureError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(CaptureError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(CaptureError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(CaptureError::HttpStatus(response.status().as_u16()));
    }

    let boundary = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(boundary_from_content_type)
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

    info!(status = %response.status(), boundary, "connected to upstream MJPEG stream");

    let mut splitter = MultipartSplitter::new(&boundary);
    let mut byte_stream = response.bytes_stream();
    let mut parts: u64 = 0;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(CaptureError::HttpStream)?;
        for jpeg in splitter.push(&chunk) {
            parts += 1;
            match decode_luma(&jpeg) {
                Ok(frame) => {
                    bridge.on_raw_frame(frame);
                }
                Err(e) => warn!(error = %e, bytes = jpeg.len(), "skipping undecodable part"),
            }
            if parts % 100 == 0 {
                debug!(parts, "upstream parts received");
            }
        }
    }

    Ok(())
}

/// Decode a JPEG into the luma plane the processor consumes.
pub fn decode_luma(jpeg: &[u8]) -> Result<RawFrame, CaptureError> {
    let img = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map_err(|e| CaptureError::Decode(e.to_string()))?
        .to_luma8();
    let (width, height) = img.dimensions();
    Ok(RawFrame::new(width, height, img.into_raw())?)
}

/// Extract `boundary` from a `multipart/x-mixed-replace; boundary=...` value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .map(|b| b.strip_prefix("--").unwrap_or(b).to_string())
        .filter(|b| !b.is_empty())
}

fn content_length(headers: &[u8]) -> Option<usize> {
    std::str::from_utf8(headers)
        .ok()?
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
