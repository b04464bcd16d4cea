//! Newline-delimited JSON wire protocol shared by device and viewer connections.
//!
//! Every message is a single JSON object on one line, tagged by `"type"`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};

use crate::error::IngestError;
use crate::registry::DeviceMetadata;

/// Messages sent by clients (cameras and viewers).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        #[serde(default)]
        device_id: Option<String>,
        #[serde(default)]
        device_info: serde_json::Map<String, serde_json::Value>,
    },
    Unregister {
        device_id: String,
    },
    StartStream {
        device_id: String,
    },
    StopStream {
        device_id: String,
    },
    Frame {
        device_id: String,
        /// Base64 image, optionally as a `data:image/...;base64,` URL.
        frame_data: String,
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
    JoinViewers,
    LeaveViewers,
    GetStats,
    SetMotionDetection {
        enabled: bool,
    },
}

/// Messages sent by the hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionResponse {
        status: String,
        server_time_ms: u64,
        message: String,
    },
    RegistrationResult {
        success: bool,
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    UnregistrationResult {
        success: bool,
        device_id: String,
    },
    StreamResult {
        success: bool,
        streaming: bool,
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    FrameError {
        device_id: String,
        reason: String,
    },
    JoinedViewers {
        message: String,
    },
    LeftViewers,
    Stats(StatsSnapshot),
    MotionDetection {
        enabled: bool,
    },
    MotionAlert(MotionAlertEvent),
    Error {
        reason: String,
    },
}

/// Alert notification pushed to the viewers group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionAlertEvent {
    pub device_id: String,
    pub timestamp_ms: u64,
    pub area_count: usize,
    pub motion_fraction: f32,
    /// Persistence id; `None` when storage failed or did not answer in time.
    pub alert_id: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_devices: u64,
    pub active_devices: usize,
    pub active_streams: usize,
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub motion_alerts: u64,
    pub reference_frames: u64,
    pub detection_faults: u64,
    pub viewers: usize,
    /// Broadcasts dropped because a subscriber queue was full.
    pub broadcasts_dropped: u64,
    /// Decoded frames currently held in frame slots.
    pub buffered_frame_bytes: usize,
    pub motion_detection: bool,
    pub devices: Vec<DeviceSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub origin: String,
    pub connected_at_ms: u64,
    pub metadata: DeviceMetadata,
    pub streaming: bool,
    pub frame_count: u64,
    pub last_frame_at_ms: Option<u64>,
}

/// Strip an optional `data:<mime>;base64,` header.
pub fn strip_data_url(frame_data: &str) -> &str {
    if frame_data.starts_with("data:") {
        if let Some((_, payload)) = frame_data.split_once(',') {
            return payload;
        }
    }
    frame_data
}

/// Decode a base64 frame payload, refusing payloads whose decoded size would
/// exceed `max_bytes` before allocating for them.
pub fn decode_frame_data(frame_data: &str, max_bytes: usize) -> Result<Vec<u8>, IngestError> {
    let payload = strip_data_url(frame_data).trim();
    let estimated = payload.len() / 4 * 3;
    if estimated > max_bytes.saturating_add(3) {
        return Err(IngestError::TooLarge {
            size: estimated,
            limit: max_bytes,
        });
    }
    STANDARD
        .decode(payload)
        .map_err(|e| IngestError::DecodeError(format!("invalid base64: {}", e)))
}

pub fn encode_frame_data(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Largest line accepted for a given frame limit: base64 expansion plus
/// room for the JSON envelope.
pub fn max_line_bytes(max_frame_bytes: usize) -> usize {
    max_frame_bytes
        .saturating_mul(4)
        .saturating_div(3)
        .saturating_add(64 * 1024)
}

#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(Vec<u8>),
    /// A line exceeded the limit; it has been consumed and discarded.
    TooLong(usize),
    Eof,
}

/// Reads newline-terminated lines with a hard cap on buffered bytes.
///
/// Partial lines survive read timeouts, so the caller may retry after
/// `WouldBlock`/`TimedOut` without losing data.
pub struct LineReader<R> {
    inner: R,
    limit: usize,
    buf: Vec<u8>,
    discarding: Option<usize>,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            limit,
            buf: Vec::new(),
            discarding: None,
        }
    }

    pub fn read_line(&mut self) -> io::Result<LineRead> {
        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                if let Some(skipped) = self.discarding.take() {
                    return Ok(LineRead::TooLong(skipped));
                }
                if self.buf.is_empty() {
                    return Ok(LineRead::Eof);
                }
                return Ok(LineRead::Line(std::mem::take(&mut self.buf)));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let take = newline.map(|i| i + 1).unwrap_or(available.len());
            let chunk = &available[..newline.unwrap_or(available.len())];

            if let Some(skipped) = self.discarding.as_mut() {
                *skipped += take;
            } else if self.buf.len() + chunk.len() > self.limit {
                self.discarding = Some(self.buf.len() + take);
                self.buf = Vec::new();
            } else {
                self.buf.extend_from_slice(chunk);
            }
            self.inner.consume(take);

            if newline.is_some() {
                if let Some(skipped) = self.discarding.take() {
                    return Ok(LineRead::TooLong(skipped));
                }
                let mut line = std::mem::take(&mut self.buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(LineRead::Line(line));
            }
        }
    }
}

pub fn write_message<W: Write>(writer: &mut W, message: &ServerMessage) -> io::Result<()> {
    let mut line = serde_json::to_vec(message).map_err(io::Error::from)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}
