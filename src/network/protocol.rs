//! Control channel wire protocol
//!
//! Every message on the control socket is one envelope:
//!
//! ```text
//! [u8 kind][u32 request_id LE][u32 len LE][len bytes JSON body]
//! ```
//!
//! Requests carry a [`ControlCall`], responses a [`ControlReply`] with the
//! same `request_id`, and notifications a [`PropertyChanged`] with
//! `request_id` 0. The daemon writes every notification produced while
//! serving a call before that call's response.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorCode, SensorError, SensorResult};
use crate::sensor::catalog::DataRange;
use crate::sensor::frame::SensorType;
use crate::sensor::session::{PropertyChanged, SessionId, SessionState};

/// Envelope header length in bytes.
pub const HEADER_SIZE: usize = 9;

/// Default upper bound on a single envelope body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Client call
    Request = 0,
    /// Reply to the call with the same request id
    Response = 1,
    /// Unsolicited `PropertyChanged`
    Notification = 2,
}

impl MessageKind {
    /// Kind for a header byte, if it is known.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Response),
            2 => Some(MessageKind::Notification),
            _ => None,
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// One control channel message: `[kind][request_id][len][JSON body]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type
    pub kind: MessageKind,
    /// Correlates a response with its request; 0 for notifications
    pub request_id: u32,
    /// JSON body
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Envelope around an already encoded body.
    pub fn new(kind: MessageKind, request_id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            request_id,
            payload,
        }
    }

    /// Request envelope for `call`.
    pub fn request(request_id: u32, call: &ControlCall) -> SensorResult<Self> {
        Ok(Self::new(MessageKind::Request, request_id, to_json(call)?))
    }

    /// Response envelope for `reply`.
    pub fn response(request_id: u32, reply: &ControlReply) -> SensorResult<Self> {
        Ok(Self::new(MessageKind::Response, request_id, to_json(reply)?))
    }

    /// Notification envelope for `event`.
    pub fn notification(event: &PropertyChanged) -> SensorResult<Self> {
        Ok(Self::new(MessageKind::Notification, 0, to_json(event)?))
    }

    /// Deserialize the JSON body.
    pub fn body<T: DeserializeOwned>(&self) -> SensorResult<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| SensorError::Protocol(format!("malformed {:?} body: {e}", self.kind)))
    }

    /// Header plus body, ready for the socket.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());

        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Parse one complete envelope.
    pub fn decode(data: &[u8]) -> Result<Self, String> {
        if data.len() < HEADER_SIZE {
            return Err("Insufficient data for Envelope".to_string());
        }

        let kind = MessageKind::from_u8(data[0]).ok_or_else(|| "Invalid message kind".to_string())?;
        let request_id = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let payload_len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;

        if data.len() != HEADER_SIZE + payload_len {
            return Err("Payload size mismatch".to_string());
        }

        Ok(Envelope {
            kind,
            request_id,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> SensorResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SensorError::Protocol(e.to_string()))
}

/// Read one envelope. Returns `Ok(None)` on a clean end of stream.
pub async fn read_envelope<R>(reader: &mut R, max_message_size: usize) -> SensorResult<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..]).await?;

    let kind = MessageKind::from_u8(header[0])
        .ok_or_else(|| SensorError::Protocol(format!("unknown message kind {}", header[0])))?;
    let request_id = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > max_message_size {
        return Err(SensorError::Protocol(format!(
            "message of {len} bytes exceeds the {max_message_size}-byte limit"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Envelope::new(kind, request_id, payload)))
}

/// Write one envelope and flush.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> SensorResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&envelope.encode()).await?;
    writer.flush().await?;
    Ok(())
}

// =============================================================================
// Calls and replies
// =============================================================================

/// Every operation a client can invoke on the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ControlCall {
    /// Registered sensors
    ListSensors,
    /// Open a session on `sensor`
    Open { sensor: String },
    /// Release a session
    Release { session_id: SessionId },
    /// Start sampling
    Start { session_id: SessionId },
    /// Stop sampling
    Stop { session_id: SessionId },
    /// Session state and sensor description
    Describe { session_id: SessionId },

    /// Requested interval
    Interval { session_id: SessionId },
    /// Request an interval; 0 clears
    SetInterval { session_id: SessionId, value: u32 },
    /// Requested standby override
    StandbyOverride { session_id: SessionId },
    /// Request standby override
    SetStandbyOverride { session_id: SessionId, value: bool },
    /// Buffer interval in effect
    BufferInterval { session_id: SessionId },
    /// Request a buffer interval; 0 clears
    SetBufferInterval { session_id: SessionId, value: u32 },
    /// Buffer size in effect
    BufferSize { session_id: SessionId },
    /// Request a buffer size; 0 clears
    SetBufferSize { session_id: SessionId, value: u32 },
    /// Downsampling flag
    Downsampling { session_id: SessionId },
    /// Set the downsampling flag
    SetDownsampling { session_id: SessionId, value: bool },

    /// Push the catalog data range at `index`
    SetDataRangeIndex { session_id: SessionId, index: usize },
    /// Push a data range matching a catalog entry
    RequestDataRange { session_id: SessionId, range: DataRange },
    /// Pop the newest data range request
    RemoveDataRangeRequest { session_id: SessionId },
    /// Data range in effect for the session
    CurrentDataRange { session_id: SessionId },

    /// Catalog intervals
    AvailableIntervals { session_id: SessionId },
    /// Catalog data ranges
    AvailableDataRanges { session_id: SessionId },
    /// Catalog buffer intervals
    AvailableBufferIntervals { session_id: SessionId },
    /// Catalog buffer sizes
    AvailableBufferSizes { session_id: SessionId },

    /// Daemon-side error state, including unacknowledged overflow
    Error { session_id: SessionId },
    /// Effective configuration of the session's sensor
    Effective { session_id: SessionId },
}

impl ControlCall {
    /// Session targeted by the call, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ControlCall::ListSensors | ControlCall::Open { .. } => None,
            ControlCall::Release { session_id }
            | ControlCall::Start { session_id }
            | ControlCall::Stop { session_id }
            | ControlCall::Describe { session_id }
            | ControlCall::Interval { session_id }
            | ControlCall::SetInterval { session_id, .. }
            | ControlCall::StandbyOverride { session_id }
            | ControlCall::SetStandbyOverride { session_id, .. }
            | ControlCall::BufferInterval { session_id }
            | ControlCall::SetBufferInterval { session_id, .. }
            | ControlCall::BufferSize { session_id }
            | ControlCall::SetBufferSize { session_id, .. }
            | ControlCall::Downsampling { session_id }
            | ControlCall::SetDownsampling { session_id, .. }
            | ControlCall::SetDataRangeIndex { session_id, .. }
            | ControlCall::RequestDataRange { session_id, .. }
            | ControlCall::RemoveDataRangeRequest { session_id }
            | ControlCall::CurrentDataRange { session_id }
            | ControlCall::AvailableIntervals { session_id }
            | ControlCall::AvailableDataRanges { session_id }
            | ControlCall::AvailableBufferIntervals { session_id }
            | ControlCall::AvailableBufferSizes { session_id }
            | ControlCall::Error { session_id }
            | ControlCall::Effective { session_id } => Some(*session_id),
        }
    }

    /// Whether a successful call clears the session's error state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ControlCall::Open { .. }
                | ControlCall::Release { .. }
                | ControlCall::Start { .. }
                | ControlCall::Stop { .. }
                | ControlCall::SetInterval { .. }
                | ControlCall::SetStandbyOverride { .. }
                | ControlCall::SetBufferInterval { .. }
                | ControlCall::SetBufferSize { .. }
                | ControlCall::SetDownsampling { .. }
                | ControlCall::SetDataRangeIndex { .. }
                | ControlCall::RequestDataRange { .. }
                | ControlCall::RemoveDataRangeRequest { .. }
        )
    }
}

/// Error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Error category
    pub code: ErrorCode,
    /// Human readable detail
    pub message: String,
}

impl From<&SensorError> for WireError {
    fn from(err: &SensorError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl WireError {
    /// Rebuild the error on the client side.
    pub fn into_error(self) -> SensorError {
        SensorError::from_wire(self.code, self.message)
    }
}

/// Outcome of one [`ControlCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReply {
    /// Call succeeded with this value
    Ok(serde_json::Value),
    /// Call failed
    Err(WireError),
}

impl ControlReply {
    /// Reply for the outcome of a call.
    pub fn from_result<T: Serialize>(result: SensorResult<T>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(value) => ControlReply::Ok(value),
                Err(e) => ControlReply::Err(WireError::from(&SensorError::Protocol(e.to_string()))),
            },
            Err(err) => ControlReply::Err(WireError::from(&err)),
        }
    }

    /// Decode the reply as `T`, or the carried error.
    pub fn into_result<T: DeserializeOwned>(self) -> SensorResult<T> {
        match self {
            ControlReply::Ok(value) => serde_json::from_value(value)
                .map_err(|e| SensorError::Protocol(format!("unexpected reply shape: {e}"))),
            ControlReply::Err(err) => Err(err.into_error()),
        }
    }
}

// =============================================================================
// Reply payloads
// =============================================================================

/// Static description of a registered sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorInfo {
    /// Sensor id from the configuration
    pub id: String,
    /// Type of the sensor
    pub sensor_type: SensorType,
    /// Human readable description
    pub description: String,
    /// Whether the device buffers samples itself
    pub hw_buffering: bool,
    /// Bytes per record on the data channel
    pub frame_size: usize,
}

/// Reply to [`ControlCall::Open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReply {
    /// New session id
    pub session_id: SessionId,
    /// Sensor the session is bound to
    pub sensor: SensorInfo,
    /// Unix socket carrying this session's samples
    pub data_socket: PathBuf,
}

/// Reply to [`ControlCall::Describe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id
    pub session_id: SessionId,
    /// Sensor the session is bound to
    pub sensor: SensorInfo,
    /// Lifecycle state
    pub state: SessionState,
}
