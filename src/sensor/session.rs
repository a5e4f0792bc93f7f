//! Per-session data model
//!
//! A `Session` is plain data: what the client asked for, where it sits in
//! its lifecycle and the last error it saw. It is cloned, mutated and only
//! committed back by the owning [`SensorChannel`](crate::sensor::SensorChannel)
//! once the mutation has been validated and arbitrated, so a failing call
//! never leaves a half-applied request behind.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorState;

/// Session identifier, unique among open sessions.
pub type SessionId = i32;

/// Lifecycle of a session. `Released` is not represented: a released
/// session no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Opened, not yet started
    Created,
    /// Sampling and taking part in arbitration
    Running,
    /// Stopped; requests are kept
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Values a session has asked for. `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Requested sampling interval in milliseconds
    pub interval: Option<u32>,
    /// Stack of requested data-range catalog indices, newest last
    pub data_ranges: Vec<usize>,
    /// Recency stamp of the last push/pop on `data_ranges`
    pub range_stamp: u64,
    /// Requested buffer interval in ms
    pub buffer_interval: Option<u32>,
    /// Requested queue capacity in samples
    pub buffer_size: Option<u32>,
    /// Decimate instead of reporting overflow
    pub downsampling: bool,
    /// Keep the device sampling through standby
    pub standby_override: bool,
}

impl SessionRequest {
    /// Top of the data-range stack.
    pub fn active_range(&self) -> Option<usize> {
        self.data_ranges.last().copied()
    }
}

/// A client's handle to one sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Sensor id
    pub sensor: String,
    /// Connection that owns the session
    pub client_id: String,
    /// Lifecycle state
    pub state: SessionState,
    /// Requested values
    pub request: SessionRequest,
    /// Last error
    pub error: ErrorState,
    /// Open time in ms since the Unix epoch
    pub created_at: u64,
}

impl Session {
    /// Created session with no requests.
    pub fn new(id: SessionId, sensor: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            id,
            sensor: sensor.into(),
            client_id: client_id.into(),
            state: SessionState::Created,
            request: SessionRequest::default(),
            error: ErrorState::default(),
            created_at: Utc::now().timestamp_millis() as u64,
        }
    }

    /// Whether the session takes part in arbitration.
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }
}

/// Effective properties that are broadcast when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Property {
    /// Effective sampling interval
    Interval,
    /// Effective data range
    DataRange,
    /// Effective standby override
    StandbyOverride,
}

impl Property {
    /// Property name as clients know it.
    pub fn name(self) -> &'static str {
        match self {
            Property::Interval => "interval",
            Property::DataRange => "dataRange",
            Property::StandbyOverride => "standbyOverride",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `propertyChanged(name)` addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChanged {
    /// Session being notified
    pub session_id: SessionId,
    /// Property that changed
    pub property: Property,
}
