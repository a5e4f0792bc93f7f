//! Custom error types for the daemon and client library.
//!
//! This module defines the primary error type, `SensorError`, shared by the
//! control channel, the data channel and the session manager. Using the
//! `thiserror` crate, it provides a centralized and consistent way to report
//! failures to the session that caused them.
//!
//! ## Error Hierarchy
//!
//! `SensorError` consolidates the failure classes a client can observe:
//!
//! - **`InvalidSession`**: The session id is not (or no longer) open.
//! - **`NotFound`**: `open()` named a sensor the daemon does not know.
//! - **`InvalidParameter`**: A requested value lies outside every advertised
//!   capability entry. Rejected at the control boundary, so it never reaches
//!   arbitration.
//! - **`ResourceExhausted`**: The daemon-wide session cap is reached.
//! - **`Overflow`**: A session's data queue exceeded `bufferSize` while
//!   downsampling was disabled.
//! - **`ChannelClosed`**: The control channel, data channel or the physical
//!   device went away.
//! - **`Protocol`**, **`Io`**, **`Config`**: transport and startup failures.
//!
//! Each variant carries a stable numeric [`ErrorCode`] which is what travels
//! on the wire and what `errorCodeInt` reports to clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the sensor error type.
pub type SensorResult<T> = std::result::Result<T, SensorError>;

/// Failures reported by the daemon and the client library.
#[derive(Error, Debug)]
pub enum SensorError {
    /// Operation on a session id that is not open
    #[error("Invalid session: {0}")]
    InvalidSession(i32),

    /// Unknown sensor name
    #[error("Sensor not found: {0}")]
    NotFound(String),

    /// Value outside every advertised catalog entry
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Session or buffer limit reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Samples rejected because the session queue was full
    #[error("Buffer overflow: {dropped} samples rejected")]
    Overflow { dropped: u32 },

    /// Control channel, data channel or device went away
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Malformed control or data frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

/// Numeric error codes exposed through `errorCode` / `errorCodeInt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error recorded on the session
    #[default]
    None = 0,
    /// `SensorError::InvalidSession`
    InvalidSession = 1,
    /// `SensorError::NotFound`
    NotFound = 2,
    /// `SensorError::InvalidParameter`
    InvalidParameter = 3,
    /// `SensorError::ResourceExhausted`
    ResourceExhausted = 4,
    /// `SensorError::Overflow`
    Overflow = 5,
    /// `SensorError::ChannelClosed`
    ChannelClosed = 6,
    /// `SensorError::Protocol`
    Protocol = 7,
    /// `SensorError::Io` and `SensorError::Config`
    Io = 8,
}

impl ErrorCode {
    /// Code for a numeric value, if it is known.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::None),
            1 => Some(ErrorCode::InvalidSession),
            2 => Some(ErrorCode::NotFound),
            3 => Some(ErrorCode::InvalidParameter),
            4 => Some(ErrorCode::ResourceExhausted),
            5 => Some(ErrorCode::Overflow),
            6 => Some(ErrorCode::ChannelClosed),
            7 => Some(ErrorCode::Protocol),
            8 => Some(ErrorCode::Io),
            _ => None,
        }
    }
}

impl SensorError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SensorError::InvalidSession(_) => ErrorCode::InvalidSession,
            SensorError::NotFound(_) => ErrorCode::NotFound,
            SensorError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            SensorError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            SensorError::Overflow { .. } => ErrorCode::Overflow,
            SensorError::ChannelClosed(_) => ErrorCode::ChannelClosed,
            SensorError::Protocol(_) => ErrorCode::Protocol,
            // Config errors only happen at startup, before any client exists.
            SensorError::Io(_) | SensorError::Config(_) => ErrorCode::Io,
        }
    }

    /// Rebuild an error received over the wire.
    ///
    /// The original payload (session id, dropped count) is not carried, only
    /// the code and the rendered message, so variants with structured data
    /// are reconstructed with placeholder values and the message preserved
    /// where possible.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::InvalidSession => SensorError::InvalidSession(-1),
            ErrorCode::NotFound => SensorError::NotFound(message),
            ErrorCode::InvalidParameter => SensorError::InvalidParameter(message),
            ErrorCode::ResourceExhausted => SensorError::ResourceExhausted(message),
            ErrorCode::Overflow => SensorError::Overflow { dropped: 0 },
            ErrorCode::ChannelClosed => SensorError::ChannelClosed(message),
            ErrorCode::Io => {
                SensorError::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
            }
            ErrorCode::Protocol | ErrorCode::None => SensorError::Protocol(message),
        }
    }

    /// Whether the error means the session object can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SensorError::InvalidSession(_) | SensorError::ChannelClosed(_) | SensorError::Io(_)
        )
    }
}

/// Last error recorded on a session, cleared by the next successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorState {
    /// Error category
    pub code: ErrorCode,
    /// Human readable detail
    pub message: String,
}

impl ErrorState {
    /// Record `err` as the last error.
    pub fn set(&mut self, err: &SensorError) {
        self.code = err.code();
        self.message = err.to_string();
    }

    /// Reset to `ErrorCode::None`.
    pub fn clear(&mut self) {
        self.code = ErrorCode::None;
        self.message.clear();
    }

    /// Whether an error is recorded.
    pub fn is_set(&self) -> bool {
        self.code != ErrorCode::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SensorError::InvalidSession(3).code() as i32, 1);
        assert_eq!(SensorError::Overflow { dropped: 2 }.code() as i32, 5);
        assert_eq!(ErrorCode::from_i32(6), Some(ErrorCode::ChannelClosed));
        assert_eq!(ErrorCode::from_i32(42), None);
    }

    #[test]
    fn error_state_set_and_clear() {
        let mut state = ErrorState::default();
        assert!(!state.is_set());

        state.set(&SensorError::InvalidParameter("interval 3".into()));
        assert_eq!(state.code, ErrorCode::InvalidParameter);
        assert!(state.message.contains("interval 3"));

        state.clear();
        assert!(!state.is_set());
        assert!(state.message.is_empty());
    }

    #[test]
    fn wire_round_trip_keeps_message() {
        let err = SensorError::from_wire(ErrorCode::NotFound, "gyro".into());
        match err {
            SensorError::NotFound(name) => assert_eq!(name, "gyro"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
