//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// No Bluetooth adapter or serial subsystem is usable
    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// No device matched the selector, or it refused the link
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Writing to the link failed
    #[error("Link write failed: {0}")]
    LinkWrite(String),

    /// Nothing arrived before the read deadline
    #[error("Timeout waiting for link data after {0}ms")]
    LinkTimeout(u64),

    /// The link is gone (peer closed, cancelled, or I/O failure)
    #[error("Link closed: {0}")]
    LinkClosed(String),

    /// Frame bytes could not be parsed
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Fewer bytes than the frame requires arrived before the deadline
    #[error("Incomplete frame: {0}")]
    IncompleteFrame(String),

    /// Request does not fit in a single frame of the protocol
    #[error("Payload of {size} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// Adapter reported that no ECU answered
    #[error("No data returned by the vehicle")]
    NoData,

    /// Every negotiation candidate failed
    #[error("No protocol matched after probing {tried} candidate(s)")]
    NoProtocolMatched { tried: usize },

    /// Retries exhausted without a usable reply
    #[error("Request {mode:02X} timed out after {attempts} attempt(s)")]
    RequestTimeout { mode: u8, attempts: u32 },

    /// Reply stayed corrupt after the re-send
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// A request is already in flight
    #[error("Session busy: a request is already in flight")]
    SessionBusy,

    /// VIN payload is not 17 printable characters
    #[error("Malformed VIN: {0}")]
    MalformedVin(String),

    /// ECU answered with a negative response (7F)
    #[error("Negative response to mode {mode:02X}: NRC {nrc:02X}")]
    NegativeResponse { mode: u8, nrc: u8 },

    /// Service would modify vehicle state
    #[error("Mode {0:02X} is not a read-only diagnostic service")]
    ModeNotAllowed(u8),

    /// Configuration cannot be used to open a session
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not valid in the current session state
    #[error("Operation `{operation}` not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl ObdError {
    /// Stable machine-readable code for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            ObdError::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            ObdError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            ObdError::LinkWrite(_) => "LINK_WRITE",
            ObdError::LinkTimeout(_) => "LINK_TIMEOUT",
            ObdError::LinkClosed(_) => "LINK_CLOSED",
            ObdError::MalformedFrame(_) => "MALFORMED_FRAME",
            ObdError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            ObdError::IncompleteFrame(_) => "INCOMPLETE_FRAME",
            ObdError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ObdError::NoData => "NO_DATA",
            ObdError::NoProtocolMatched { .. } => "NO_PROTOCOL_MATCHED",
            ObdError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            ObdError::ProtocolDecode(_) => "PROTOCOL_DECODE",
            ObdError::SessionBusy => "SESSION_BUSY",
            ObdError::MalformedVin(_) => "MALFORMED_VIN",
            ObdError::NegativeResponse { .. } => "NEGATIVE_RESPONSE",
            ObdError::ModeNotAllowed(_) => "MODE_NOT_ALLOWED",
            ObdError::InvalidConfig(_) => "INVALID_CONFIG",
            ObdError::InvalidState { .. } => "INVALID_STATE",
        }
    }

    /// Transient condition worth re-sending the same frame for
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ObdError::LinkTimeout(_) | ObdError::IncompleteFrame(_) | ObdError::NoData
        )
    }

    /// Data arrived but was corrupt (gets a single re-send)
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ObdError::ChecksumMismatch { .. } | ObdError::MalformedFrame(_)
        )
    }

    /// The channel can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, ObdError::LinkClosed(_) | ObdError::LinkWrite(_))
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ObdError::LinkTimeout(0),
            ErrorKind::NotFound => ObdError::DeviceNotFound(err.to_string()),
            _ => ObdError::LinkClosed(err.to_string()),
        }
    }
}
