//! OBD-II Diagnostic Protocol Engine
//!
//! This crate talks to a vehicle through an ELM327-compatible Bluetooth
//! adapter. It negotiates one of the OBD-II bus protocols (SAE J1850,
//! ISO 9141-2, ISO 14230-4, ISO 15765-4), frames requests, parses replies and
//! decodes trouble codes, the VIN and live sensor values.
//!
//! The engine emits `tracing` events but never installs a subscriber.

mod codec;
mod config;
mod decoder;
mod error;
mod message;
mod negotiator;
mod pid;
mod protocol;
mod session;
pub mod transport;

pub use codec::{decode, encode, encode_response};
pub use config::{BudgetSplit, ConnectionConfig, DeviceSelector};
pub use decoder::{
    decode_dtcs, decode_supported_pids, decode_vin, vin_payload, DtcCategory, DtcCode,
    VehicleInfo,
};
pub use error::ObdError;
pub use message::{DiagnosticRequest, DiagnosticResponse, FrameMeta};
pub use negotiator::{negotiate, NegotiationOutcome, ProbeAttempt};
pub use pid::{decode_sensor, Pid, SensorReading};
pub use protocol::{ChecksumKind, FrameLayout, ProtocolFamily, ProtocolId, ProtocolPreference};
pub use session::{open_session, ConnectionState, Session, SessionStats};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ObdError>;

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Oxygen sensor monitoring (non-CAN)
    pub const O2_MONITORING: u8 = 0x05;
    /// On-board monitoring test results
    pub const TEST_RESULTS: u8 = 0x06;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
    /// Negative response service id
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Offset added to the mode in a positive response
    pub const RESPONSE_OFFSET: u8 = 0x40;

    /// Whether requests in this mode carry a PID byte
    pub fn has_pid(mode: u8) -> bool {
        matches!(
            mode,
            CURRENT_DATA | FREEZE_FRAME | O2_MONITORING | TEST_RESULTS | VEHICLE_INFO
        )
    }

    /// Whether the mode only reads data from the vehicle
    pub fn is_read_only(mode: u8) -> bool {
        matches!(
            mode,
            CURRENT_DATA
                | FREEZE_FRAME
                | READ_DTC
                | O2_MONITORING
                | TEST_RESULTS
                | PENDING_DTC
                | VEHICLE_INFO
                | PERMANENT_DTC
        )
    }
}

/// Vehicle information (mode 09) PIDs
pub mod info_pid {
    /// Vehicle identification number
    pub const VIN: u8 = 0x02;
}
