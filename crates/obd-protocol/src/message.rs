//! Diagnostic request and response messages

use serde::{Deserialize, Serialize};

use crate::error::ObdError;
use crate::mode;
use crate::protocol::ProtocolId;

/// A diagnostic query sent to the vehicle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRequest {
    /// Service (mode) byte
    pub mode: u8,
    /// Parameter id, present for modes that take one
    pub pid: Option<u8>,
    /// Extra bytes after the PID (e.g. freeze frame number)
    pub payload: Vec<u8>,
}

impl DiagnosticRequest {
    /// Create a request with no extra payload
    pub fn new(mode: u8, pid: Option<u8>) -> Self {
        Self {
            mode,
            pid,
            payload: Vec::new(),
        }
    }

    /// Mode 01 request for a current-data PID
    pub fn current_data(pid: u8) -> Self {
        Self::new(mode::CURRENT_DATA, Some(pid))
    }

    /// Mode 01 PID 00, the probe every compliant ECU answers
    pub fn supported_pids_probe() -> Self {
        Self::current_data(0x00)
    }

    /// Mode 03 stored trouble codes
    pub fn stored_dtcs() -> Self {
        Self::new(mode::READ_DTC, None)
    }

    /// Mode 07 pending trouble codes
    pub fn pending_dtcs() -> Self {
        Self::new(mode::PENDING_DTC, None)
    }

    /// Mode 09 vehicle information item
    pub fn vehicle_info(pid: u8) -> Self {
        Self::new(mode::VEHICLE_INFO, Some(pid))
    }

    /// Attach extra payload bytes
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Diagnostic bytes as they appear inside a frame: mode, pid, payload
    pub fn data_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + self.payload.len());
        data.push(self.mode);
        if let Some(pid) = self.pid {
            data.push(pid);
        }
        data.extend_from_slice(&self.payload);
        data
    }

    /// Check that the PID presence agrees with the mode
    pub fn validate(&self) -> Result<(), ObdError> {
        match (mode::has_pid(self.mode), self.pid) {
            (true, None) => Err(ObdError::MalformedFrame(format!(
                "mode {:02X} requires a PID",
                self.mode
            ))),
            (false, Some(pid)) => Err(ObdError::MalformedFrame(format!(
                "mode {:02X} takes no PID (got {pid:02X})",
                self.mode
            ))),
            _ => Ok(()),
        }
    }

    /// Mode byte a positive reply carries
    pub fn expected_response_mode(&self) -> u8 {
        self.mode | mode::RESPONSE_OFFSET
    }
}

/// Where a decoded response came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Protocol the frames were decoded under
    pub protocol: ProtocolId,
    /// Header of the first frame
    pub header: Vec<u8>,
    /// Responding node (ECU address, or CAN identifier)
    pub source: u32,
    /// Frames that made up this response
    pub frame_count: usize,
}

/// A decoded reply from one ECU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticResponse {
    /// Mode byte as received (request mode + 0x40 for a positive reply)
    pub mode: u8,
    /// PID echo, for modes that carry one
    pub pid: Option<u8>,
    /// Data after mode and PID, concatenated across frames
    pub payload: Vec<u8>,
    /// Source frame metadata
    pub meta: FrameMeta,
}

impl DiagnosticResponse {
    /// Whether this is a 7F negative reply
    pub fn is_negative(&self) -> bool {
        self.mode == mode::NEGATIVE_RESPONSE
    }

    /// Whether this reply belongs to `request`, positive or negative
    pub fn is_reply_to(&self, request: &DiagnosticRequest) -> bool {
        if self.is_negative() {
            return self.payload.first() == Some(&request.mode);
        }
        self.mode == request.expected_response_mode() && self.pid == request.pid
    }

    /// Check the reply answers `request`
    pub fn check_answers(&self, request: &DiagnosticRequest) -> Result<(), ObdError> {
        if self.is_negative() {
            let nrc = self.payload.get(1).copied().unwrap_or(0);
            return Err(ObdError::NegativeResponse {
                mode: request.mode,
                nrc,
            });
        }
        if self.mode != request.expected_response_mode() {
            return Err(ObdError::MalformedFrame(format!(
                "expected mode {:02X}, got {:02X}",
                request.expected_response_mode(),
                self.mode
            )));
        }
        if self.pid != request.pid {
            return Err(ObdError::MalformedFrame(format!(
                "PID echo {:?} does not match request {:?}",
                self.pid, request.pid
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(mode: u8, pid: Option<u8>, payload: Vec<u8>) -> DiagnosticResponse {
        DiagnosticResponse {
            mode,
            pid,
            payload,
            meta: FrameMeta {
                protocol: ProtocolId::Iso9141_2,
                header: vec![0x48, 0x6B, 0x10],
                source: 0x10,
                frame_count: 1,
            },
        }
    }

    #[test]
    fn test_data_bytes() {
        let req = DiagnosticRequest::new(0x02, Some(0x0C)).with_payload(vec![0x00]);
        assert_eq!(req.data_bytes(), vec![0x02, 0x0C, 0x00]);
        assert_eq!(DiagnosticRequest::stored_dtcs().data_bytes(), vec![0x03]);
    }

    #[test]
    fn test_validate_pid_presence() {
        assert!(DiagnosticRequest::current_data(0x0C).validate().is_ok());
        assert!(DiagnosticRequest::new(0x01, None).validate().is_err());
        assert!(DiagnosticRequest::new(0x03, Some(0x00)).validate().is_err());
    }

    #[test]
    fn test_check_answers() {
        let req = DiagnosticRequest::current_data(0x0C);
        assert!(response(0x41, Some(0x0C), vec![0x1A, 0x2B]).check_answers(&req).is_ok());
        assert_eq!(
            response(0x41, Some(0x0D), vec![0x00])
                .check_answers(&req)
                .unwrap_err()
                .code(),
            "MALFORMED_FRAME"
        );
        assert_eq!(
            response(0x7F, None, vec![0x01, 0x12]).check_answers(&req),
            Err(ObdError::NegativeResponse {
                mode: 0x01,
                nrc: 0x12
            })
        );
    }

    #[test]
    fn test_is_reply_to() {
        let req = DiagnosticRequest::current_data(0x0D);
        assert!(response(0x41, Some(0x0D), vec![0x3C]).is_reply_to(&req));
        assert!(!response(0x41, Some(0x0C), vec![0x1A, 0xF8]).is_reply_to(&req));
        assert!(!response(0x43, None, vec![0x01, 0x23]).is_reply_to(&req));
        assert!(response(0x7F, None, vec![0x01, 0x12]).is_reply_to(&req));
        assert!(!response(0x7F, None, vec![0x09, 0x12]).is_reply_to(&req));
    }
}
