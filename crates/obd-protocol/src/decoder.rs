//! Diagnostic Decoder
//!
//! Pure functions turning response payloads into typed results. Nothing here
//! performs I/O.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ObdError;
use crate::message::DiagnosticResponse;

/// System a trouble code belongs to (top two bits of the first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    /// Letter used in the printed code (P, C, B, U)
    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}

/// A diagnostic trouble code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtcCode {
    /// Category from the top two bits
    pub category: DtcCategory,
    /// Remaining 14 bits, printed as four hex digits
    pub code: u16,
    /// Generic SAE description, when known
    pub description: Option<String>,
}

impl DtcCode {
    /// Decode one 2-byte unit; `None` for the all-zero padding unit
    pub fn from_bytes(high: u8, low: u8) -> Option<Self> {
        if high == 0 && low == 0 {
            return None;
        }
        let category = DtcCategory::from_bits(high >> 6);
        let code = (((high & 0x3F) as u16) << 8) | low as u16;
        let mut dtc = DtcCode {
            category,
            code,
            description: None,
        };
        dtc.description = describe(&dtc.to_string()).map(str::to_string);
        Some(dtc)
    }
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:04X}", self.category.letter(), self.code)
    }
}

/// Vehicle identity read once per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    /// 17-character VIN
    pub vin: String,
    /// Mode 01 PIDs the vehicle reports as supported
    pub supported_pids: BTreeSet<u8>,
}

/// Decode a supported-PID bitmap requested at PID `base`
///
/// Bit 1 (MSB of the first byte) stands for `base + 1`, bit 32 (LSB of the
/// fourth byte) for `base + 32`.
pub fn decode_supported_pids(base: u8, payload: &[u8]) -> Result<BTreeSet<u8>, ObdError> {
    let bitmap: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            ObdError::ProtocolDecode(format!(
                "supported-PID bitmap needs 4 bytes, got {}",
                payload.len()
            ))
        })?;
    let bits = u32::from_be_bytes(bitmap);

    Ok((0..32u16)
        .filter(|&i| bits & (0x8000_0000u32 >> i) != 0)
        .filter_map(|i| u8::try_from(base as u16 + i + 1).ok())
        .collect())
}

/// Decode a trouble-code payload into codes, in payload order
///
/// All-zero units are padding and produce nothing. A trailing odd byte
/// cannot form a code and is ignored.
pub fn decode_dtcs(payload: &[u8]) -> Vec<DtcCode> {
    payload
        .chunks_exact(2)
        .filter_map(|unit| DtcCode::from_bytes(unit[0], unit[1]))
        .collect()
}

/// Decode a VIN payload; must be exactly 17 printable characters
pub fn decode_vin(payload: &[u8]) -> Result<String, ObdError> {
    if payload.len() != 17 {
        return Err(ObdError::MalformedVin(format!(
            "expected 17 characters, got {}",
            payload.len()
        )));
    }
    if let Some(bad) = payload.iter().find(|b| !b.is_ascii_graphic()) {
        return Err(ObdError::MalformedVin(format!(
            "non-printable byte {bad:02X}"
        )));
    }
    Ok(payload.iter().map(|&b| b as char).collect())
}

/// Extract the VIN characters from a mode 09 PID 02 reply
///
/// CAN replies prefix the data with the item count; K-line and J1850 replies
/// split it across five messages, each led by a sequence byte, with the first
/// message zero-padded.
pub fn vin_payload(response: &DiagnosticResponse) -> Vec<u8> {
    let payload = &response.payload;
    let frames = response.meta.frame_count;

    let stripped: Vec<u8> = if response.meta.protocol.is_can() {
        match payload.split_first() {
            Some((&1, rest)) if rest.len() == 17 => rest.to_vec(),
            _ => payload.clone(),
        }
    } else if frames > 1 && payload.len() == frames * 5 {
        payload.chunks_exact(5).flat_map(|m| m[1..].iter().copied()).collect()
    } else {
        payload.clone()
    };

    stripped.into_iter().skip_while(|&b| b == 0).collect()
}

const DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0113", "Intake Air Temperature Circuit High Input"),
    ("P0123", "Throttle Position Sensor Circuit High Input"),
    ("P0128", "Coolant Thermostat Below Regulating Temperature"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0172", "System Too Rich (Bank 1)"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0442", "Evaporative Emission System Leak Detected (small leak)"),
    ("P0455", "Evaporative Emission System Leak Detected (large leak)"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0505", "Idle Control System Malfunction"),
    ("U0100", "Lost Communication With ECM/PCM A"),
];

fn describe(code: &str) -> Option<&'static str> {
    DESCRIPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, d)| *d)
}
