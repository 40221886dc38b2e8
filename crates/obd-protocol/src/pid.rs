//! OBD-II PID Definitions and Sensor Decoding
//!
//! Defines the standard mode 01 Parameter IDs (PIDs) and their decoding formulas.

use serde::{Deserialize, Serialize};

use crate::error::ObdError;

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Supported PIDs 01-20 (0x00)
    SupportedPids01To20 = 0x00,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Intake air temperature (0x0F)
    IntakeAirTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Look up a PID by its hex value
    pub fn from_hex(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_hex() == value)
    }

    /// Every PID this module knows
    pub const ALL: [Pid; 12] = [
        Pid::SupportedPids01To20,
        Pid::EngineLoad,
        Pid::CoolantTemp,
        Pid::ShortFuelTrim,
        Pid::LongFuelTrim,
        Pid::IntakeManifoldPressure,
        Pid::Rpm,
        Pid::Speed,
        Pid::IntakeAirTemp,
        Pid::Maf,
        Pid::ThrottlePosition,
        Pid::O2Voltage,
    ];

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::SupportedPids01To20 => 4,
            Pid::Rpm | Pid::Maf | Pid::O2Voltage => 2,
            _ => 1,
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Pid::SupportedPids01To20 => "Supported PIDs 01-20",
            Pid::EngineLoad => "Engine Load",
            Pid::CoolantTemp => "Coolant Temperature",
            Pid::ShortFuelTrim => "Short Term Fuel Trim (Bank 1)",
            Pid::LongFuelTrim => "Long Term Fuel Trim (Bank 1)",
            Pid::IntakeManifoldPressure => "Intake Manifold Pressure",
            Pid::Rpm => "Engine RPM",
            Pid::Speed => "Vehicle Speed",
            Pid::IntakeAirTemp => "Intake Air Temperature",
            Pid::Maf => "MAF Air Flow Rate",
            Pid::ThrottlePosition => "Throttle Position",
            Pid::O2Voltage => "O2 Sensor Voltage (Bank 1, Sensor 1)",
        }
    }

    /// Engineering unit of the decoded value
    pub fn unit(&self) -> &'static str {
        match self {
            Pid::SupportedPids01To20 => "",
            Pid::EngineLoad | Pid::ShortFuelTrim | Pid::LongFuelTrim | Pid::ThrottlePosition => "%",
            Pid::CoolantTemp | Pid::IntakeAirTemp => "°C",
            Pid::IntakeManifoldPressure => "kPa",
            Pid::Rpm => "rpm",
            Pid::Speed => "km/h",
            Pid::Maf => "g/s",
            Pid::O2Voltage => "V",
        }
    }
}

/// A decoded live sensor value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    /// The PID that was queried
    pub pid: u8,
    /// Human-readable name
    pub name: &'static str,
    /// Decoded value
    pub value: f64,
    /// Unit of `value`
    pub unit: &'static str,
    /// Raw bytes from the response
    pub raw_bytes: Vec<u8>,
}

/// Decode a mode 01 payload for `pid` into engineering units
pub fn decode_sensor(pid: u8, bytes: &[u8]) -> Result<SensorReading, ObdError> {
    let known = Pid::from_hex(pid)
        .ok_or_else(|| ObdError::ProtocolDecode(format!("no formula for PID {pid:02X}")))?;

    let need = known.response_bytes();
    if bytes.len() < need {
        return Err(ObdError::ProtocolDecode(format!(
            "PID {pid:02X}: need {need} bytes, got {}",
            bytes.len()
        )));
    }

    let a = bytes[0] as f64;
    let b = bytes.get(1).copied().unwrap_or(0) as f64;
    let value = match known {
        // RPM: ((A*256)+B)/4
        Pid::Rpm => ((a * 256.0) + b) / 4.0,
        // Speed: A (km/h)
        Pid::Speed => a,
        // Temperatures: A - 40 (°C)
        Pid::CoolantTemp | Pid::IntakeAirTemp => a - 40.0,
        // Load and throttle: A * 100 / 255 (%)
        Pid::EngineLoad | Pid::ThrottlePosition => a * 100.0 / 255.0,
        // MAF: ((A*256)+B) / 100 (g/s)
        Pid::Maf => ((a * 256.0) + b) / 100.0,
        // Short/Long fuel trim: (A - 128) * 100 / 128 (%)
        Pid::ShortFuelTrim | Pid::LongFuelTrim => (a - 128.0) * 100.0 / 128.0,
        // O2 Voltage: A / 200 (V)
        Pid::O2Voltage => a / 200.0,
        // Intake manifold pressure: A (kPa)
        Pid::IntakeManifoldPressure => a,
        Pid::SupportedPids01To20 => {
            return Err(ObdError::ProtocolDecode(
                "PID 00 is a bitmap, not a sensor value".to_string(),
            ))
        }
    };

    Ok(SensorReading {
        pid,
        name: known.name(),
        value,
        unit: known.unit(),
        raw_bytes: bytes[..need].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = (26*256 + 43) / 4 = 6699/4 = 1674.75
        let reading = decode_sensor(0x0C, &[0x1A, 0x2B]).unwrap();
        assert!((reading.value - 1674.75).abs() < 0.01);
        assert_eq!(reading.unit, "rpm");
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        let reading = decode_sensor(0x05, &[0x73]).unwrap();
        assert!((reading.value - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_speed_decode() {
        // 0x55 = 85 km/h
        let reading = decode_sensor(0x0D, &[0x55]).unwrap();
        assert!((reading.value - 85.0).abs() < 0.01);
    }

    #[test]
    fn test_fuel_trim_decode() {
        // 0x80 = 128, so trim = (128-128)*100/128 = 0%
        let reading = decode_sensor(0x06, &[0x80]).unwrap();
        assert!((reading.value - 0.0).abs() < 0.01);

        // 0x90 = 144, so trim = (144-128)*100/128 = 12.5%
        let reading = decode_sensor(0x06, &[0x90]).unwrap();
        assert!((reading.value - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_short_payload_and_unknown_pid() {
        assert_eq!(decode_sensor(0x0C, &[0x1A]).unwrap_err().code(), "PROTOCOL_DECODE");
        assert_eq!(decode_sensor(0x5C, &[0x1A]).unwrap_err().code(), "PROTOCOL_DECODE");
        assert_eq!(decode_sensor(0x00, &[0, 0, 0, 0]).unwrap_err().code(), "PROTOCOL_DECODE");
    }

    #[test]
    fn test_pid_lookup() {
        assert_eq!(Pid::from_hex(0x10), Some(Pid::Maf));
        assert_eq!(Pid::from_hex(0xFE), None);
    }
}
