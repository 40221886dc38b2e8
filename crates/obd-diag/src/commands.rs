//! Subcommand handlers; each returns the JSON document to print

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;

use obd_protocol::{
    DtcCode, NegotiationOutcome, ObdError, SensorReading, Session, SessionStats, VehicleInfo,
};

use crate::Command;

#[derive(Serialize)]
struct ProbeAttemptOutput {
    protocol: String,
    elapsed_ms: u64,
    error_code: Option<&'static str>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ProbeOutput {
    protocol: String,
    device: Option<String>,
    attempts: Vec<ProbeAttemptOutput>,
    stats: SessionStats,
}

#[derive(Serialize)]
struct InfoOutput<'a> {
    protocol: Option<String>,
    vin: &'a str,
    supported_pids: Vec<String>,
}

#[derive(Serialize)]
struct DtcOutput {
    code: String,
    category: char,
    description: Option<String>,
}

#[derive(Serialize)]
struct DtcReport {
    pending: bool,
    count: usize,
    codes: Vec<DtcOutput>,
}

fn probe_output(session: &Session, outcome: &NegotiationOutcome) -> ProbeOutput {
    ProbeOutput {
        protocol: outcome.protocol.to_string(),
        device: session.device().map(|d| d.name),
        attempts: outcome
            .attempts
            .iter()
            .map(|a| ProbeAttemptOutput {
                protocol: a.protocol.to_string(),
                elapsed_ms: a.elapsed.as_millis() as u64,
                error_code: a.error.as_ref().map(ObdError::code),
                error: a.error.as_ref().map(ToString::to_string),
            })
            .collect(),
        stats: session.stats(),
    }
}

fn info_output<'a>(session: &Session, info: &'a VehicleInfo) -> InfoOutput<'a> {
    InfoOutput {
        protocol: session.protocol().map(|p| p.to_string()),
        vin: &info.vin,
        supported_pids: info
            .supported_pids
            .iter()
            .map(|pid| format!("{pid:02X}"))
            .collect(),
    }
}

fn dtc_report(codes: &[DtcCode], pending: bool) -> DtcReport {
    DtcReport {
        pending,
        count: codes.len(),
        codes: codes
            .iter()
            .map(|c| DtcOutput {
                code: c.to_string(),
                category: c.category.letter(),
                description: c.description.clone(),
            })
            .collect(),
    }
}

/// Parse a PID given in hex, with or without `0x` ("0C", "0x0c")
pub fn parse_pid(text: &str) -> Result<u8> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u8::from_str_radix(digits, 16).map_err(|e| anyhow!("invalid PID `{text}`: {e}"))
}

/// Run one subcommand against a negotiated session
pub async fn run(session: &Session, command: &Command) -> Result<Value> {
    let value = match command {
        Command::Probe => {
            let outcome = session
                .negotiation()
                .ok_or_else(|| anyhow!("session has not negotiated a protocol"))?;
            serde_json::to_value(probe_output(session, &outcome))?
        }
        Command::Info => {
            let info = session.fetch_vehicle_info().await?;
            serde_json::to_value(info_output(session, &info))?
        }
        Command::Dtc { pending } => {
            let codes = if *pending {
                session.fetch_pending_trouble_codes().await?
            } else {
                session.fetch_trouble_codes().await?
            };
            serde_json::to_value(dtc_report(&codes, *pending))?
        }
        Command::Sensor { pids } => {
            let mut readings: Vec<SensorReading> = Vec::with_capacity(pids.len());
            for pid in pids {
                readings.push(session.read_sensor(parse_pid(pid)?).await?);
            }
            serde_json::to_value(readings)?
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::transport::mock::{MockConnector, MockVehicle, MOCK_VIN};
    use obd_protocol::{open_session, ConnectionConfig, ProtocolId, ProtocolPreference};

    async fn mock_session(protocol: ProtocolId) -> Session {
        let config = ConnectionConfig {
            protocol_preference: ProtocolPreference::Ordered(vec![protocol]),
            ..Default::default()
        };
        let session = open_session(config, MockConnector::new(MockVehicle::standard(protocol)))
            .await
            .unwrap();
        session.negotiate().await.unwrap();
        session
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("0C").unwrap(), 0x0C);
        assert_eq!(parse_pid("0x0d").unwrap(), 0x0D);
        assert_eq!(parse_pid("0d").unwrap(), 0x0D);
        assert!(parse_pid("1FF").is_err());
        assert!(parse_pid("zz").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_info_and_dtc_json() {
        let session = mock_session(ProtocolId::Iso15765_4Can11bit500).await;

        let info = run(&session, &Command::Info).await.unwrap();
        assert_eq!(info["vin"], MOCK_VIN);
        assert_eq!(info["protocol"], "ISO15765_4_CAN_11_500");

        let dtcs = run(&session, &Command::Dtc { pending: false }).await.unwrap();
        assert_eq!(dtcs["count"], 2);
        assert_eq!(dtcs["codes"][0]["code"], "P0123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_and_sensor_json() {
        let session = mock_session(ProtocolId::Iso14230_4KwpFast).await;

        let probe = run(&session, &Command::Probe).await.unwrap();
        assert_eq!(probe["protocol"], "ISO14230_4_KWP_FAST");
        assert_eq!(probe["attempts"].as_array().unwrap().len(), 1);

        let sensors = run(
            &session,
            &Command::Sensor {
                pids: vec!["0C".to_string(), "0D".to_string()],
            },
        )
        .await
        .unwrap();
        assert_eq!(sensors[0]["unit"], "rpm");
        assert_eq!(sensors[1]["value"], 60.0);
    }
}
