//! OBD-II diagnostics from the command line
//!
//! Connects to a Bluetooth ELM327 adapter (or a simulated vehicle with
//! `--mock`), negotiates the bus protocol and prints results as JSON.

mod commands;
mod logging;
mod settings;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use obd_protocol::transport::mock::{MockConnector, MockVehicle};
use obd_protocol::transport::SerialConnector;
use obd_protocol::{open_session, ProtocolId};

use crate::logging::init_logging;
use crate::settings::Overrides;

#[derive(Parser, Debug)]
#[command(name = "obd-diag", version, about = "OBD-II diagnostics over Bluetooth")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c', value_name = "FILE", global = true, env = "OBD_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port or adapter name to connect to
    #[arg(long, short = 'd', value_name = "NAME", global = true)]
    device: Option<String>,

    /// Protocols to try: "auto" or a comma-separated list
    #[arg(long, short = 'p', value_name = "LIST", global = true)]
    protocol: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    /// Re-sends after a timeout
    #[arg(long, value_name = "N", global = true)]
    retries: Option<u32>,

    /// Talk to a simulated vehicle speaking PROTOCOL instead of real hardware
    #[arg(
        long,
        value_name = "PROTOCOL",
        num_args = 0..=1,
        default_missing_value = "ISO15765_4_CAN_11_500",
        global = true
    )]
    mock: Option<ProtocolId>,

    /// Debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            device: self.device.clone(),
            protocol: self.protocol.clone(),
            timeout_ms: self.timeout_ms,
            retry_count: self.retries,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Negotiate the protocol and report each candidate tried
    Probe,
    /// Read the VIN and supported PIDs
    Info,
    /// Read trouble codes
    Dtc {
        /// Pending codes (mode 07) instead of stored ones
        #[arg(long)]
        pending: bool,
    },
    /// Read live sensor values
    Sensor {
        /// PIDs in hex, e.g. 0C 0D
        #[arg(required = true)]
        pids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = settings::load(cli.config.as_deref(), &cli.overrides())?;
    info!("=== obd-diag v{} ===", env!("CARGO_PKG_VERSION"));

    let session = match cli.mock {
        Some(protocol) => {
            info!(%protocol, "Using simulated vehicle");
            open_session(config, MockConnector::new(MockVehicle::standard(protocol))).await?
        }
        None => open_session(config, SerialConnector::new()).await?,
    };

    let work = async {
        session.negotiate().await?;
        commands::run(&session, &cli.command).await
    };
    let result = tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };
    session.disconnect().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sensor_subcommand() {
        let cli = Cli::try_parse_from(["obd-diag", "sensor", "0C", "0D", "--mock"])
            .expect("sensor args should parse");
        assert_eq!(
            cli.command,
            Command::Sensor {
                pids: vec!["0C".to_string(), "0D".to_string()]
            }
        );
        assert_eq!(cli.mock, Some(ProtocolId::Iso15765_4Can11bit500));
    }

    #[test]
    fn parses_mock_protocol_and_overrides() {
        let cli = Cli::try_parse_from([
            "obd-diag",
            "--mock",
            "ISO9141_2",
            "--timeout-ms",
            "500",
            "dtc",
            "--pending",
        ])
        .expect("dtc args should parse");
        assert_eq!(cli.mock, Some(ProtocolId::Iso9141_2));
        assert_eq!(cli.command, Command::Dtc { pending: true });
        assert_eq!(cli.overrides().timeout_ms, Some(500));
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(Cli::try_parse_from(["obd-diag", "--mock", "FOO", "probe"]).is_err());
    }

    #[test]
    fn sensor_requires_a_pid() {
        let err = Cli::try_parse_from(["obd-diag", "sensor"]).expect_err("pid is required");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
