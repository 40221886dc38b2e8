//! Serial-port link to an ELM327-compatible adapter
//!
//! Bluetooth OBD dongles show up as serial ports once paired (rfcomm on
//! Linux, an outgoing COM/cu port elsewhere). The adapter builds bus frames
//! itself, so outgoing frames are split back into an `ATSH` header and the
//! data bytes before they are written.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, warn};

use super::{Connector, DeviceInfo, Transport};
use crate::config::DeviceSelector;
use crate::error::ObdError;
use crate::protocol::{ProtocolFamily, ProtocolId, FRAME_TERMINATOR, PROMPT};

/// Reset takes noticeably longer than other AT commands
const RESET_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 256;

/// Finds paired Bluetooth adapters among the system's serial ports
#[derive(Debug, Clone, Default)]
pub struct SerialConnector;

impl SerialConnector {
    pub fn new() -> Self {
        Self
    }
}

fn port_kind(port_type: &SerialPortType) -> &'static str {
    match port_type {
        SerialPortType::BluetoothPort => "Bluetooth",
        SerialPortType::UsbPort(_) => "USB",
        SerialPortType::PciPort => "PCI",
        SerialPortType::Unknown => "Unknown",
    }
}

fn looks_like_adapter(name: &str, port_type: &SerialPortType) -> bool {
    if matches!(port_type, SerialPortType::BluetoothPort) {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    if lower.contains("rfcomm") || lower.contains("obd") {
        return true;
    }
    match port_type {
        SerialPortType::UsbPort(usb) => usb
            .product
            .as_deref()
            .is_some_and(|p| p.to_ascii_uppercase().contains("OBD")),
        _ => false,
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn discover(&self, selector: &DeviceSelector) -> Result<DeviceInfo, ObdError> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| ObdError::BluetoothUnavailable(format!("cannot enumerate ports: {e}")))?;
        debug!(count = ports.len(), "Enumerated serial ports");

        let found = match &selector.name {
            Some(wanted) => ports.into_iter().find(|p| {
                p.port_name == *wanted || p.port_name.contains(wanted.as_str())
            }),
            None => ports
                .into_iter()
                .find(|p| looks_like_adapter(&p.port_name, &p.port_type)),
        };

        let port = found.ok_or_else(|| {
            ObdError::DeviceNotFound(match &selector.name {
                Some(name) => format!("no serial port matches `{name}`"),
                None => "no Bluetooth serial port found".to_string(),
            })
        })?;

        info!(port = %port.port_name, "Found adapter");
        Ok(DeviceInfo {
            address: port.port_name.clone(),
            name: port.port_name.clone(),
            kind: port_kind(&port.port_type).to_string(),
        })
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        selector: &DeviceSelector,
    ) -> Result<Box<dyn Transport>, ObdError> {
        let port = tokio_serial::new(&device.address, selector.baud_rate)
            .open_native_async()
            .map_err(|e| ObdError::DeviceNotFound(format!("{}: {e}", device.address)))?;

        let mut transport = SerialTransport::new(port);
        transport.initialize(&selector.init_commands).await?;
        Ok(Box::new(transport))
    }
}

/// Byte link over an open serial port
pub struct SerialTransport {
    port: Option<SerialStream>,
    protocol: Option<ProtocolId>,
    /// Header last programmed with ATSH
    header: Option<Vec<u8>>,
}

impl SerialTransport {
    pub fn new(port: SerialStream) -> Self {
        Self {
            port: Some(port),
            protocol: None,
            header: None,
        }
    }

    async fn initialize(&mut self, commands: &[String]) -> Result<(), ObdError> {
        for cmd in commands {
            let is_reset = cmd.eq_ignore_ascii_case("ATZ");
            let timeout = if is_reset {
                RESET_TIMEOUT
            } else {
                COMMAND_TIMEOUT
            };
            let reply = self.command(cmd, timeout).await.map_err(|e| match e {
                ObdError::LinkTimeout(_) => {
                    ObdError::DeviceNotFound(format!("adapter did not answer {cmd}"))
                }
                other => other,
            })?;
            if is_reset {
                info!(version = %reply.trim(), "Adapter reset");
            }
        }
        Ok(())
    }

    /// Run one AT command and return its reply text (prompt stripped)
    ///
    /// An adapter still busy with an earlier request answers `STOPPED`; the
    /// command is then issued once more.
    async fn command(&mut self, cmd: &str, timeout: Duration) -> Result<String, ObdError> {
        let mut text = self.command_once(cmd, timeout).await?;
        if is_stopped(&text) {
            debug!(cmd, "Adapter was busy, repeating command");
            text = self.command_once(cmd, timeout).await?;
        }
        Ok(text)
    }

    async fn command_once(&mut self, cmd: &str, timeout: Duration) -> Result<String, ObdError> {
        self.discard_input().await?;
        let mut line = cmd.as_bytes().to_vec();
        line.push(FRAME_TERMINATOR);
        self.write_raw(&line).await?;

        let deadline = Instant::now() + timeout;
        let mut reply = Vec::new();
        while !reply.contains(&PROMPT) {
            let chunk = self.receive(deadline).await?;
            reply.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&reply).replace(PROMPT as char, "");
        debug!(cmd, reply = %text.trim(), "AT command");
        Ok(text)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ObdError::LinkClosed("port closed".to_string()))?;
        port.write_all(bytes)
            .await
            .map_err(|e| ObdError::LinkWrite(e.to_string()))?;
        port.flush().await.map_err(|e| ObdError::LinkWrite(e.to_string()))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn select_protocol(&mut self, protocol: ProtocolId) -> Result<(), ObdError> {
        let cmd = format!("ATSP{}", protocol.elm_number());
        let reply = self.command(&cmd, COMMAND_TIMEOUT).await?;
        if !reply.contains("OK") {
            return Err(ObdError::MalformedFrame(format!(
                "adapter rejected {cmd}: {}",
                reply.trim()
            )));
        }
        self.protocol = Some(protocol);
        self.header = None;
        Ok(())
    }

    async fn discard_input(&mut self) -> Result<(), ObdError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ObdError::LinkClosed("port closed".to_string()))?;
        if let Err(e) = port.clear(ClearBuffer::Input) {
            warn!(error = %e, "Could not clear adapter input");
        }
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let protocol = self
            .protocol
            .ok_or_else(|| ObdError::LinkWrite("no protocol selected on adapter".to_string()))?;
        let (header, data) = split_request(bytes, protocol)?;

        if self.header.as_deref() != Some(header.as_slice()) {
            for cmd in header_commands(&header, protocol) {
                self.command(&cmd, COMMAND_TIMEOUT).await?;
            }
            self.header = Some(header);
        }

        let mut line = hex::encode_upper(&data).into_bytes();
        line.push(FRAME_TERMINATOR);
        self.write_raw(&line).await
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Vec<u8>, ObdError> {
        let started = Instant::now();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ObdError::LinkClosed("port closed".to_string()))?;

        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout_at(deadline, port.read(&mut buf)).await {
            Ok(Ok(0)) => Err(ObdError::LinkClosed("adapter hung up".to_string())),
            Ok(Ok(n)) => Ok(buf[..n].to_vec()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ObdError::LinkTimeout(started.elapsed().as_millis() as u64)),
        }
    }

    async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.shutdown().await {
                warn!(error = %e, "Error closing serial port");
            }
        }
    }
}

/// Whether the adapter aborted a command because it was still busy
fn is_stopped(reply: &str) -> bool {
    reply
        .split(['\r', '\n'])
        .any(|line| line.trim().eq_ignore_ascii_case("STOPPED"))
}

/// Split an encoded request line into its header and diagnostic bytes
fn split_request(line: &[u8], protocol: ProtocolId) -> Result<(Vec<u8>, Vec<u8>), ObdError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ObdError::MalformedFrame("request is not ASCII".to_string()))?;
    let frame = hex::decode(text.trim_end_matches(FRAME_TERMINATOR as char))
        .map_err(|e| ObdError::MalformedFrame(format!("request is not hex: {e}")))?;

    let layout = protocol.layout();
    if frame.len() <= layout.header_len {
        return Err(ObdError::MalformedFrame("request has no data".to_string()));
    }
    let (header, rest) = frame.split_at(layout.header_len);

    let data = if protocol.is_can() {
        let len = (rest[0] & 0x0F) as usize;
        rest.get(1..1 + len)
            .ok_or_else(|| ObdError::MalformedFrame(format!("PCI length {len} exceeds frame")))?
    } else {
        &rest[..rest.len().saturating_sub(layout.checksum.width())]
    };
    Ok((header.to_vec(), data.to_vec()))
}

/// AT commands that program `header` into the adapter
fn header_commands(header: &[u8], protocol: ProtocolId) -> Vec<String> {
    match protocol.family() {
        ProtocolFamily::Can11 => {
            let id = u16::from_be_bytes([header[0], header[1]]);
            vec![format!("ATSH{id:03X}")]
        }
        ProtocolFamily::Can29 => vec![
            format!("ATCP{:02X}", header[0]),
            format!("ATSH{}", hex::encode_upper(&header[1..])),
        ],
        _ => vec![format!("ATSH{}", hex::encode_upper(header))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::message::DiagnosticRequest;

    #[test]
    fn test_busy_adapter_detected() {
        assert!(is_stopped("STOPPED\r\r"));
        assert!(is_stopped("41 0C 1A F8\rSTOPPED\r"));
        assert!(!is_stopped("OK\r"));
    }

    #[test]
    fn test_split_kline_request() {
        let line = encode(&DiagnosticRequest::current_data(0x0C), ProtocolId::Iso9141_2).unwrap();
        let (header, data) = split_request(&line, ProtocolId::Iso9141_2).unwrap();
        assert_eq!(header, vec![0x68, 0x6A, 0xF1]);
        assert_eq!(data, vec![0x01, 0x0C]);
    }

    #[test]
    fn test_split_can_request_drops_pci_and_padding() {
        let protocol = ProtocolId::Iso15765_4Can11bit500;
        let line = encode(&DiagnosticRequest::stored_dtcs(), protocol).unwrap();
        let (header, data) = split_request(&line, protocol).unwrap();
        assert_eq!(header, vec![0x07, 0xDF]);
        assert_eq!(data, vec![0x03]);
        assert_eq!(header_commands(&header, protocol), vec!["ATSH7DF"]);
    }

    #[test]
    fn test_header_commands_29bit() {
        let protocol = ProtocolId::Iso15765_4Can29bit500;
        let header = protocol.request_header(2);
        assert_eq!(header_commands(&header, protocol), vec!["ATCP18", "ATSHDB33F1"]);
    }

    #[test]
    fn test_split_rejects_garbage() {
        assert!(split_request(b"XYZ\r", ProtocolId::J1850Pwm).is_err());
        assert!(split_request(b"616A\r", ProtocolId::J1850Pwm).is_err());
    }

    #[test]
    fn test_adapter_heuristics() {
        assert!(looks_like_adapter("/dev/rfcomm0", &SerialPortType::Unknown));
        assert!(looks_like_adapter("COM7", &SerialPortType::BluetoothPort));
        assert!(!looks_like_adapter("/dev/ttyS0", &SerialPortType::PciPort));
    }
}
