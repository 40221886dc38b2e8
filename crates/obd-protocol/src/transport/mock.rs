//! Simulated vehicle for tests and demos
//!
//! [`MockVehicle`] is one ECU speaking a single protocol behind an adapter.
//! Requests framed for any other protocol go unanswered, so negotiation
//! behaves as it would on a real bus. Faults can be scripted per request.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Connector, DeviceInfo, Transport};
use crate::codec::{decode, encode_response};
use crate::config::DeviceSelector;
use crate::error::ObdError;
use crate::mode;
use crate::protocol::{ProtocolId, FRAME_TERMINATOR, PROMPT};

/// Name the mock adapter advertises
pub const MOCK_DEVICE_NAME: &str = "OBDII-MOCK";

/// VIN of the vehicle built by [`MockVehicle::standard`]
pub const MOCK_VIN: &str = "1HGCM82633A004352";

/// Fault applied to the exchange of the next request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Request is ignored; the read runs into its deadline
    Silent,
    /// Reply stops mid-frame, without terminator or prompt
    Truncate,
    /// Reply frames arrive complete but the prompt never follows
    NoPrompt,
    /// Reply fails its integrity check
    Corrupt,
    /// Adapter reports that no ECU answered
    NoData,
    /// Peer drops the link instead of answering
    Close,
    /// Reply arrives late
    Delay(Duration),
    /// ECU rejects the request with this response code
    Negative(u8),
}

struct VehicleState {
    protocol: ProtocolId,
    ecu: u8,
    latency: Duration,
    responses: Mutex<HashMap<Vec<u8>, Vec<Vec<u8>>>>,
    faults: Mutex<VecDeque<Fault>>,
    received: Mutex<Vec<Vec<u8>>>,
    sends: AtomicUsize,
    opens: AtomicUsize,
}

/// Handle to a simulated vehicle; clones share state
#[derive(Clone)]
pub struct MockVehicle {
    state: Arc<VehicleState>,
}

impl MockVehicle {
    /// A vehicle that answers nothing until responses are added
    pub fn new(protocol: ProtocolId) -> Self {
        let ecu = if protocol.is_can() { 0x00 } else { 0x10 };
        Self {
            state: Arc::new(VehicleState {
                protocol,
                ecu,
                latency: Duration::from_millis(40),
                responses: Mutex::new(HashMap::new()),
                faults: Mutex::new(VecDeque::new()),
                received: Mutex::new(Vec::new()),
                sends: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
            }),
        }
    }

    /// A vehicle with a VIN, live data and a couple of stored codes
    pub fn standard(protocol: ProtocolId) -> Self {
        let vehicle = Self::new(protocol);
        // PIDs 01-20: 01 03-07 0C-11 13 15 1C 1F 20
        vehicle.set_reply(&[0x01, 0x00], &[0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13]);
        // PIDs 21-40: 21 only
        vehicle.set_reply(&[0x01, 0x20], &[0x41, 0x20, 0x80, 0x00, 0x00, 0x00]);
        vehicle.set_reply(&[0x01, 0x04], &[0x41, 0x04, 0x80]);
        vehicle.set_reply(&[0x01, 0x05], &[0x41, 0x05, 0x7B]);
        vehicle.set_reply(&[0x01, 0x06], &[0x41, 0x06, 0x80]);
        vehicle.set_reply(&[0x01, 0x07], &[0x41, 0x07, 0x84]);
        vehicle.set_reply(&[0x01, 0x0C], &[0x41, 0x0C, 0x1A, 0xF8]);
        vehicle.set_reply(&[0x01, 0x0D], &[0x41, 0x0D, 0x3C]);
        vehicle.set_reply(&[0x01, 0x0F], &[0x41, 0x0F, 0x46]);
        vehicle.set_reply(&[0x01, 0x10], &[0x41, 0x10, 0x01, 0x90]);
        vehicle.set_reply(&[0x01, 0x11], &[0x41, 0x11, 0x33]);
        vehicle.set_stored_dtcs(&[[0x01, 0x23], [0x43, 0x10]]);
        vehicle.set_pending_dtcs(&[[0x03, 0x00]]);
        vehicle.set_vin(MOCK_VIN);
        vehicle
    }

    /// Protocol the ECU speaks
    pub fn protocol(&self) -> ProtocolId {
        self.state.protocol
    }

    /// Answer `request` (mode, pid, payload) with a single message
    pub fn set_reply(&self, request: &[u8], message: &[u8]) {
        self.set_messages(request, vec![message.to_vec()]);
    }

    /// Answer `request` with several messages, each framed separately
    pub fn set_messages(&self, request: &[u8], messages: Vec<Vec<u8>>) {
        if let Ok(mut responses) = self.state.responses.lock() {
            responses.insert(request.to_vec(), messages);
        }
    }

    /// Stored trouble codes (mode 03), as raw two-byte units
    pub fn set_stored_dtcs(&self, codes: &[[u8; 2]]) {
        let messages = self.dtc_messages(mode::READ_DTC, codes);
        self.set_messages(&[mode::READ_DTC], messages);
    }

    /// Pending trouble codes (mode 07)
    pub fn set_pending_dtcs(&self, codes: &[[u8; 2]]) {
        let messages = self.dtc_messages(mode::PENDING_DTC, codes);
        self.set_messages(&[mode::PENDING_DTC], messages);
    }

    /// VIN reply (mode 09 PID 02), laid out the way this protocol sends it
    pub fn set_vin(&self, vin: &str) {
        let reply_mode = mode::VEHICLE_INFO | mode::RESPONSE_OFFSET;
        let pid = crate::info_pid::VIN;
        let messages = if self.state.protocol.is_can() {
            let mut message = vec![reply_mode, pid, 0x01];
            message.extend_from_slice(vin.as_bytes());
            vec![message]
        } else {
            // Five messages of four bytes, the first zero-padded
            let mut padded = vec![0u8; 20usize.saturating_sub(vin.len())];
            padded.extend_from_slice(vin.as_bytes());
            padded
                .chunks(4)
                .enumerate()
                .map(|(i, chunk)| {
                    let mut message = vec![reply_mode, pid, i as u8 + 1];
                    message.extend_from_slice(chunk);
                    message
                })
                .collect()
        };
        self.set_messages(&[mode::VEHICLE_INFO, pid], messages);
    }

    fn dtc_messages(&self, request_mode: u8, codes: &[[u8; 2]]) -> Vec<Vec<u8>> {
        let reply_mode = request_mode | mode::RESPONSE_OFFSET;
        if self.state.protocol.is_can() {
            let mut message = vec![reply_mode, codes.len() as u8];
            message.extend(codes.iter().flatten());
            return vec![message];
        }
        // Three codes per message, zero-padded
        if codes.is_empty() {
            return vec![vec![reply_mode, 0, 0, 0, 0, 0, 0]];
        }
        codes
            .chunks(3)
            .map(|chunk| {
                let mut message = vec![reply_mode];
                message.extend(chunk.iter().flatten());
                message.resize(7, 0);
                message
            })
            .collect()
    }

    /// Queue a fault for the next request that reaches the vehicle
    pub fn push_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.state.faults.lock() {
            faults.push_back(fault);
        }
    }

    /// Frames written to the link so far, across all connections
    pub fn sends(&self) -> usize {
        self.state.sends.load(Ordering::SeqCst)
    }

    /// Raw frames written to the link, oldest first
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state
            .received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Number of times a link to the vehicle was opened
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    fn next_fault(&self) -> Option<Fault> {
        self.state.faults.lock().ok().and_then(|mut f| f.pop_front())
    }

    fn lookup(&self, request: &[u8]) -> Option<Vec<Vec<u8>>> {
        self.state
            .responses
            .lock()
            .ok()
            .and_then(|r| r.get(request).cloned())
    }
}

/// Connector that always finds the simulated adapter
pub struct MockConnector {
    vehicle: MockVehicle,
    bluetooth: bool,
}

impl MockConnector {
    pub fn new(vehicle: MockVehicle) -> Self {
        Self {
            vehicle,
            bluetooth: true,
        }
    }

    /// A host whose Bluetooth stack is off
    pub fn without_bluetooth(vehicle: MockVehicle) -> Self {
        Self {
            vehicle,
            bluetooth: false,
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn discover(&self, selector: &DeviceSelector) -> Result<DeviceInfo, ObdError> {
        if !self.bluetooth {
            return Err(ObdError::BluetoothUnavailable("adapter powered off".to_string()));
        }
        if let Some(name) = &selector.name {
            if !MOCK_DEVICE_NAME.contains(name.as_str()) {
                return Err(ObdError::DeviceNotFound(format!("no device matches `{name}`")));
            }
        }
        Ok(DeviceInfo {
            address: "mock://obd".to_string(),
            name: MOCK_DEVICE_NAME.to_string(),
            kind: "Mock".to_string(),
        })
    }

    async fn open(
        &self,
        device: &DeviceInfo,
        _selector: &DeviceSelector,
    ) -> Result<Box<dyn Transport>, ObdError> {
        self.vehicle.state.opens.fetch_add(1, Ordering::SeqCst);
        debug!(device = %device.name, "Opened mock link");
        Ok(Box::new(MockTransport::new(self.vehicle.clone())))
    }
}

enum Inbound {
    Chunk { at: Instant, bytes: Vec<u8> },
    Hangup { at: Instant },
}

impl Inbound {
    fn at(&self) -> Instant {
        match self {
            Inbound::Chunk { at, .. } | Inbound::Hangup { at } => *at,
        }
    }
}

/// Link to a [`MockVehicle`]
pub struct MockTransport {
    vehicle: MockVehicle,
    selected: Option<ProtocolId>,
    inbox: VecDeque<Inbound>,
    closed: bool,
}

impl MockTransport {
    pub fn new(vehicle: MockVehicle) -> Self {
        Self {
            vehicle,
            selected: None,
            inbox: VecDeque::new(),
            closed: false,
        }
    }

    /// Request bytes (mode, pid, payload) if the frame is one the ECU hears
    fn hear(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let protocol = self.vehicle.protocol();
        if self.selected.is_some_and(|p| p != protocol) {
            return None;
        }
        let request = decode(bytes, protocol).ok()?;
        let mut data = vec![request.mode];
        data.extend(request.pid);
        data.extend_from_slice(&request.payload);
        Some(data)
    }

    fn render(&self, messages: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, ObdError> {
        let state = &self.vehicle.state;
        let mut lines = Vec::new();
        for message in messages {
            let frames = encode_response(state.protocol, state.ecu, message)?;
            lines.extend(
                frames
                    .split_inclusive(|&b| b == FRAME_TERMINATOR)
                    .map(<[u8]>::to_vec),
            );
        }
        Ok(lines)
    }
}

fn corrupt(line: &mut [u8], protocol: ProtocolId) {
    let Some(end) = line.iter().position(|&b| b == FRAME_TERMINATOR) else {
        return;
    };
    let replacement = if protocol.is_can() {
        // Single-frame PCI claiming fifteen bytes
        let at = protocol.layout().header_len * 2;
        (at, "0F".to_string())
    } else {
        let at = end.saturating_sub(2);
        let old = std::str::from_utf8(&line[at..end])
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .unwrap_or(0);
        (at, format!("{:02X}", old ^ 0xFF))
    };
    let (at, digits) = replacement;
    if at + 2 <= line.len() {
        line[at..at + 2].copy_from_slice(digits.as_bytes());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn select_protocol(&mut self, protocol: ProtocolId) -> Result<(), ObdError> {
        if self.closed {
            return Err(ObdError::LinkClosed("mock link closed".to_string()));
        }
        self.selected = Some(protocol);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        if self.closed {
            return Err(ObdError::LinkClosed("mock link closed".to_string()));
        }
        let state = &self.vehicle.state;
        state.sends.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut received) = state.received.lock() {
            received.push(bytes.to_vec());
        }

        let Some(request) = self.hear(bytes) else {
            debug!("Mock vehicle ignored a frame it cannot hear");
            return Ok(());
        };

        let fault = self.vehicle.next_fault();
        let mut at = Instant::now() + state.latency;
        // The adapter answers in order; nothing overtakes an earlier reply
        if let Some(last) = self.inbox.back() {
            at = at.max(last.at());
        }
        let messages = match &fault {
            Some(Fault::Silent) => return Ok(()),
            Some(Fault::Close) => {
                self.inbox.push_back(Inbound::Hangup { at });
                return Ok(());
            }
            Some(Fault::NoData) => None,
            Some(Fault::Negative(nrc)) => Some(vec![vec![mode::NEGATIVE_RESPONSE, request[0], *nrc]]),
            Some(Fault::Delay(extra)) => {
                at += *extra;
                self.vehicle.lookup(&request)
            }
            _ => self.vehicle.lookup(&request),
        };

        let mut lines = match messages {
            Some(messages) => self.render(&messages)?,
            None => vec![b"NO DATA\r".to_vec()],
        };
        match fault {
            Some(Fault::Corrupt) => {
                if let Some(first) = lines.first_mut() {
                    corrupt(first, state.protocol);
                }
            }
            Some(Fault::Truncate) => {
                let first = lines.first().cloned().unwrap_or_default();
                let cut = first.len() / 2;
                self.inbox.push_back(Inbound::Chunk {
                    at,
                    bytes: first[..cut].to_vec(),
                });
                return Ok(());
            }
            _ => {}
        }

        for line in lines {
            self.inbox.push_back(Inbound::Chunk { at, bytes: line });
        }
        if fault == Some(Fault::NoPrompt) {
            return Ok(());
        }
        self.inbox.push_back(Inbound::Chunk {
            at,
            bytes: vec![FRAME_TERMINATOR, PROMPT],
        });
        Ok(())
    }

    async fn discard_input(&mut self) -> Result<(), ObdError> {
        let now = Instant::now();
        let before = self.inbox.len();
        self.inbox
            .retain(|item| !matches!(item, Inbound::Chunk { at, .. } if *at <= now));
        let dropped = before - self.inbox.len();
        if dropped > 0 {
            debug!(dropped, "Mock link discarded unread chunks");
        }
        Ok(())
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Vec<u8>, ObdError> {
        if self.closed {
            return Err(ObdError::LinkClosed("mock link closed".to_string()));
        }
        let ready = self.inbox.front().map(|item| item.at() <= deadline);
        if ready != Some(true) {
            let waited = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep_until(deadline).await;
            return Err(ObdError::LinkTimeout(waited.as_millis() as u64));
        }

        match self.inbox.pop_front() {
            Some(Inbound::Chunk { at, bytes }) => {
                tokio::time::sleep_until(at).await;
                Ok(bytes)
            }
            Some(Inbound::Hangup { at }) => {
                tokio::time::sleep_until(at).await;
                self.closed = true;
                self.inbox.clear();
                Err(ObdError::LinkClosed("peer closed the link".to_string()))
            }
            None => Err(ObdError::LinkTimeout(0)),
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.inbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::message::DiagnosticRequest;

    async fn exchange(
        transport: &mut MockTransport,
        request: &DiagnosticRequest,
        protocol: ProtocolId,
    ) -> Result<Vec<u8>, ObdError> {
        transport.send(&encode(request, protocol)?).await?;
        let deadline = Instant::now() + Duration::from_millis(500);
        let mut reply = Vec::new();
        while !reply.contains(&PROMPT) {
            reply.extend(transport.receive(deadline).await?);
        }
        Ok(reply)
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_in_own_protocol() {
        let protocol = ProtocolId::Iso9141_2;
        let vehicle = MockVehicle::standard(protocol);
        let mut transport = MockTransport::new(vehicle.clone());

        let reply = exchange(&mut transport, &DiagnosticRequest::current_data(0x0D), protocol)
            .await
            .unwrap();
        let response = decode(&reply, protocol).unwrap();
        assert_eq!(response.mode, 0x41);
        assert_eq!(response.payload, vec![0x3C]);
        assert_eq!(vehicle.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_to_other_protocols() {
        let vehicle = MockVehicle::standard(ProtocolId::Iso9141_2);
        let mut transport = MockTransport::new(vehicle.clone());
        transport
            .select_protocol(ProtocolId::Iso15765_4Can11bit500)
            .await
            .unwrap();

        let err = exchange(
            &mut transport,
            &DiagnosticRequest::supported_pids_probe(),
            ProtocolId::Iso15765_4Can11bit500,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "LINK_TIMEOUT");
        assert_eq!(vehicle.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_vin_is_segmented() {
        let protocol = ProtocolId::Iso15765_4Can11bit500;
        let vehicle = MockVehicle::standard(protocol);
        let mut transport = MockTransport::new(vehicle);

        let reply = exchange(&mut transport, &DiagnosticRequest::vehicle_info(0x02), protocol)
            .await
            .unwrap();
        let response = decode(&reply, protocol).unwrap();
        assert!(response.meta.frame_count > 1);
        assert_eq!(crate::decoder::vin_payload(&response), MOCK_VIN.as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_fault_fails_integrity_check() {
        for protocol in [ProtocolId::J1850Vpw, ProtocolId::Iso15765_4Can29bit500] {
            let vehicle = MockVehicle::standard(protocol);
            vehicle.push_fault(Fault::Corrupt);
            let mut transport = MockTransport::new(vehicle);

            let reply = exchange(&mut transport, &DiagnosticRequest::current_data(0x0C), protocol)
                .await
                .unwrap();
            let err = decode(&reply, protocol).unwrap_err();
            assert!(err.is_corruption(), "{protocol}: {err:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fault_hangs_up() {
        let protocol = ProtocolId::Iso14230_4KwpFast;
        let vehicle = MockVehicle::standard(protocol);
        vehicle.push_fault(Fault::Close);
        let mut transport = MockTransport::new(vehicle);

        let err = exchange(&mut transport, &DiagnosticRequest::current_data(0x0C), protocol)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LINK_CLOSED");
        assert!(transport.send(b"00\r").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_request_reports_no_data() {
        let protocol = ProtocolId::J1850Pwm;
        let vehicle = MockVehicle::standard(protocol);
        let mut transport = MockTransport::new(vehicle);

        let reply = exchange(&mut transport, &DiagnosticRequest::current_data(0x5C), protocol)
            .await
            .unwrap();
        assert_eq!(decode(&reply, protocol).unwrap_err(), ObdError::NoData);
    }

    #[tokio::test]
    async fn test_connector_selector() {
        let connector = MockConnector::new(MockVehicle::new(ProtocolId::J1850Pwm));
        let selector = DeviceSelector {
            name: Some("nope".to_string()),
            ..Default::default()
        };
        assert_eq!(
            connector.discover(&selector).await.unwrap_err().code(),
            "DEVICE_NOT_FOUND"
        );
        let device = connector.discover(&DeviceSelector::default()).await.unwrap();
        assert_eq!(device.name, MOCK_DEVICE_NAME);

        let off = MockConnector::without_bluetooth(MockVehicle::new(ProtocolId::J1850Pwm));
        assert_eq!(
            off.discover(&DeviceSelector::default()).await.unwrap_err().code(),
            "BLUETOOTH_UNAVAILABLE"
        );
    }
}
