//! Adapter Link
//!
//! The session talks to the adapter through two seams: a [`Connector`] that
//! finds and opens a device, and the [`Transport`] it hands back, which
//! moves raw bytes. Both are trait objects so tests can substitute the
//! simulated vehicle in [`mock`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use tracing::debug;

use crate::codec::decode;
use crate::config::DeviceSelector;
use crate::error::ObdError;
use crate::message::{DiagnosticRequest, DiagnosticResponse};
use crate::protocol::{ProtocolId, PROMPT};

pub mod mock;
mod serial;

pub use serial::{SerialConnector, SerialTransport};

/// A discovered adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Port path or address used to open the link
    pub address: String,
    /// Display name
    pub name: String,
    /// Link kind ("Bluetooth", "USB", "Mock", ...)
    pub kind: String,
}

/// Finds and opens adapters
#[async_trait]
pub trait Connector: Send + Sync {
    /// Locate the adapter matching `selector`
    async fn discover(&self, selector: &DeviceSelector) -> Result<DeviceInfo, ObdError>;

    /// Open a byte link to a discovered adapter
    async fn open(
        &self,
        device: &DeviceInfo,
        selector: &DeviceSelector,
    ) -> Result<Box<dyn Transport>, ObdError>;
}

/// Bidirectional byte link to the adapter
#[async_trait]
pub trait Transport: Send {
    /// Tell the adapter which bus protocol to speak
    ///
    /// Links without protocol selection accept anything.
    async fn select_protocol(&mut self, _protocol: ProtocolId) -> Result<(), ObdError> {
        Ok(())
    }

    /// Drop whatever has been received but not read yet
    ///
    /// Called before each request so a late reply to an earlier exchange is
    /// not taken for the new answer.
    async fn discard_input(&mut self) -> Result<(), ObdError> {
        Ok(())
    }

    /// Write one encoded request frame
    async fn send(&mut self, bytes: &[u8]) -> Result<(), ObdError>;

    /// Next chunk of received bytes
    ///
    /// Returns [`ObdError::LinkTimeout`] when nothing arrives before
    /// `deadline`, and [`ObdError::LinkClosed`] once the peer is gone.
    async fn receive(&mut self, deadline: Instant) -> Result<Vec<u8>, ObdError>;

    /// Release the link; further calls fail with `LinkClosed`
    async fn close(&mut self);
}

/// Accumulate chunks until the adapter prompt or `deadline`
///
/// A deadline with nothing received is a [`ObdError::LinkTimeout`]; bytes
/// without the closing prompt are an [`ObdError::IncompleteFrame`], since
/// later frames of the same reply may still be on the way.
pub(crate) async fn read_response(
    transport: &mut dyn Transport,
    deadline: Instant,
) -> Result<Vec<u8>, ObdError> {
    let mut reply = Vec::new();
    loop {
        match transport.receive(deadline).await {
            Ok(chunk) => {
                reply.extend_from_slice(&chunk);
                if reply.contains(&PROMPT) {
                    return Ok(reply);
                }
            }
            Err(ObdError::LinkTimeout(ms)) if reply.is_empty() => {
                return Err(ObdError::LinkTimeout(ms))
            }
            Err(ObdError::LinkTimeout(_)) => {
                return Err(ObdError::IncompleteFrame(format!(
                    "{} bytes received but no prompt",
                    reply.len()
                )))
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read until a reply to `request` arrives or `deadline` passes
///
/// Complete replies to some other request are dropped and reading goes on.
pub(crate) async fn read_answer(
    transport: &mut dyn Transport,
    request: &DiagnosticRequest,
    protocol: ProtocolId,
    deadline: Instant,
) -> Result<DiagnosticResponse, ObdError> {
    loop {
        let reply = read_response(transport, deadline).await?;
        let response = decode(&reply, protocol)?;
        if !response.is_reply_to(request) {
            debug!(
                mode = response.mode,
                pid = ?response.pid,
                "Dropping reply to an earlier request"
            );
            continue;
        }
        response.check_answers(request)?;
        return Ok(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::transport::mock::{Fault, MockTransport, MockVehicle};
    use std::time::Duration;

    const KLINE: ProtocolId = ProtocolId::Iso9141_2;

    #[tokio::test(start_paused = true)]
    async fn test_missing_prompt_is_incomplete() {
        let vehicle = MockVehicle::standard(KLINE);
        vehicle.push_fault(Fault::NoPrompt);
        let mut transport = MockTransport::new(vehicle);
        let request = DiagnosticRequest::stored_dtcs();

        transport.send(&encode(&request, KLINE).unwrap()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(500);
        let err = read_response(&mut transport, deadline).await.unwrap_err();
        assert_eq!(err.code(), "INCOMPLETE_FRAME");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_skipped() {
        let vehicle = MockVehicle::standard(KLINE);
        let mut transport = MockTransport::new(vehicle.clone());
        let rpm = DiagnosticRequest::current_data(0x0C);
        let speed = DiagnosticRequest::current_data(0x0D);

        vehicle.push_fault(Fault::Delay(Duration::from_millis(300)));
        transport.send(&encode(&rpm, KLINE).unwrap()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(100);
        let err = read_answer(&mut transport, &rpm, KLINE, deadline).await.unwrap_err();
        assert_eq!(err.code(), "LINK_TIMEOUT");

        transport.discard_input().await.unwrap();
        transport.send(&encode(&speed, KLINE).unwrap()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(1000);
        let response = read_answer(&mut transport, &speed, KLINE, deadline).await.unwrap();
        assert_eq!(response.pid, Some(0x0D));
        assert_eq!(response.payload, vec![0x3C]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_drops_arrived_bytes() {
        let vehicle = MockVehicle::standard(KLINE);
        let mut transport = MockTransport::new(vehicle);
        let rpm = DiagnosticRequest::current_data(0x0C);
        let speed = DiagnosticRequest::current_data(0x0D);

        transport.send(&encode(&rpm, KLINE).unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.discard_input().await.unwrap();

        transport.send(&encode(&speed, KLINE).unwrap()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(500);
        let reply = read_response(&mut transport, deadline).await.unwrap();
        let response = decode(&reply, KLINE).unwrap();
        assert_eq!(response.pid, Some(0x0D));
    }
}
