//! Diagnostic Session
//!
//! The session owns the adapter link and walks it through its lifecycle:
//!
//! ```text
//! Idle -> Scanning -> Pairing -> Negotiating -> Ready <-> Active
//!            \           \            \           \
//!             +-----------+------------+-----------+--> Error
//! any state --disconnect--> Closed        any state --reset--> Idle
//! ```
//!
//! Methods take `&self` so one session can be shared across tasks. At most
//! one request is in flight; a second caller gets `SessionBusy` instead of
//! queueing behind the first.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::encode;
use crate::config::ConnectionConfig;
use crate::decoder::{decode_dtcs, decode_supported_pids, decode_vin, vin_payload, DtcCode, VehicleInfo};
use crate::error::ObdError;
use crate::message::{DiagnosticRequest, DiagnosticResponse};
use crate::negotiator::{self, NegotiationOutcome};
use crate::pid::{decode_sensor, SensorReading};
use crate::protocol::ProtocolId;
use crate::transport::{read_answer, Connector, DeviceInfo, Transport};
use crate::{info_pid, mode};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Pairing,
    Negotiating,
    Ready,
    Active,
    Error,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Pairing => "Pairing",
            ConnectionState::Negotiating => "Negotiating",
            ConnectionState::Ready => "Ready",
            ConnectionState::Active => "Active",
            ConnectionState::Error => "Error",
            ConnectionState::Closed => "Closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters over the life of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Requests accepted by `send_request`
    pub requests: u64,
    /// Frames written, including re-sends
    pub sends: u64,
    /// Re-sends after a timeout or corrupt reply
    pub retries: u64,
    /// Requests that ended in an error
    pub failures: u64,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    request: DiagnosticRequest,
    attempts: u32,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    protocol: Option<ProtocolId>,
    device: Option<DeviceInfo>,
    pending: Option<PendingRequest>,
    vehicle_info: Option<VehicleInfo>,
    negotiation: Option<NegotiationOutcome>,
    stats: SessionStats,
}

impl Inner {
    fn transition(&mut self, to: ConnectionState) {
        if self.state != to {
            info!(from = %self.state, to = %to, "Session state changed");
            self.state = to;
        }
    }

    /// Enter Error if the session is still in the state the failed step ran in
    ///
    /// A `disconnect` or `reset` from another task has already moved the
    /// session on, and its state stands.
    fn fail(&mut self, during: ConnectionState, error: &ObdError) {
        if self.state == during {
            warn!(error = %error, code = error.code(), "Session failed");
            self.transition(ConnectionState::Error);
        } else {
            debug!(state = %self.state, error = %error, "Failure after session moved on");
        }
    }

    fn invalid(&self, operation: &'static str) -> ObdError {
        ObdError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }
}

/// A diagnostic session with one vehicle
pub struct Session {
    config: ConnectionConfig,
    connector: Box<dyn Connector>,
    inner: Mutex<Inner>,
    link: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    cancel: Mutex<CancellationToken>,
}

/// Returns Active to Ready when a request ends, however it ends
struct ActiveGuard<'a> {
    session: &'a Session,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.inner();
        inner.pending = None;
        if inner.state == ConnectionState::Active {
            inner.transition(ConnectionState::Ready);
        }
    }
}

/// Create a session and bring the link up to negotiation
///
/// Fails with `BluetoothUnavailable` or `DeviceNotFound` when no adapter can
/// be reached; the protocol is negotiated separately with
/// [`Session::negotiate`].
pub async fn open_session(
    config: ConnectionConfig,
    connector: impl Connector + 'static,
) -> Result<Session, ObdError> {
    let session = Session::new(config, connector);
    session.connect().await?;
    Ok(session)
}

impl Session {
    /// Create an idle session; nothing touches the link until [`connect`](Self::connect)
    pub fn new(config: ConnectionConfig, connector: impl Connector + 'static) -> Self {
        Self {
            config,
            connector: Box::new(connector),
            inner: Mutex::new(Inner::default()),
            link: tokio::sync::Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    /// Negotiated protocol, once negotiation has succeeded
    pub fn protocol(&self) -> Option<ProtocolId> {
        self.inner().protocol
    }

    /// Adapter the link was opened to
    pub fn device(&self) -> Option<DeviceInfo> {
        self.inner().device.clone()
    }

    /// Details of the last successful negotiation
    pub fn negotiation(&self) -> Option<NegotiationOutcome> {
        self.inner().negotiation.clone()
    }

    /// Request currently in flight, if any
    pub fn pending_request(&self) -> Option<DiagnosticRequest> {
        self.inner().pending.as_ref().map(|p| p.request.clone())
    }

    /// Frames sent so far for the request in flight
    pub fn pending_attempts(&self) -> Option<u32> {
        self.inner().pending.as_ref().map(|p| p.attempts)
    }

    pub fn stats(&self) -> SessionStats {
        self.inner().stats
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Discover the adapter and open the link (Idle -> Negotiating)
    pub async fn connect(&self) -> Result<(), ObdError> {
        self.config.validate()?;
        {
            let mut inner = self.inner();
            if inner.state != ConnectionState::Idle {
                return Err(inner.invalid("connect"));
            }
            inner.transition(ConnectionState::Scanning);
        }
        let cancel = self.cancel_token();

        let device = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ObdError::LinkClosed("session disconnected".to_string())),
            found = self.connector.discover(&self.config.device) => found,
        };
        let device = match device {
            Ok(device) => device,
            Err(e) => {
                self.inner().fail(ConnectionState::Scanning, &e);
                return Err(e);
            }
        };

        {
            let mut inner = self.inner();
            if inner.state != ConnectionState::Scanning {
                return Err(ObdError::LinkClosed("session disconnected".to_string()));
            }
            inner.device = Some(device.clone());
            inner.transition(ConnectionState::Pairing);
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ObdError::LinkClosed("session disconnected".to_string())),
            opened = self.connector.open(&device, &self.config.device) => opened,
        };
        let mut transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                self.inner().fail(ConnectionState::Pairing, &e);
                return Err(e);
            }
        };

        let mut link = self.link.lock().await;
        let still_pairing = {
            let mut inner = self.inner();
            let pairing = inner.state == ConnectionState::Pairing;
            if pairing {
                inner.transition(ConnectionState::Negotiating);
            }
            pairing
        };
        if !still_pairing {
            transport.close().await;
            return Err(ObdError::LinkClosed("session disconnected".to_string()));
        }
        *link = Some(transport);
        info!(device = %device.name, kind = %device.kind, "Link open");
        Ok(())
    }

    /// Negotiate the bus protocol (Negotiating -> Ready)
    ///
    /// Once a protocol is set it is returned without probing again; a
    /// different protocol needs [`reset`](Self::reset).
    pub async fn negotiate(&self) -> Result<ProtocolId, ObdError> {
        let mut link = self.link.lock().await;
        {
            let inner = self.inner();
            match (inner.state, inner.protocol) {
                (ConnectionState::Ready | ConnectionState::Active, Some(protocol)) => {
                    return Ok(protocol)
                }
                (ConnectionState::Negotiating, _) => {}
                _ => return Err(inner.invalid("negotiate")),
            }
        }
        let transport = link
            .as_mut()
            .ok_or_else(|| ObdError::LinkClosed("no open link".to_string()))?;

        let candidates = self.config.protocol_preference.candidates();
        let cancel = self.cancel_token();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ObdError::LinkClosed("session disconnected".to_string())),
            outcome = negotiator::negotiate(
                transport.as_mut(),
                &candidates,
                self.config.negotiation_budget(),
                &self.config.negotiation_split,
            ) => outcome,
        };

        let mut inner = self.inner();
        match result {
            Ok(outcome) => {
                let protocol = outcome.protocol;
                if inner.state != ConnectionState::Negotiating {
                    return Err(inner.invalid("negotiate"));
                }
                inner.protocol = Some(protocol);
                inner.negotiation = Some(outcome);
                inner.transition(ConnectionState::Ready);
                Ok(protocol)
            }
            Err(e) => {
                inner.fail(ConnectionState::Negotiating, &e);
                Err(e)
            }
        }
    }

    /// Send one request and wait for its reply, retrying transient failures
    pub async fn send_request(
        &self,
        request: &DiagnosticRequest,
    ) -> Result<DiagnosticResponse, ObdError> {
        if !mode::is_read_only(request.mode) {
            return Err(ObdError::ModeNotAllowed(request.mode));
        }
        request.validate()?;

        let protocol = {
            let mut inner = self.inner();
            match inner.state {
                ConnectionState::Ready => {}
                ConnectionState::Active => return Err(ObdError::SessionBusy),
                _ => return Err(inner.invalid("send_request")),
            }
            let protocol = inner.protocol.ok_or_else(|| inner.invalid("send_request"))?;
            inner.transition(ConnectionState::Active);
            inner.pending = Some(PendingRequest {
                request: request.clone(),
                attempts: 0,
            });
            inner.stats.requests += 1;
            protocol
        };
        let _active = ActiveGuard { session: self };

        let result = self.run_request(request, protocol).await;
        if let Err(e) = &result {
            self.inner().stats.failures += 1;
            debug!(mode = request.mode, error = %e, "Request failed");
        }
        result
    }

    async fn run_request(
        &self,
        request: &DiagnosticRequest,
        protocol: ProtocolId,
    ) -> Result<DiagnosticResponse, ObdError> {
        let frame = encode(request, protocol)?;
        let cancel = self.cancel_token();

        let mut link = self.link.lock().await;
        let Some(transport) = link.as_mut() else {
            return Err(ObdError::LinkClosed("no open link".to_string()));
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ObdError::LinkClosed("session disconnected".to_string())),
            result = self.exchange(transport.as_mut(), request, protocol, &frame) => result,
        };

        // Still holding the link, so a concurrent reset sees the final state
        if let Err(e) = &result {
            if e.is_fatal() {
                self.inner().fail(ConnectionState::Active, e);
            }
        }
        drop(link);
        result
    }

    /// Send `frame` until a usable reply arrives or the retry policy gives up
    async fn exchange(
        &self,
        transport: &mut dyn Transport,
        request: &DiagnosticRequest,
        protocol: ProtocolId,
        frame: &[u8],
    ) -> Result<DiagnosticResponse, ObdError> {
        let mut attempts = 0u32;
        let mut timeouts = 0u32;
        let mut corrupt_resent = false;

        loop {
            attempts += 1;
            {
                let mut inner = self.inner();
                inner.stats.sends += 1;
                if let Some(pending) = inner.pending.as_mut() {
                    pending.attempts = attempts;
                }
            }

            transport.discard_input().await?;
            transport.send(frame).await?;
            let deadline = Instant::now() + self.config.timeout();
            let error = match read_answer(transport, request, protocol, deadline).await {
                Ok(response) => {
                    debug!(mode = request.mode, pid = ?request.pid, attempts, "Request answered");
                    return Ok(response);
                }
                Err(e) => e,
            };

            if error.is_retryable() {
                if timeouts >= self.config.retry_count {
                    return Err(ObdError::RequestTimeout {
                        mode: request.mode,
                        attempts,
                    });
                }
                timeouts += 1;
            } else if error.is_corruption() {
                if corrupt_resent {
                    return Err(ObdError::ProtocolDecode(error.to_string()));
                }
                corrupt_resent = true;
            } else {
                return Err(error);
            }

            warn!(mode = request.mode, attempt = attempts, error = %error, "Re-sending request");
            self.inner().stats.retries += 1;
            let delay = self.config.retry_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Supported PIDs and VIN, read once and cached until `reset`
    pub async fn fetch_vehicle_info(&self) -> Result<VehicleInfo, ObdError> {
        let cached = self.inner().vehicle_info.clone();
        if let Some(info) = cached {
            return Ok(info);
        }

        let mut supported_pids = BTreeSet::new();
        let mut base = 0x00u8;
        loop {
            let response = self
                .send_request(&DiagnosticRequest::current_data(base))
                .await?;
            let pids = decode_supported_pids(base, &response.payload)?;
            let next = base.checked_add(0x20);
            let chained = next.filter(|n| pids.contains(n));
            supported_pids.extend(pids);
            match chained {
                Some(n) => base = n,
                None => break,
            }
        }

        let response = self
            .send_request(&DiagnosticRequest::vehicle_info(info_pid::VIN))
            .await?;
        let vin = decode_vin(&vin_payload(&response))?;

        let info = VehicleInfo {
            vin,
            supported_pids,
        };
        info!(vin = %info.vin, pids = info.supported_pids.len(), "Vehicle identified");
        self.inner().vehicle_info = Some(info.clone());
        Ok(info)
    }

    /// Stored trouble codes (mode 03)
    pub async fn fetch_trouble_codes(&self) -> Result<Vec<DtcCode>, ObdError> {
        self.fetch_dtcs(DiagnosticRequest::stored_dtcs()).await
    }

    /// Pending trouble codes from the current drive cycle (mode 07)
    pub async fn fetch_pending_trouble_codes(&self) -> Result<Vec<DtcCode>, ObdError> {
        self.fetch_dtcs(DiagnosticRequest::pending_dtcs()).await
    }

    async fn fetch_dtcs(&self, request: DiagnosticRequest) -> Result<Vec<DtcCode>, ObdError> {
        let response = self.send_request(&request).await?;
        // CAN replies lead with the number of codes
        let units = if response.meta.protocol.is_can() {
            response.payload.get(1..).unwrap_or_default()
        } else {
            &response.payload[..]
        };
        let codes = decode_dtcs(units);
        debug!(mode = request.mode, count = codes.len(), "Trouble codes read");
        Ok(codes)
    }

    /// Read one live sensor value (mode 01)
    pub async fn read_sensor(&self, pid: u8) -> Result<SensorReading, ObdError> {
        let response = self
            .send_request(&DiagnosticRequest::current_data(pid))
            .await?;
        decode_sensor(pid, &response.payload)
    }

    /// Close the link from any state; safe to call repeatedly
    ///
    /// A request or negotiation in progress on another task ends with
    /// `LinkClosed`.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner();
            inner.pending = None;
            inner.transition(ConnectionState::Closed);
        }
        self.cancel_token().cancel();

        let mut link = self.link.lock().await;
        if let Some(mut transport) = link.take() {
            transport.close().await;
            info!("Link closed");
        }
    }

    /// Tear down and return to Idle, forgetting protocol and cached info
    pub async fn reset(&self) {
        self.cancel_token().cancel();

        let mut link = self.link.lock().await;
        if let Some(mut transport) = link.take() {
            transport.close().await;
        }

        let mut inner = self.inner();
        let stats = inner.stats;
        *inner = Inner {
            stats,
            ..Inner::default()
        };
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        info!("Session reset");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("Session")
            .field("state", &inner.state)
            .field("protocol", &inner.protocol)
            .field("stats", &inner.stats)
            .finish()
    }
}
