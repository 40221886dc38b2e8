//! Protocol Negotiation
//!
//! Candidates are probed in order with mode 01 PID 00, which every
//! compliant ECU must answer. The first clean positive reply wins. Each
//! probe gets a slice of whatever budget is left, so a candidate that fails
//! fast hands its unused time to the ones after it.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::encode;
use crate::config::BudgetSplit;
use crate::error::ObdError;
use crate::message::DiagnosticRequest;
use crate::protocol::ProtocolId;
use crate::transport::{read_answer, Transport};

/// One probed candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeAttempt {
    pub protocol: ProtocolId,
    /// Time spent on this candidate
    pub elapsed: Duration,
    /// Why the candidate was rejected; `None` for the winner
    pub error: Option<ObdError>,
}

/// Result of a successful negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    /// Protocol the vehicle answered on
    pub protocol: ProtocolId,
    /// Every candidate tried, in order, ending with the winner
    pub attempts: Vec<ProbeAttempt>,
}

impl NegotiationOutcome {
    /// Total time spent probing
    pub fn elapsed(&self) -> Duration {
        self.attempts.iter().map(|a| a.elapsed).sum()
    }
}

/// Find the protocol the vehicle speaks
///
/// `budget` bounds the whole negotiation, not each probe. Link failures
/// (closed or unwritable) abort immediately; anything else rejects just the
/// current candidate.
pub async fn negotiate(
    transport: &mut dyn Transport,
    candidates: &[ProtocolId],
    budget: Duration,
    split: &BudgetSplit,
) -> Result<NegotiationOutcome, ObdError> {
    let started = Instant::now();
    let overall_deadline = started + budget;
    let mut attempts = Vec::with_capacity(candidates.len());

    for (index, &protocol) in candidates.iter().enumerate() {
        let remaining = overall_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(%protocol, "Negotiation budget exhausted");
            break;
        }
        let slice = split.slice(remaining, index, candidates.len());
        debug!(%protocol, slice_ms = slice.as_millis() as u64, "Probing protocol");

        let probe_start = Instant::now();
        let result = probe(transport, protocol, probe_start + slice).await;
        let elapsed = probe_start.elapsed();

        match result {
            Ok(()) => {
                attempts.push(ProbeAttempt {
                    protocol,
                    elapsed,
                    error: None,
                });
                info!(
                    %protocol,
                    tried = attempts.len(),
                    total_ms = started.elapsed().as_millis() as u64,
                    "Protocol negotiated"
                );
                return Ok(NegotiationOutcome { protocol, attempts });
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!(%protocol, error = %e, "Candidate rejected");
                attempts.push(ProbeAttempt {
                    protocol,
                    elapsed,
                    error: Some(e),
                });
            }
        }
    }

    Err(ObdError::NoProtocolMatched {
        tried: attempts.len(),
    })
}

async fn probe(
    transport: &mut dyn Transport,
    protocol: ProtocolId,
    deadline: Instant,
) -> Result<(), ObdError> {
    let request = DiagnosticRequest::supported_pids_probe();
    transport.discard_input().await?;
    transport.select_protocol(protocol).await?;
    transport.send(&encode(&request, protocol)?).await?;
    read_answer(transport, &request, protocol, deadline).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Fault, MockTransport, MockVehicle};

    const CAN11: ProtocolId = ProtocolId::Iso15765_4Can11bit500;
    const KLINE: ProtocolId = ProtocolId::Iso9141_2;

    #[tokio::test(start_paused = true)]
    async fn test_second_candidate_wins_within_budget() {
        let vehicle = MockVehicle::standard(KLINE);
        let mut transport = MockTransport::new(vehicle.clone());
        let budget = Duration::from_millis(4000);

        let outcome = negotiate(&mut transport, &[CAN11, KLINE], budget, &BudgetSplit::Even)
            .await
            .unwrap();

        assert_eq!(outcome.protocol, KLINE);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error, Some(ObdError::LinkTimeout(2000)));
        // Silent CAN probe used its half; the K-line answer came quickly
        assert!(outcome.attempts[0].elapsed >= Duration::from_millis(2000));
        assert!(outcome.attempts[0].elapsed < budget);
        assert!(outcome.attempts[1].elapsed < Duration::from_millis(200));
        assert!(outcome.elapsed() < budget);
        assert_eq!(vehicle.sends(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_candidate_wins_without_probing_rest() {
        let vehicle = MockVehicle::standard(CAN11);
        let mut transport = MockTransport::new(vehicle.clone());

        let outcome = negotiate(
            &mut transport,
            &ProtocolId::AUTO_ORDER,
            Duration::from_millis(9000),
            &BudgetSplit::Even,
        )
        .await
        .unwrap();
        assert_eq!(outcome.protocol, CAN11);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(vehicle.sends(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_split_favours_first_candidate() {
        let vehicle = MockVehicle::standard(KLINE);
        let mut transport = MockTransport::new(vehicle);

        let outcome = negotiate(
            &mut transport,
            &[CAN11, KLINE],
            Duration::from_millis(4000),
            &BudgetSplit::Weighted(vec![3, 1]),
        )
        .await
        .unwrap();
        assert_eq!(outcome.attempts[0].error, Some(ObdError::LinkTimeout(3000)));
        assert_eq!(outcome.protocol, KLINE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidate_answers() {
        let vehicle = MockVehicle::standard(ProtocolId::J1850Pwm);
        let mut transport = MockTransport::new(vehicle);
        let started = Instant::now();

        let err = negotiate(
            &mut transport,
            &[CAN11, KLINE],
            Duration::from_millis(1000),
            &BudgetSplit::Even,
        )
        .await
        .unwrap_err();
        assert_eq!(err, ObdError::NoProtocolMatched { tried: 2 });
        assert!(started.elapsed() < Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_probe_rejects_candidate() {
        let vehicle = MockVehicle::standard(KLINE);
        vehicle.push_fault(Fault::Corrupt);
        let mut transport = MockTransport::new(vehicle);

        let err = negotiate(
            &mut transport,
            &[KLINE],
            Duration::from_millis(1000),
            &BudgetSplit::Even,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "NO_PROTOCOL_MATCHED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_aborts() {
        let vehicle = MockVehicle::standard(KLINE);
        vehicle.push_fault(Fault::Close);
        let mut transport = MockTransport::new(vehicle);

        let err = negotiate(
            &mut transport,
            &[KLINE, CAN11],
            Duration::from_millis(1000),
            &BudgetSplit::Even,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "LINK_CLOSED");
    }
}
