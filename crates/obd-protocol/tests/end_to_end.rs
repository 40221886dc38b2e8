//! Full diagnostic sessions against the simulated vehicle through the public API

use obd_protocol::transport::mock::{Fault, MockConnector, MockVehicle, MOCK_VIN};
use obd_protocol::{
    open_session, ConnectionConfig, ConnectionState, DiagnosticRequest, DtcCategory, ObdError,
    ProtocolId, ProtocolPreference,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn auto_detection_finds_late_protocol_and_reads_everything() {
    let vehicle = MockVehicle::standard(ProtocolId::J1850Vpw);
    let session = open_session(ConnectionConfig::default(), MockConnector::new(vehicle.clone()))
        .await
        .unwrap();
    assert_eq!(session.state(), ConnectionState::Negotiating);

    let protocol = session.negotiate().await.unwrap();
    assert_eq!(protocol, ProtocolId::J1850Vpw);
    assert_eq!(session.state(), ConnectionState::Ready);

    let outcome = session.negotiation().unwrap();
    assert_eq!(outcome.attempts.len(), 8);
    assert!(outcome.attempts[..7].iter().all(|a| a.error.is_some()));
    assert!(outcome.elapsed() <= Duration::from_millis(10_000));

    let info = session.fetch_vehicle_info().await.unwrap();
    assert_eq!(info.vin, MOCK_VIN);
    assert!(info.supported_pids.contains(&0x0C));

    let codes = session.fetch_trouble_codes().await.unwrap();
    let printed: Vec<String> = codes.iter().map(ToString::to_string).collect();
    assert_eq!(printed, vec!["P0123", "C0310"]);
    assert_eq!(codes[1].category, DtcCategory::Chassis);

    let rpm = session.read_sensor(0x0C).await.unwrap();
    assert_eq!(rpm.value, 1726.0);
    assert_eq!(session.state(), ConnectionState::Ready);

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    let err = session.read_sensor(0x0D).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test(start_paused = true)]
async fn transient_faults_are_absorbed_by_retries() {
    let protocol = ProtocolId::Iso15765_4Can29bit500;
    let vehicle = MockVehicle::standard(protocol);
    let config = ConnectionConfig {
        protocol_preference: ProtocolPreference::Ordered(vec![protocol]),
        timeout_ms: 500,
        retry_count: 2,
        ..Default::default()
    };
    let session = open_session(config, MockConnector::new(vehicle.clone()))
        .await
        .unwrap();
    session.negotiate().await.unwrap();

    vehicle.push_fault(Fault::Silent);
    vehicle.push_fault(Fault::NoData);
    let response = session
        .send_request(&DiagnosticRequest::current_data(0x0D))
        .await
        .unwrap();
    assert_eq!(response.payload, vec![0x3C]);
    assert_eq!(session.stats().retries, 2);

    vehicle.push_fault(Fault::Negative(0x12));
    let err = session
        .send_request(&DiagnosticRequest::current_data(0x0D))
        .await
        .unwrap_err();
    assert!(matches!(err, ObdError::NegativeResponse { nrc: 0x12, .. }));
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn dropped_link_needs_reset() {
    let protocol = ProtocolId::Iso14230_4Kwp;
    let vehicle = MockVehicle::standard(protocol);
    let config = ConnectionConfig {
        protocol_preference: ProtocolPreference::Ordered(vec![protocol]),
        ..Default::default()
    };
    let session = open_session(config, MockConnector::new(vehicle.clone()))
        .await
        .unwrap();
    session.negotiate().await.unwrap();

    vehicle.push_fault(Fault::Close);
    let err = session.read_sensor(0x05).await.unwrap_err();
    assert_eq!(err.code(), "LINK_CLOSED");
    assert_eq!(session.state(), ConnectionState::Error);

    session.reset().await;
    assert_eq!(session.state(), ConnectionState::Idle);
    session.connect().await.unwrap();
    session.negotiate().await.unwrap();
    let coolant = session.read_sensor(0x05).await.unwrap();
    assert_eq!(coolant.value, 83.0);
    assert_eq!(vehicle.opens(), 2);
}
