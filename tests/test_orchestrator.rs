//! End-to-end workflow through the orchestrator with scripted services

mod test_helpers;

use bytes::Bytes;
use iot_onboard::error::{ProvisioningError, SessionError, TransportError};
use iot_onboard::testing::{MockConnector, ScriptedTelemetrySource};
use iot_onboard::transport::{ConnectionState, InboundPacket};
use iot_onboard::workflow::{SessionPhase, TelemetrySource, WorkflowOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_helpers::*;

fn idle_source() -> Arc<dyn TelemetrySource> {
    Arc::new(ScriptedTelemetrySource::new(Vec::<Bytes>::new()).hold_open())
}

#[tokio::test]
async fn test_full_workflow_provisions_and_sends() {
    let orchestrator = orchestrator(provisioning_connector(), idle_source());

    let assignment = orchestrator.start_provisioning().await.unwrap();
    assert_eq!(assignment.endpoint, HUB);
    assert_eq!(assignment.device_id, DEVICE_ID);

    orchestrator.start_session().await.unwrap();
    orchestrator.send_telemetry_once(None).await.unwrap();

    assert_eq!(
        orchestrator.current_outcome(),
        WorkflowOutcome {
            is_provisioned: true,
            is_session_connected: true,
            sent_count: 1,
            acked_count: 1,
            periodic_telemetry_enabled: false,
        }
    );

    let transports = orchestrator.connector().transports();
    assert_eq!(transports.len(), 2, "one provisioning and one hub connection");
    assert_eq!(transports[0].disconnect_count(), 1, "provisioning link closed");

    let hub = &transports[1];
    assert_eq!(hub.options().host, HUB);
    assert_eq!(hub.subscriptions().len(), 3);
    let telemetry = hub.published_to("devices/R1/messages/events/");
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0].payload, Bytes::from_static(br#"{"status":"online"}"#));

    orchestrator.end_session().await;
    assert_eq!(hub.disconnect_count(), 1);
    assert!(!orchestrator.current_outcome().is_session_connected);
}

#[tokio::test]
async fn test_explicit_payload_overrides_default() {
    let orchestrator = orchestrator(provisioning_connector(), idle_source());
    orchestrator.start_provisioning().await.unwrap();
    orchestrator.start_session().await.unwrap();

    orchestrator
        .send_telemetry_once(Some(Bytes::from_static(b"{\"temp\":21}")))
        .await
        .unwrap();

    let hub = orchestrator.connector().last_transport().unwrap();
    let telemetry = hub.published_to("devices/R1/messages/events/");
    assert_eq!(telemetry[0].payload, Bytes::from_static(b"{\"temp\":21}"));
}

#[tokio::test]
async fn test_unacknowledged_sends_stay_outstanding() {
    let connector = provisioning_connector().without_publish_acks();
    let orchestrator = orchestrator(connector, idle_source());
    orchestrator.start_provisioning().await.unwrap();
    orchestrator.start_session().await.unwrap();

    for _ in 0..3 {
        orchestrator.send_telemetry_once(None).await.unwrap();
    }
    let hub = orchestrator.connector().last_transport().unwrap();
    hub.deliver(InboundPacket::PubAck { packet_id: 10 });
    hub.deliver(InboundPacket::PubAck { packet_id: 11 });

    let outcome = orchestrator.current_outcome();
    assert_eq!(outcome.sent_count, 3);
    assert_eq!(outcome.acked_count, 2);
}

#[tokio::test]
async fn test_provisioning_times_out_without_service() {
    let orchestrator = orchestrator(MockConnector::new(), idle_source());

    let started = Instant::now();
    let result = orchestrator.start_provisioning().await;

    assert!(matches!(result, Err(ProvisioningError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(orchestrator.assignment().is_none());
    assert!(!orchestrator.current_outcome().is_provisioned);

    let transport = orchestrator.connector().last_transport().unwrap();
    assert_eq!(transport.disconnect_count(), 1, "link closed after timeout");
}

#[tokio::test]
async fn test_provisioning_connect_failure() {
    let orchestrator = orchestrator(MockConnector::new().failing_connect(), idle_source());

    let result = orchestrator.start_provisioning().await;
    assert!(matches!(
        result,
        Err(ProvisioningError::TransportConnect { .. })
    ));
}

#[tokio::test]
async fn test_session_requires_provisioning() {
    let orchestrator = orchestrator(provisioning_connector(), idle_source());

    let result = orchestrator.start_session().await;
    assert!(matches!(result, Err(SessionError::NotProvisioned)));
    assert!(orchestrator.connector().transports().is_empty());
}

#[tokio::test]
async fn test_telemetry_without_session() {
    let orchestrator = orchestrator(provisioning_connector(), idle_source());

    let result = orchestrator.send_telemetry_once(None).await;
    assert!(matches!(
        result,
        Err(TransportError::NotConnected {
            state: ConnectionState::Idle
        })
    ));
    assert_eq!(orchestrator.current_outcome(), WorkflowOutcome::default());
}

#[tokio::test]
async fn test_toggle_without_session_flips_each_call() {
    let orchestrator = orchestrator(provisioning_connector(), idle_source());

    let before = orchestrator.current_outcome().periodic_telemetry_enabled;
    let first = orchestrator.toggle_periodic_telemetry().await;
    assert_eq!(first, !before);
    assert_eq!(orchestrator.current_outcome().periodic_telemetry_enabled, first);

    let second = orchestrator.toggle_periodic_telemetry().await;
    assert_eq!(second, before);
    assert_eq!(orchestrator.current_outcome(), WorkflowOutcome::default());
}

#[tokio::test]
async fn test_toggle_before_session_starts_periodic_on_connect() {
    let source = Arc::new(ScriptedTelemetrySource::new(vec!["early"]).hold_open());
    let orchestrator = orchestrator(provisioning_connector(), source);

    assert!(orchestrator.toggle_periodic_telemetry().await);
    orchestrator.start_provisioning().await.unwrap();
    orchestrator.start_session().await.unwrap();
    assert!(orchestrator.current_outcome().periodic_telemetry_enabled);

    let mut changes = orchestrator.outcome_changes();
    tokio::time::timeout(Duration::from_secs(2), async {
        while orchestrator.current_outcome().acked_count < 1 {
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("held toggle applied to the new session");

    let hub = orchestrator.connector().last_transport().unwrap();
    let telemetry = hub.published_to("devices/R1/messages/events/");
    assert_eq!(telemetry[0].payload, Bytes::from_static(b"early"));

    assert!(!orchestrator.toggle_periodic_telemetry().await);
}

#[tokio::test]
async fn test_periodic_toggle_through_orchestrator() {
    let source = Arc::new(ScriptedTelemetrySource::new(vec!["a", "b"]).hold_open());
    let orchestrator = orchestrator(provisioning_connector(), source);
    orchestrator.start_provisioning().await.unwrap();
    orchestrator.start_session().await.unwrap();

    let mut changes = orchestrator.outcome_changes();
    assert!(orchestrator.toggle_periodic_telemetry().await);
    tokio::time::timeout(Duration::from_secs(2), async {
        while orchestrator.current_outcome().acked_count < 2 {
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("periodic samples acknowledged");

    let outcome = orchestrator.current_outcome();
    assert!(outcome.periodic_telemetry_enabled);
    assert_eq!(outcome.sent_count, 2);

    assert!(!orchestrator.toggle_periodic_telemetry().await);
    assert!(!orchestrator.current_outcome().periodic_telemetry_enabled);
}

#[tokio::test]
async fn test_hub_loss_is_visible_in_outcome() {
    let orchestrator = orchestrator(provisioning_connector(), idle_source());
    orchestrator.start_provisioning().await.unwrap();
    orchestrator.start_session().await.unwrap();
    let handle = orchestrator.session_handle().expect("session running");

    let hub = orchestrator.connector().last_transport().unwrap();
    hub.set_state(ConnectionState::Disconnected("keep-alive timeout".to_string()));

    assert_eq!(handle.phase(), SessionPhase::Idle);
    let outcome = orchestrator.current_outcome();
    assert!(outcome.is_provisioned);
    assert!(!outcome.is_session_connected);
}

#[tokio::test]
async fn test_outcome_changes_survive_unobserved_updates() {
    let orchestrator = orchestrator(provisioning_connector(), idle_source());
    orchestrator.start_provisioning().await.unwrap();
    orchestrator.start_session().await.unwrap();

    let mut changes = orchestrator.outcome_changes();
    let seen = *changes.borrow_and_update();

    // Nobody awaits the receiver while these land
    orchestrator.send_telemetry_once(None).await.unwrap();
    orchestrator.send_telemetry_once(None).await.unwrap();

    assert!(changes.has_changed().unwrap());
    assert!(*changes.borrow_and_update() >= seen + 2);
    assert_eq!(orchestrator.current_outcome().acked_count, 2);
}

#[tokio::test]
async fn test_cancelled_provisioning_releases_link() {
    // No responder: the service never assigns
    let orchestrator = orchestrator(MockConnector::new(), idle_source());

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), orchestrator.start_provisioning()).await;
    assert!(cancelled.is_err(), "still waiting for an assignment");

    let transport = orchestrator.connector().last_transport().unwrap();
    assert_eq!(transport.release_count(), 1, "link dropped with the future");

    let state = orchestrator.provisioning_state().expect("attempt recorded");
    assert!(!state.provisioned);
    assert!(state.assignment.is_none());
    assert!(orchestrator.assignment().is_none());
    assert!(!orchestrator.current_outcome().is_provisioned);

    assert!(matches!(
        orchestrator.start_session().await,
        Err(SessionError::NotProvisioned)
    ));
}

#[tokio::test]
async fn test_cancelled_session_start_releases_link() {
    // The hub never acknowledges the connection
    let connector = provisioning_connector().acknowledge_first(1);
    let orchestrator = orchestrator(connector, idle_source());
    orchestrator.start_provisioning().await.unwrap();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), orchestrator.start_session()).await;
    assert!(cancelled.is_err(), "still waiting for the hub");

    let hub = orchestrator.connector().last_transport().unwrap();
    assert_eq!(hub.options().host, HUB);
    assert_eq!(hub.release_count(), 1, "link dropped with the future");

    assert!(orchestrator.session_handle().is_none());
    let outcome = orchestrator.current_outcome();
    assert!(outcome.is_provisioned);
    assert!(!outcome.is_session_connected);
    assert_eq!(outcome.sent_count, 0);
}
