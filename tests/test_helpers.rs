//! Test helpers and utilities for integration tests

use bytes::Bytes;
use iot_onboard::config::{ProvisioningSettings, SessionSettings};
use iot_onboard::protocol::DeviceIdentity;
use iot_onboard::testing::{provisioning_responder, MockConnector};
use iot_onboard::workflow::{TelemetrySource, WorkflowOrchestrator};
use std::sync::Arc;
use std::time::Duration;

pub const HUB: &str = "hub.example.net";
pub const DEVICE_ID: &str = "R1";
pub const OPERATION_ID: &str = "4.d0a671905ea5b2c8.e7173b7b";

#[allow(dead_code)]
pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new("0ne00TEST", "R1").expect("valid identity")
}

/// Provisioning settings with millisecond polling and a 2s deadline
#[allow(dead_code)]
pub fn fast_provisioning_settings() -> ProvisioningSettings {
    ProvisioningSettings {
        endpoint: "dps.example.net".to_string(),
        port: 8883,
        poll_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
        keep_alive: Duration::from_secs(30),
        clean_session: true,
    }
}

#[allow(dead_code)]
pub fn fast_session_settings() -> SessionSettings {
    SessionSettings {
        port: 8883,
        ready_timeout: Duration::from_secs(1),
        telemetry_payload: Bytes::from_static(br#"{"status":"online"}"#),
        telemetry_interval: Duration::from_millis(10),
        keep_alive: Duration::from_secs(30),
        clean_session: true,
    }
}

/// Connector whose provisioning service assigns [`HUB`] / [`DEVICE_ID`]
#[allow(dead_code)]
pub fn provisioning_connector() -> MockConnector {
    MockConnector::new().with_responder(provisioning_responder(OPERATION_ID, HUB, DEVICE_ID))
}

#[allow(dead_code)]
pub fn orchestrator(
    connector: MockConnector,
    source: Arc<dyn TelemetrySource>,
) -> WorkflowOrchestrator<MockConnector> {
    WorkflowOrchestrator::new(
        identity(),
        connector,
        fast_provisioning_settings(),
        fast_session_settings(),
        source,
    )
}
