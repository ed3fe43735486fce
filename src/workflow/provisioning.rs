//! Provisioning coordinator
//!
//! Drives the registration handshake: connect, subscribe for replies, send the
//! registration request, poll with the latest operation id, and resolve once
//! the service assigns a hub, rejects the device, or the link drops.
//!
//! Transport callbacks mutate a [`ProvisioningState`] held in a watch channel;
//! the control task waits on that channel instead of spinning.

use crate::config::ProvisioningSettings;
use crate::error::{ProvisioningError, TransportError};
use crate::protocol::provisioning::{
    derive_provisioning_credentials, parse_registration_reply, Assignment, ProvisioningTopics,
    RegistrationReply, ResponseError,
};
use crate::protocol::DeviceIdentity;
use crate::transport::mqtt::MessageHandler;
use crate::transport::{
    ConnectOptions, ConnectionState, Connector, InboundPacket, QoS, Transport, TransportDelegate,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Service rejection recorded on the state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub message: String,
}

/// Observable state of one provisioning attempt
///
/// `provisioned` and `assignment` are always set together, once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningState {
    pub connected: bool,
    /// Latest accepted operation id; `None` until the first reply
    pub operation_id: Option<String>,
    pub provisioned: bool,
    pub assignment: Option<Assignment>,
    /// Retry hint from the latest accepted reply
    pub retry_after: Option<Duration>,
    pub rejection: Option<Rejection>,
    /// Reason the link closed before the device was provisioned
    pub link_failure: Option<String>,
}

impl ProvisioningState {
    /// True once the handshake cannot make further progress
    pub fn is_terminal(&self) -> bool {
        self.provisioned || self.rejection.is_some() || self.link_failure.is_some()
    }

    fn resolve(self) -> Result<Assignment, ProvisioningError> {
        if let Some(assignment) = self.assignment {
            return Ok(assignment);
        }
        if let Some(rejection) = self.rejection {
            return Err(ProvisioningError::rejected(rejection.status, rejection.message));
        }
        Err(ProvisioningError::transport_connect(
            self.link_failure
                .unwrap_or_else(|| "connection closed".to_string()),
        ))
    }
}

/// Transport delegate that owns the provisioning state
struct ProvisioningEvents {
    registration_id: String,
    state: watch::Sender<ProvisioningState>,
}

impl ProvisioningEvents {
    fn new(registration_id: String) -> Self {
        let (state, _) = watch::channel(ProvisioningState::default());
        Self {
            registration_id,
            state,
        }
    }

    fn on_inbound_packet(&self, packet: InboundPacket) {
        match packet {
            InboundPacket::ConnAck { session_present } => {
                info!(registration_id = %self.registration_id, session_present, "Provisioning connection acknowledged");
                self.state.send_modify(|state| state.connected = true);
            }
            InboundPacket::Publish { topic, payload } => {
                debug!(registration_id = %self.registration_id, topic = %topic, bytes = payload.len(), "Registration reply received");
                match parse_registration_reply(&topic, &payload) {
                    Ok(reply) => self.apply_reply(reply),
                    Err(e) => {
                        warn!(registration_id = %self.registration_id, topic = %topic, error = %e, "Discarding registration reply");
                    }
                }
            }
            InboundPacket::SubAck {
                packet_id,
                return_codes,
            } => match MessageHandler::validate_subscription_success(&return_codes) {
                Ok(()) => info!(registration_id = %self.registration_id, packet_id, "Registration reply subscription acknowledged"),
                Err(e) => warn!(registration_id = %self.registration_id, packet_id, error = %e, "Registration reply subscription refused"),
            },
            other => {
                debug!(registration_id = %self.registration_id, kind = other.kind(), "Ignoring packet");
            }
        }
    }

    fn apply_reply(&self, reply: RegistrationReply) {
        match reply {
            RegistrationReply::Progress(response) => {
                self.state.send_if_modified(|state| {
                    if state.provisioned || state.rejection.is_some() {
                        debug!(registration_id = %self.registration_id, operation_id = %response.operation_id, "Handshake already resolved, ignoring reply");
                        return false;
                    }
                    if let Some(expected) = &state.operation_id {
                        if *expected != response.operation_id {
                            let error = ResponseError::OperationMismatch {
                                expected: expected.clone(),
                                received: response.operation_id.clone(),
                            };
                            warn!(registration_id = %self.registration_id, error = %error, "Discarding registration reply");
                            return false;
                        }
                    }

                    state.operation_id = Some(response.operation_id.clone());
                    state.retry_after = response.retry_after;
                    if let Some(assignment) = response.assignment {
                        info!(
                            registration_id = %self.registration_id,
                            endpoint = %assignment.endpoint,
                            device_id = %assignment.device_id,
                            "Device provisioned"
                        );
                        state.assignment = Some(assignment);
                        state.provisioned = true;
                    } else {
                        debug!(
                            registration_id = %self.registration_id,
                            operation_id = %response.operation_id,
                            status = ?response.operation_status,
                            "Registration in progress"
                        );
                    }
                    true
                });
            }
            RegistrationReply::Failure(failure) => {
                self.state.send_if_modified(|state| {
                    if state.provisioned || state.rejection.is_some() {
                        return false;
                    }
                    warn!(
                        registration_id = %self.registration_id,
                        status = failure.status_code,
                        error_code = ?failure.error_code,
                        tracking_id = ?failure.tracking_id,
                        message = %failure.message,
                        "Registration rejected"
                    );
                    state.rejection = Some(Rejection {
                        status: failure.status_code,
                        message: failure.message,
                    });
                    true
                });
            }
        }
    }
}

impl TransportDelegate for ProvisioningEvents {
    fn on_packet(&self, packet: InboundPacket) {
        self.on_inbound_packet(packet);
    }

    fn on_connection_state_change(&self, connection: ConnectionState) {
        debug!(registration_id = %self.registration_id, state = ?connection, "Provisioning connection state changed");
        if let ConnectionState::Disconnected(reason) = connection {
            self.state.send_modify(|state| {
                state.connected = false;
                if !state.provisioned && state.link_failure.is_none() {
                    state.link_failure = Some(reason);
                }
            });
        }
    }

    fn on_error(&self, error: &TransportError) {
        warn!(registration_id = %self.registration_id, error = %error, "Provisioning transport error");
    }
}

async fn next_terminal(
    rx: &mut watch::Receiver<ProvisioningState>,
) -> Result<ProvisioningState, ProvisioningError> {
    rx.wait_for(ProvisioningState::is_terminal)
        .await
        .map(|state| state.clone())
        .map_err(|_| ProvisioningError::NotConnected)
}

/// Drives one provisioning attempt over a transport of type `T`
pub struct ProvisioningCoordinator<T: Transport> {
    identity: DeviceIdentity,
    settings: ProvisioningSettings,
    events: Arc<ProvisioningEvents>,
    transport: Option<T>,
    next_request_id: AtomicU64,
}

impl<T: Transport> ProvisioningCoordinator<T> {
    pub fn new(identity: DeviceIdentity, settings: ProvisioningSettings) -> Self {
        let events = Arc::new(ProvisioningEvents::new(
            identity.registration_id().to_string(),
        ));
        Self {
            identity,
            settings,
            events,
            transport: None,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Open the provisioning connection. A fresh state replaces any previous attempt.
    pub async fn begin<C>(&mut self, connector: &C) -> Result<(), ProvisioningError>
    where
        C: Connector<Transport = T>,
    {
        self.end().await;
        self.events.state.send_replace(ProvisioningState::default());

        let credentials = derive_provisioning_credentials(&self.identity);
        let options = ConnectOptions::new(&self.settings.endpoint, self.settings.port, credentials)
            .with_keep_alive(self.settings.keep_alive)
            .with_clean_session(self.settings.clean_session);

        let transport = connector
            .build(options)
            .map_err(|e| ProvisioningError::transport_connect(e.to_string()))?;
        transport.set_delegate(self.events.clone());
        transport
            .connect()
            .await
            .map_err(|e| ProvisioningError::transport_connect(e.to_string()))?;

        info!(
            registration_id = %self.identity.registration_id(),
            endpoint = %self.settings.endpoint,
            "Provisioning connection started"
        );
        self.transport = Some(transport);
        Ok(())
    }

    /// Wait for the broker to acknowledge the connection
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ProvisioningError> {
        let mut rx = self.events.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| state.connected || state.is_terminal()),
        )
        .await;

        let state = match waited {
            Err(_) => return Err(ProvisioningError::timeout(timeout)),
            Ok(Err(_)) => return Err(ProvisioningError::NotConnected),
            Ok(Ok(state)) => state.clone(),
        };

        if state.connected {
            Ok(())
        } else {
            state.resolve().map(|_| ())
        }
    }

    pub async fn subscribe_for_responses(&self) -> Result<(), ProvisioningError> {
        let transport = self.connected_transport()?;
        transport
            .subscribe(ProvisioningTopics::RESPONSE_FILTER, QoS::AtLeastOnce)
            .await?;
        Ok(())
    }

    pub async fn request_registration(&self) -> Result<(), ProvisioningError> {
        let transport = self.connected_transport()?;
        let topic = ProvisioningTopics::register(self.request_id());

        info!(registration_id = %self.identity.registration_id(), topic = %topic, "Requesting registration");
        transport
            .publish(&topic, Bytes::new(), QoS::AtLeastOnce, false)
            .await?;
        Ok(())
    }

    /// Query the operation status after the configured initial delay
    pub async fn poll_registration(&self, operation_id: &str) -> Result<(), ProvisioningError> {
        tokio::time::sleep(self.settings.poll_delay).await;
        self.publish_query(operation_id).await
    }

    async fn publish_query(&self, operation_id: &str) -> Result<(), ProvisioningError> {
        let transport = self.connected_transport()?;
        let topic = ProvisioningTopics::query(self.request_id(), operation_id);

        debug!(registration_id = %self.identity.registration_id(), operation_id = %operation_id, "Polling registration status");
        transport
            .publish(&topic, Bytes::new(), QoS::AtLeastOnce, false)
            .await?;
        Ok(())
    }

    /// Wait for a terminal state: assigned, rejected, or link lost
    pub async fn wait_until_provisioned(
        &self,
        timeout: Duration,
    ) -> Result<Assignment, ProvisioningError> {
        let mut rx = self.events.state.subscribe();
        let waited =
            tokio::time::timeout(timeout, rx.wait_for(ProvisioningState::is_terminal)).await;

        match waited {
            Err(_) => Err(ProvisioningError::timeout(timeout)),
            Ok(Err(_)) => Err(ProvisioningError::NotConnected),
            Ok(Ok(state)) => state.clone().resolve(),
        }
    }

    /// Poll with the latest operation id until the handshake resolves.
    ///
    /// The first query goes through [`poll_registration`](Self::poll_registration)
    /// and so waits `poll_delay`; later queries are spaced by the larger of the
    /// service's retry-after hint and `poll_interval`. Has no deadline of its
    /// own; callers bound it with a timeout.
    pub async fn poll_until_provisioned(&self) -> Result<Assignment, ProvisioningError> {
        let mut rx = self.events.state.subscribe();

        let state = rx
            .wait_for(|state| state.is_terminal() || state.operation_id.is_some())
            .await
            .map_err(|_| ProvisioningError::NotConnected)?
            .clone();
        if state.is_terminal() {
            return state.resolve();
        }
        let Some(operation_id) = state.operation_id else {
            return Err(ProvisioningError::NotConnected);
        };

        tokio::select! {
            resolved = next_terminal(&mut rx) => return resolved?.resolve(),
            sent = self.poll_registration(&operation_id) => sent?,
        }

        loop {
            let delay = self
                .events
                .state
                .borrow()
                .retry_after
                .unwrap_or_default()
                .max(self.settings.poll_interval);
            if let Ok(resolved) = tokio::time::timeout(delay, next_terminal(&mut rx)).await {
                return resolved?.resolve();
            }

            let operation_id = self.events.state.borrow().operation_id.clone();
            if let Some(operation_id) = operation_id {
                self.publish_query(&operation_id).await?;
            }
        }
    }

    /// Close the provisioning connection. Safe at any time, idempotent.
    pub async fn end(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.disconnect().await {
                warn!(registration_id = %self.identity.registration_id(), error = %e, "Provisioning disconnect failed");
            }
            info!(registration_id = %self.identity.registration_id(), "Provisioning connection closed");
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ProvisioningState {
        self.events.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ProvisioningState> {
        self.events.state.subscribe()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    fn connected_transport(&self) -> Result<&T, ProvisioningError> {
        match &self.transport {
            Some(transport) if self.events.state.borrow().connected => Ok(transport),
            _ => Err(ProvisioningError::NotConnected),
        }
    }

    fn request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::provisioning::{OperationStatus, RegistrationFailure, RegistrationResponse};
    use proptest::prelude::*;

    fn progress(operation_id: &str, assignment: Option<(&str, &str)>) -> RegistrationReply {
        RegistrationReply::Progress(RegistrationResponse {
            status_code: 202,
            request_id: "1".to_string(),
            retry_after: None,
            operation_id: operation_id.to_string(),
            operation_status: OperationStatus::Assigning,
            assignment: assignment.map(|(endpoint, device_id)| Assignment {
                endpoint: endpoint.to_string(),
                device_id: device_id.to_string(),
            }),
        })
    }

    #[test]
    fn test_connack_sets_connected() {
        let events = ProvisioningEvents::new("R1".to_string());
        events.on_packet(InboundPacket::ConnAck {
            session_present: false,
        });
        assert!(events.state.borrow().connected);
    }

    #[test]
    fn test_assignment_is_one_shot() {
        let events = ProvisioningEvents::new("R1".to_string());
        events.apply_reply(progress("op-1", Some(("hub-a", "R1"))));
        events.apply_reply(progress("op-1", Some(("hub-b", "R2"))));

        let state = events.state.borrow().clone();
        assert!(state.provisioned);
        assert_eq!(
            state.assignment,
            Some(Assignment {
                endpoint: "hub-a".to_string(),
                device_id: "R1".to_string(),
            })
        );
    }

    #[test]
    fn test_mismatched_operation_is_discarded() {
        let events = ProvisioningEvents::new("R1".to_string());
        events.apply_reply(progress("op-1", None));
        events.apply_reply(progress("op-2", Some(("hub", "R1"))));

        let state = events.state.borrow().clone();
        assert_eq!(state.operation_id.as_deref(), Some("op-1"));
        assert!(!state.provisioned);
    }

    #[test]
    fn test_malformed_publish_leaves_state() {
        let events = ProvisioningEvents::new("R1".to_string());
        events.apply_reply(progress("op-1", None));
        events.on_packet(InboundPacket::Publish {
            topic: "$dps/registrations/res/202/?$rid=2".to_string(),
            payload: Bytes::from_static(b"{broken"),
        });

        assert_eq!(
            events.state.borrow().operation_id.as_deref(),
            Some("op-1")
        );
    }

    #[test]
    fn test_failure_is_recorded_once() {
        let events = ProvisioningEvents::new("R1".to_string());
        let failure = |status| {
            RegistrationReply::Failure(RegistrationFailure {
                status_code: status,
                request_id: "1".to_string(),
                error_code: None,
                tracking_id: None,
                message: "denied".to_string(),
            })
        };
        events.apply_reply(failure(401));
        events.apply_reply(failure(500));

        let state = events.state.borrow().clone();
        assert!(state.is_terminal());
        assert_eq!(state.rejection.map(|r| r.status), Some(401));
        assert!(matches!(
            events.state.borrow().clone().resolve(),
            Err(ProvisioningError::Rejected { status: 401, .. })
        ));
    }

    #[test]
    fn test_disconnect_before_provisioning_is_link_failure() {
        let events = ProvisioningEvents::new("R1".to_string());
        events.on_connection_state_change(ConnectionState::Disconnected("refused".to_string()));

        let state = events.state.borrow().clone();
        assert_eq!(state.link_failure.as_deref(), Some("refused"));
        assert!(matches!(
            state.resolve(),
            Err(ProvisioningError::TransportConnect { .. })
        ));
    }

    #[test]
    fn test_disconnect_after_provisioning_keeps_result() {
        let events = ProvisioningEvents::new("R1".to_string());
        events.apply_reply(progress("op-1", Some(("hub", "R1"))));
        events.on_connection_state_change(ConnectionState::Disconnected(
            "client disconnected".to_string(),
        ));

        let state = events.state.borrow().clone();
        assert_eq!(state.link_failure, None);
        assert!(state.resolve().is_ok());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Progress { op: u8, assigned: Option<u8> },
        Failure,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (0u8..3, proptest::option::of(0u8..3))
                .prop_map(|(op, assigned)| Step::Progress { op, assigned }),
            1 => Just(Step::Failure),
        ]
    }

    proptest! {
        #[test]
        fn provisioning_is_one_shot_and_tracks_latest_operation(steps in proptest::collection::vec(step(), 0..20)) {
            let events = ProvisioningEvents::new("R1".to_string());
            let mut expected_op: Option<String> = None;
            let mut expected_assignment: Option<Assignment> = None;
            let mut resolved = false;

            for step in steps {
                match step {
                    Step::Progress { op, assigned } => {
                        let op = format!("op-{op}");
                        let endpoint = assigned.map(|hub| format!("hub-{hub}.example.net"));
                        let accepted = !resolved
                            && expected_op.as_ref().map_or(true, |known| *known == op);
                        if accepted {
                            expected_op = Some(op.clone());
                            if let Some(endpoint) = &endpoint {
                                expected_assignment = Some(Assignment {
                                    endpoint: endpoint.clone(),
                                    device_id: "R1".to_string(),
                                });
                                resolved = true;
                            }
                        }
                        events.apply_reply(progress(&op, endpoint.as_deref().map(|e| (e, "R1"))));
                    }
                    Step::Failure => {
                        resolved = true;
                        events.apply_reply(RegistrationReply::Failure(RegistrationFailure {
                            status_code: 400,
                            request_id: "1".to_string(),
                            error_code: None,
                            tracking_id: None,
                            message: "bad".to_string(),
                        }));
                    }
                }

                let state = events.state.borrow().clone();
                prop_assert_eq!(&state.operation_id, &expected_op);
                prop_assert_eq!(&state.assignment, &expected_assignment);
                prop_assert_eq!(state.provisioned, state.assignment.is_some());
            }
        }
    }
}
