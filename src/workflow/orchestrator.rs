//! Workflow orchestrator
//!
//! Sequences provisioning then the hub session and exposes the small API the
//! application drives: start provisioning, start the session, send telemetry,
//! toggle periodic telemetry, and read the current outcome.

use crate::config::{ProvisioningSettings, SessionSettings};
use crate::error::{ProvisioningError, SessionError, TransportError};
use crate::protocol::hub::HubMessage;
use crate::protocol::provisioning::Assignment;
use crate::protocol::DeviceIdentity;
use crate::transport::{ConnectionState, Connector};
use crate::workflow::provisioning::{ProvisioningCoordinator, ProvisioningState};
use crate::workflow::session::{HubMessageHandler, SessionCoordinator, SessionHandle};
use crate::workflow::telemetry::TelemetrySource;
use crate::{provisioning_span, session_span};
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{info, warn, Instrument};

/// Snapshot of the whole workflow, recomputed on every read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WorkflowOutcome {
    pub is_provisioned: bool,
    pub is_session_connected: bool,
    pub sent_count: u64,
    pub acked_count: u64,
    pub periodic_telemetry_enabled: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs provisioning and the hub session for one device
pub struct WorkflowOrchestrator<C: Connector> {
    identity: DeviceIdentity,
    connector: C,
    provisioning_settings: ProvisioningSettings,
    session_settings: SessionSettings,
    source: Arc<dyn TelemetrySource>,
    message_handler: Mutex<Option<HubMessageHandler>>,
    assignment: Mutex<Option<Assignment>>,
    provisioning_state: Mutex<Option<watch::Receiver<ProvisioningState>>>,
    session: AsyncMutex<Option<SessionCoordinator<C::Transport>>>,
    session_view: Mutex<Option<SessionHandle>>,
    /// Periodic telemetry flag held while no session exists
    periodic_requested: AtomicBool,
    /// Bumped on every outcome change
    changes: Arc<watch::Sender<u64>>,
}

impl<C: Connector> WorkflowOrchestrator<C> {
    pub fn new(
        identity: DeviceIdentity,
        connector: C,
        provisioning_settings: ProvisioningSettings,
        session_settings: SessionSettings,
        source: Arc<dyn TelemetrySource>,
    ) -> Self {
        Self {
            identity,
            connector,
            provisioning_settings,
            session_settings,
            source,
            message_handler: Mutex::new(None),
            assignment: Mutex::new(None),
            provisioning_state: Mutex::new(None),
            session: AsyncMutex::new(None),
            session_view: Mutex::new(None),
            periodic_requested: AtomicBool::new(false),
            changes: Arc::new(watch::channel(0).0),
        }
    }

    fn mark_changed(&self) {
        self.changes.send_modify(|count| *count += 1);
    }

    /// Handler for inbound hub messages; applies to sessions started afterwards
    pub fn set_message_handler(&self, handler: HubMessageHandler) {
        *lock(&self.message_handler) = Some(handler);
    }

    /// Provision the device: begin, subscribe, request, poll, wait, end.
    ///
    /// Resolves only once the device is provisioned, the service rejects it,
    /// the link fails, or the configured timeout elapses. The connection is
    /// closed on every path.
    pub async fn start_provisioning(&self) -> Result<Assignment, ProvisioningError> {
        let span = provisioning_span!(self.identity.registration_id());
        async {
            let mut coordinator: ProvisioningCoordinator<C::Transport> =
                ProvisioningCoordinator::new(self.identity.clone(), self.provisioning_settings.clone());
            *lock(&self.provisioning_state) = Some(coordinator.subscribe_state());

            let limit = self.provisioning_settings.timeout;
            let result = match tokio::time::timeout(limit, self.run_provisioning(&mut coordinator)).await {
                Ok(result) => result,
                Err(_) => Err(ProvisioningError::timeout(limit)),
            };
            coordinator.end().await;

            match &result {
                Ok(assignment) => {
                    info!(endpoint = %assignment.endpoint, device_id = %assignment.device_id, "Provisioning complete");
                    *lock(&self.assignment) = Some(assignment.clone());
                }
                Err(e) => warn!(error = %e, "Provisioning failed"),
            }
            self.mark_changed();
            result
        }
        .instrument(span)
        .await
    }

    async fn run_provisioning(
        &self,
        coordinator: &mut ProvisioningCoordinator<C::Transport>,
    ) -> Result<Assignment, ProvisioningError> {
        coordinator.begin(&self.connector).await?;
        coordinator
            .wait_until_connected(self.provisioning_settings.timeout)
            .await?;
        coordinator.subscribe_for_responses().await?;
        coordinator.request_registration().await?;
        coordinator.poll_until_provisioned().await
    }

    /// Connect to the assigned hub, wait until ready, subscribe to features
    pub async fn start_session(&self) -> Result<(), SessionError> {
        let assignment = lock(&self.assignment)
            .clone()
            .ok_or(SessionError::NotProvisioned)?;

        let span = session_span!(assignment.device_id.as_str());
        async {
            let mut guard = self.session.lock().await;
            if let Some(mut previous) = guard.take() {
                previous.end().await;
            }

            let mut coordinator = SessionCoordinator::new(self.session_settings.clone(), self.source.clone());
            let changes = self.changes.clone();
            coordinator.on_ack(Arc::new(move |_: u64| {
                changes.send_modify(|count| *count += 1);
            }));
            if let Some(handler) = lock(&self.message_handler).clone() {
                coordinator.on_message(handler);
            }

            let result = self.run_session(&mut coordinator, &assignment).await;
            match &result {
                Ok(()) => {
                    info!("Session ready");
                    if self.periodic_requested.load(Ordering::SeqCst)
                        && !coordinator.state().periodic_telemetry_enabled
                    {
                        coordinator.toggle_periodic_telemetry();
                    }
                    *lock(&self.session_view) = Some(coordinator.handle());
                    *guard = Some(coordinator);
                }
                Err(e) => {
                    warn!(error = %e, "Session start failed");
                    coordinator.end().await;
                }
            }
            self.mark_changed();
            result
        }
        .instrument(span)
        .await
    }

    async fn run_session(
        &self,
        coordinator: &mut SessionCoordinator<C::Transport>,
        assignment: &Assignment,
    ) -> Result<(), SessionError> {
        coordinator
            .begin(&self.connector, &assignment.endpoint, &assignment.device_id)
            .await?;
        coordinator
            .wait_until_ready(self.session_settings.ready_timeout)
            .await?;
        coordinator.subscribe_to_features().await
    }

    /// Send one telemetry message with the given payload or the configured default
    pub async fn send_telemetry_once(&self, payload: Option<Bytes>) -> Result<(), TransportError> {
        let payload = payload.unwrap_or_else(|| self.session_settings.telemetry_payload.clone());
        let guard = self.session.lock().await;
        let result = match guard.as_ref() {
            Some(session) => session.send_telemetry(payload).await,
            None => Err(TransportError::NotConnected {
                state: ConnectionState::Idle,
            }),
        };
        self.mark_changed();
        result
    }

    /// Flip periodic telemetry; returns the resulting flag.
    ///
    /// Without a session the flag is held and applied by the next
    /// `start_session`.
    pub async fn toggle_periodic_telemetry(&self) -> bool {
        let guard = self.session.lock().await;
        let enabled = match guard.as_ref() {
            Some(session) => session.toggle_periodic_telemetry(),
            None => {
                let enabled = !self.periodic_requested.load(Ordering::SeqCst);
                info!(enabled, "No active session, periodic telemetry flag held until the session starts");
                enabled
            }
        };
        self.periodic_requested.store(enabled, Ordering::SeqCst);
        self.mark_changed();
        enabled
    }

    /// Close the hub session, if any
    pub async fn end_session(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            session.end().await;
        }
        *lock(&self.session_view) = None;
        self.mark_changed();
    }

    pub fn current_outcome(&self) -> WorkflowOutcome {
        let is_provisioned = lock(&self.provisioning_state)
            .as_ref()
            .is_some_and(|rx| rx.borrow().provisioned);

        match lock(&self.session_view).as_ref() {
            Some(view) => {
                let state = view.state();
                WorkflowOutcome {
                    is_provisioned,
                    is_session_connected: state.connected,
                    sent_count: state.telemetry_sent_count,
                    acked_count: state.telemetry_acked_count,
                    periodic_telemetry_enabled: state.periodic_telemetry_enabled,
                }
            }
            None => WorkflowOutcome {
                is_provisioned,
                periodic_telemetry_enabled: self.periodic_requested.load(Ordering::SeqCst),
                ..WorkflowOutcome::default()
            },
        }
    }

    /// Change counter, bumped on every acknowledgment or API-driven change.
    /// A receiver sees changes that happen while nobody is awaiting it.
    pub fn outcome_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn assignment(&self) -> Option<Assignment> {
        lock(&self.assignment).clone()
    }

    /// Latest provisioning state, if an attempt was made
    pub fn provisioning_state(&self) -> Option<ProvisioningState> {
        lock(&self.provisioning_state)
            .as_ref()
            .map(|rx| rx.borrow().clone())
    }

    pub fn session_handle(&self) -> Option<SessionHandle> {
        lock(&self.session_view).clone()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

/// Forward hub messages into a channel, dropping them when it is full
pub fn channel_message_handler(
    sender: tokio::sync::mpsc::Sender<HubMessage>,
) -> HubMessageHandler {
    Arc::new(move |message: HubMessage| {
        if let Err(e) = sender.try_send(message) {
            warn!(error = %e, "Dropping hub message");
        }
    })
}
