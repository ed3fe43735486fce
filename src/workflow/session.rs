//! Session coordinator for the assigned hub
//!
//! Connects with the credentials derived from the provisioning result, waits
//! for the broker acknowledgment, subscribes to the feature topics and
//! publishes telemetry. Counters are atomics so the presentation layer can
//! read them while the transport task updates them.

use crate::config::SessionSettings;
use crate::error::{SessionError, TransportError};
use crate::protocol::hub::{derive_hub_credentials, HubMessage, HubTopics, TopicKind};
use crate::transport::{
    ConnectOptions, ConnectionState, Connector, InboundPacket, QoS, Transport, TransportDelegate,
};
use crate::workflow::telemetry::TelemetrySource;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Invoked with the new acknowledged count after every PubAck
pub type AckCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Receives every publish the hub sends to the device
pub type HubMessageHandler = Arc<dyn Fn(HubMessage) + Send + Sync>;

/// Session lifecycle: `Idle → Connecting → Connected → Ready → Subscribed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Ready,
    Subscribed,
}

impl SessionPhase {
    pub fn can_send(self) -> bool {
        matches!(self, SessionPhase::Ready | SessionPhase::Subscribed)
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub connected: bool,
    pub ready_to_send: bool,
    pub subscriptions: BTreeSet<TopicKind>,
    pub periodic_telemetry_enabled: bool,
    pub telemetry_sent_count: u64,
    pub telemetry_acked_count: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PeriodicTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Let an in-flight send finish, then exit
    fn stop(self) {
        self.stop.send_replace(true);
        drop(self.handle);
    }
}

/// State shared between the control task, the transport task and the
/// periodic telemetry task
struct SessionShared {
    device_id: Mutex<String>,
    phase: watch::Sender<SessionPhase>,
    subscriptions: Mutex<BTreeSet<TopicKind>>,
    sent: AtomicU64,
    acked: AtomicU64,
    periodic_enabled: AtomicBool,
    periodic: Mutex<Option<PeriodicTask>>,
    last_disconnect: Mutex<Option<String>>,
    ack_callback: Mutex<Option<AckCallback>>,
    message_handler: Mutex<Option<HubMessageHandler>>,
}

impl SessionShared {
    fn new() -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            device_id: Mutex::new(String::new()),
            phase,
            subscriptions: Mutex::new(BTreeSet::new()),
            sent: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            periodic_enabled: AtomicBool::new(false),
            periodic: Mutex::new(None),
            last_disconnect: Mutex::new(None),
            ack_callback: Mutex::new(None),
            message_handler: Mutex::new(None),
        }
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    fn device_id(&self) -> String {
        lock(&self.device_id).clone()
    }

    fn stop_periodic(&self) {
        let task = lock(&self.periodic).take();
        self.periodic_enabled.store(false, Ordering::SeqCst);
        if let Some(task) = task {
            task.stop();
            info!(device_id = %self.device_id(), "Periodic telemetry stopped");
        }
    }

    fn snapshot(&self) -> SessionState {
        let phase = self.phase();
        SessionState {
            phase,
            connected: matches!(
                phase,
                SessionPhase::Connected | SessionPhase::Ready | SessionPhase::Subscribed
            ),
            ready_to_send: phase.can_send(),
            subscriptions: lock(&self.subscriptions).clone(),
            periodic_telemetry_enabled: self.periodic_enabled.load(Ordering::SeqCst),
            telemetry_sent_count: self.sent.load(Ordering::SeqCst),
            telemetry_acked_count: self.acked.load(Ordering::SeqCst),
        }
    }

    fn on_inbound_packet(&self, packet: InboundPacket) {
        match packet {
            InboundPacket::ConnAck { session_present } => {
                let became_ready = self.phase.send_if_modified(|phase| {
                    if matches!(phase, SessionPhase::Connecting | SessionPhase::Connected) {
                        *phase = SessionPhase::Ready;
                        true
                    } else {
                        false
                    }
                });
                if became_ready {
                    info!(device_id = %self.device_id(), session_present, "Hub connection acknowledged, ready to send");
                } else {
                    warn!(device_id = %self.device_id(), phase = ?self.phase(), "Ignoring ConnAck outside the connect handshake");
                }
            }
            InboundPacket::Publish { topic, payload } => {
                let message = HubMessage::new(topic, payload);
                debug!(device_id = %self.device_id(), topic = %message.topic, kind = ?message.kind, "Hub message received");
                let handler = lock(&self.message_handler).clone();
                match handler {
                    Some(handler) => handler(message),
                    None => debug!(device_id = %self.device_id(), "No hub message handler installed, dropping message"),
                }
            }
            InboundPacket::PubAck { packet_id } => {
                let acked = self
                    .acked
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |acked| {
                        (acked < self.sent.load(Ordering::SeqCst)).then_some(acked + 1)
                    });
                match acked {
                    Ok(previous) => {
                        debug!(device_id = %self.device_id(), packet_id, acked = previous + 1, "Telemetry acknowledged");
                        let callback = lock(&self.ack_callback).clone();
                        if let Some(callback) = callback {
                            callback(previous + 1);
                        }
                    }
                    Err(_) => {
                        warn!(device_id = %self.device_id(), packet_id, "PubAck without an outstanding telemetry message");
                    }
                }
            }
            other => {
                debug!(device_id = %self.device_id(), kind = other.kind(), "Ignoring packet");
            }
        }
    }
}

/// Transport delegate for the hub connection
struct SessionEvents {
    shared: Arc<SessionShared>,
}

impl TransportDelegate for SessionEvents {
    fn on_packet(&self, packet: InboundPacket) {
        self.shared.on_inbound_packet(packet);
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        debug!(device_id = %self.shared.device_id(), state = ?state, "Hub connection state changed");
        match state {
            ConnectionState::Connected => {
                self.shared.phase.send_if_modified(|phase| {
                    if *phase == SessionPhase::Connecting {
                        *phase = SessionPhase::Connected;
                        true
                    } else {
                        false
                    }
                });
            }
            ConnectionState::Disconnected(reason) => {
                info!(device_id = %self.shared.device_id(), reason = %reason, "Hub session closed");
                *lock(&self.shared.last_disconnect) = Some(reason);
                lock(&self.shared.subscriptions).clear();
                self.shared.stop_periodic();
                self.shared.phase.send_replace(SessionPhase::Idle);
            }
            ConnectionState::Idle | ConnectionState::Connecting => {}
        }
    }

    fn on_error(&self, error: &TransportError) {
        warn!(device_id = %self.shared.device_id(), error = %error, "Hub transport error");
    }
}

/// Read-only handle on a session's counters and flags
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.shared.snapshot()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    pub fn sent_count(&self) -> u64 {
        self.shared.sent.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self) -> u64 {
        self.shared.acked.load(Ordering::SeqCst)
    }

    pub fn is_periodic_enabled(&self) -> bool {
        self.shared.periodic_enabled.load(Ordering::SeqCst)
    }

    /// Receiver that observes phase changes
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase.subscribe()
    }
}

async fn publish_telemetry<T: Transport>(
    shared: &SessionShared,
    transport: &T,
    topic: &str,
    payload: Bytes,
) -> Result<(), TransportError> {
    if !shared.phase().can_send() {
        return Err(TransportError::NotConnected {
            state: transport.connection_state(),
        });
    }

    let sent = shared.sent.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(topic = %topic, sent, bytes = payload.len(), "Sending telemetry");
    transport
        .publish(topic, payload, QoS::AtLeastOnce, false)
        .await
}

/// Drives one hub session over a transport of type `T`
pub struct SessionCoordinator<T: Transport> {
    settings: SessionSettings,
    shared: Arc<SessionShared>,
    transport: Option<Arc<T>>,
    telemetry_topic: Option<String>,
    source: Arc<dyn TelemetrySource>,
}

impl<T: Transport> SessionCoordinator<T> {
    pub fn new(settings: SessionSettings, source: Arc<dyn TelemetrySource>) -> Self {
        Self {
            settings,
            shared: Arc::new(SessionShared::new()),
            transport: None,
            telemetry_topic: None,
            source,
        }
    }

    /// Register the callback fired after every acknowledged telemetry message
    pub fn on_ack(&self, callback: AckCallback) {
        *lock(&self.shared.ack_callback) = Some(callback);
    }

    /// Register the handler for inbound hub messages
    pub fn on_message(&self, handler: HubMessageHandler) {
        *lock(&self.shared.message_handler) = Some(handler);
    }

    /// Open the hub connection for the assigned device
    pub async fn begin<C>(
        &mut self,
        connector: &C,
        endpoint: &str,
        device_id: &str,
    ) -> Result<(), SessionError>
    where
        C: Connector<Transport = T>,
    {
        self.end().await;

        *lock(&self.shared.device_id) = device_id.to_string();
        *lock(&self.shared.last_disconnect) = None;
        lock(&self.shared.subscriptions).clear();
        self.shared.sent.store(0, Ordering::SeqCst);
        self.shared.acked.store(0, Ordering::SeqCst);

        let credentials = derive_hub_credentials(endpoint, device_id);
        let options = ConnectOptions::new(endpoint, self.settings.port, credentials)
            .with_keep_alive(self.settings.keep_alive)
            .with_clean_session(self.settings.clean_session);

        let transport = connector
            .build(options)
            .map_err(|e| SessionError::transport_connect(e.to_string()))?;
        transport.set_delegate(Arc::new(SessionEvents {
            shared: self.shared.clone(),
        }));

        self.shared.phase.send_replace(SessionPhase::Connecting);
        if let Err(e) = transport.connect().await {
            self.shared.phase.send_replace(SessionPhase::Idle);
            return Err(SessionError::transport_connect(e.to_string()));
        }

        info!(device_id = %device_id, endpoint = %endpoint, "Hub connection started");
        self.telemetry_topic = Some(HubTopics::new(device_id).telemetry());
        self.transport = Some(Arc::new(transport));
        Ok(())
    }

    /// Wait for the hub to acknowledge the connection
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut rx = self.shared.phase.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|phase| phase.can_send() || *phase == SessionPhase::Idle),
        )
        .await;

        let phase = match waited {
            Err(_) => return Err(SessionError::ReadyTimeout { elapsed: timeout }),
            Ok(Err(_)) => SessionPhase::Idle,
            Ok(Ok(phase)) => *phase,
        };

        if phase.can_send() {
            return Ok(());
        }
        let reason = lock(&self.shared.last_disconnect)
            .clone()
            .unwrap_or_else(|| "session not started".to_string());
        Err(SessionError::transport_connect(reason))
    }

    /// Subscribe to commands, property responses and desired property patches.
    /// Only valid in the Ready phase.
    pub async fn subscribe_to_features(&self) -> Result<(), SessionError> {
        let phase = self.shared.phase();
        let transport = match &self.transport {
            Some(transport) if phase == SessionPhase::Ready => transport,
            _ => return Err(SessionError::NotReady { phase }),
        };

        for kind in TopicKind::ALL {
            transport.subscribe(kind.filter(), QoS::AtLeastOnce).await?;
            lock(&self.shared.subscriptions).insert(kind);
            debug!(device_id = %self.shared.device_id(), topic = kind.filter(), "Feature subscription requested");
        }

        self.shared.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Ready {
                *phase = SessionPhase::Subscribed;
                true
            } else {
                false
            }
        });
        info!(device_id = %self.shared.device_id(), "Subscribed to hub features");
        Ok(())
    }

    /// Publish one telemetry message
    pub async fn send_telemetry(&self, payload: Bytes) -> Result<(), TransportError> {
        match (&self.transport, &self.telemetry_topic) {
            (Some(transport), Some(topic)) => {
                publish_telemetry(&self.shared, transport.as_ref(), topic, payload).await
            }
            _ => Err(TransportError::NotConnected {
                state: ConnectionState::Idle,
            }),
        }
    }

    /// Flip periodic telemetry and return the new flag
    pub fn toggle_periodic_telemetry(&self) -> bool {
        let mut periodic = lock(&self.shared.periodic);
        let enabled = !self.shared.periodic_enabled.load(Ordering::SeqCst);

        if enabled {
            if let (Some(transport), Some(topic)) = (&self.transport, &self.telemetry_topic) {
                *periodic = Some(self.spawn_forwarder(transport.clone(), topic.clone()));
            }
            info!(device_id = %self.shared.device_id(), "Periodic telemetry started");
        } else if let Some(task) = periodic.take() {
            task.stop();
            info!(device_id = %self.shared.device_id(), "Periodic telemetry stopped");
        }

        self.shared.periodic_enabled.store(enabled, Ordering::SeqCst);
        enabled
    }

    fn spawn_forwarder(&self, transport: Arc<T>, topic: String) -> PeriodicTask {
        let (stop, mut stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let source = self.source.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    sample = source.next_sample() => match sample {
                        Some(payload) => {
                            if let Err(e) = publish_telemetry(&shared, transport.as_ref(), &topic, payload).await {
                                warn!(topic = %topic, error = %e, "Periodic telemetry send failed");
                            }
                        }
                        None => {
                            debug!(topic = %topic, "Telemetry source exhausted");
                            break;
                        }
                    }
                }
            }
        });

        PeriodicTask { stop, handle }
    }

    /// Disconnect from the hub. Idempotent.
    pub async fn end(&mut self) {
        self.shared.stop_periodic();
        self.telemetry_topic = None;

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.disconnect().await {
                warn!(device_id = %self.shared.device_id(), error = %e, "Hub disconnect failed");
            }
            lock(&self.shared.subscriptions).clear();
            self.shared.phase.send_replace(SessionPhase::Idle);
            info!(device_id = %self.shared.device_id(), "Hub connection closed");
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.snapshot()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_deref()
    }
}

impl<T: Transport> Drop for SessionCoordinator<T> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.shared.periodic).take() {
            task.handle.abort();
        }
        self.shared.periodic_enabled.store(false, Ordering::SeqCst);
    }
}
