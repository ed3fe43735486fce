//! Mock implementations for testing
//!
//! Provides an in-memory [`Transport`] and [`Connector`], a scripted
//! provisioning backend and a scripted [`TelemetrySource`], so the
//! coordinators can be exercised without a broker.
//!
//! Mock deliveries call the delegate inline, after the mock has released its
//! own locks.

use crate::error::TransportError;
use crate::transport::{
    ConnectOptions, ConnectionState, Connector, InboundPacket, QoS, Transport, TransportDelegate,
};
use crate::workflow::telemetry::TelemetrySource;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Produces the packets a scripted backend sends in reply to a publish
pub type Responder = Arc<dyn Fn(&str, &[u8]) -> Vec<InboundPacket> + Send + Sync>;

/// A message recorded by [`MockTransport::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone)]
struct MockBehavior {
    auto_connack: bool,
    ack_publishes: bool,
    ack_subscriptions: bool,
    fail_connect: bool,
    fail_publish: bool,
    responder: Option<Responder>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            auto_connack: true,
            ack_publishes: true,
            ack_subscriptions: true,
            fail_connect: false,
            fail_publish: false,
            responder: None,
        }
    }
}

struct MockInner {
    options: ConnectOptions,
    behavior: MockBehavior,
    delegate: Mutex<Option<Arc<dyn TransportDelegate>>>,
    state: Mutex<ConnectionState>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    published: Mutex<Vec<PublishedMessage>>,
    next_packet_id: AtomicU16,
    releases: AtomicUsize,
}

/// Shared by the owning handles of a transport. Dropping the last one counts
/// as a release.
struct Lease {
    inner: Arc<MockInner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory transport that records traffic and replays scripted packets.
///
/// Handles returned by [`MockConnector::transports`] observe the same
/// transport without owning it, so [`release_count`](Self::release_count)
/// tells whether the code under test still holds it.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
    lease: Option<Arc<Lease>>,
}

impl MockTransport {
    fn with_behavior(options: ConnectOptions, behavior: MockBehavior) -> Self {
        Self {
            inner: Arc::new(MockInner {
                options,
                behavior,
                delegate: Mutex::new(None),
                state: Mutex::new(ConnectionState::Idle),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                subscriptions: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                next_packet_id: AtomicU16::new(1),
                releases: AtomicUsize::new(0),
            }),
            lease: None,
        }
        .owned()
    }

    fn owned(mut self) -> Self {
        self.lease = Some(Arc::new(Lease {
            inner: self.inner.clone(),
        }));
        self
    }

    /// Handle on the same transport that does not keep it alive
    fn observer(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            lease: None,
        }
    }

    /// Transport with default behavior (auto ConnAck, auto acks)
    pub fn new(options: ConnectOptions) -> Self {
        Self::with_behavior(options, MockBehavior::default())
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// Hand a packet to the delegate as if it came from the broker
    pub fn deliver(&self, packet: InboundPacket) {
        let delegate = lock(&self.inner.delegate).clone();
        if let Some(delegate) = delegate {
            delegate.on_packet(packet);
        }
    }

    /// Change the connection state and notify the delegate
    pub fn set_state(&self, state: ConnectionState) {
        *lock(&self.inner.state) = state.clone();
        let delegate = lock(&self.inner.delegate).clone();
        if let Some(delegate) = delegate {
            delegate.on_connection_state_change(state);
        }
    }

    /// Report an asynchronous transport error to the delegate
    pub fn raise_error(&self, error: TransportError) {
        let delegate = lock(&self.inner.delegate).clone();
        if let Some(delegate) = delegate {
            delegate.on_error(&error);
        }
    }

    /// Simulate the broker acknowledging the connection
    pub fn accept_connection(&self) {
        self.set_state(ConnectionState::Connected);
        self.deliver(InboundPacket::ConnAck {
            session_present: false,
        });
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// 1 once every owning handle has been dropped, else 0
    pub fn release_count(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.inner.subscriptions).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.inner.published).clone()
    }

    /// Published messages whose topic starts with `prefix`
    pub fn published_to(&self, prefix: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.topic.starts_with(prefix))
            .collect()
    }

    fn packet_id(&self) -> u16 {
        self.inner.next_packet_id.fetch_add(1, Ordering::SeqCst)
    }

    fn require_connected(&self) -> Result<(), TransportError> {
        let state = lock(&self.inner.state).clone();
        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected { state })
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn set_delegate(&self, delegate: Arc<dyn TransportDelegate>) {
        *lock(&self.inner.delegate) = Some(delegate);
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if self.inner.behavior.fail_connect {
            return Err(TransportError::ConnectFailed(
                "mock connection refused".to_string(),
            ));
        }

        self.set_state(ConnectionState::Connecting);
        if self.inner.behavior.auto_connack {
            self.accept_connection();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let state = lock(&self.inner.state).clone();
        if matches!(state, ConnectionState::Idle | ConnectionState::Disconnected(_)) {
            return Ok(());
        }

        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected(
            "client disconnected".to_string(),
        ));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.require_connected()?;
        lock(&self.inner.subscriptions).push((topic.to_string(), qos));

        if self.inner.behavior.ack_subscriptions {
            self.deliver(InboundPacket::SubAck {
                packet_id: self.packet_id(),
                return_codes: vec![qos as u8],
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.require_connected()?;
        if self.inner.behavior.fail_publish {
            return Err(TransportError::publish_failed(
                topic,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mock publish failure"),
            ));
        }

        lock(&self.inner.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            retain,
        });

        if self.inner.behavior.ack_publishes && qos != QoS::AtMostOnce {
            self.deliver(InboundPacket::PubAck {
                packet_id: self.packet_id(),
            });
        }
        if let Some(responder) = self.inner.behavior.responder.clone() {
            for packet in responder(topic, &payload) {
                self.deliver(packet);
            }
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.state).clone()
    }
}

/// Connector that builds [`MockTransport`]s and keeps a handle on each
#[derive(Default)]
pub struct MockConnector {
    behavior: MockBehavior,
    connack_limit: Option<usize>,
    built: Mutex<Vec<MockTransport>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not acknowledge connections automatically
    pub fn without_connack(mut self) -> Self {
        self.behavior.auto_connack = false;
        self
    }

    /// Acknowledge only the first `count` connections; later ones stay connecting
    pub fn acknowledge_first(mut self, count: usize) -> Self {
        self.connack_limit = Some(count);
        self
    }

    /// Do not acknowledge publishes automatically
    pub fn without_publish_acks(mut self) -> Self {
        self.behavior.ack_publishes = false;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.behavior.fail_connect = true;
        self
    }

    pub fn failing_publish(mut self) -> Self {
        self.behavior.fail_publish = true;
        self
    }

    /// Reply to every publish with the packets `responder` returns
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.behavior.responder = Some(responder);
        self
    }

    /// Every transport built so far, oldest first
    pub fn transports(&self) -> Vec<MockTransport> {
        lock(&self.built).clone()
    }

    pub fn last_transport(&self) -> Option<MockTransport> {
        lock(&self.built).last().cloned()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn build(&self, options: ConnectOptions) -> Result<MockTransport, TransportError> {
        let mut built = lock(&self.built);
        let mut behavior = self.behavior.clone();
        if self.connack_limit.is_some_and(|limit| built.len() >= limit) {
            behavior.auto_connack = false;
        }

        let transport = MockTransport::with_behavior(options, behavior);
        built.push(transport.observer());
        Ok(transport)
    }
}

fn request_id(topic: &str) -> &str {
    topic
        .split_once("?$rid=")
        .map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
        .unwrap_or("0")
}

/// Registration reply publish, as the provisioning service would send it
pub fn registration_reply(status: u16, request_id: &str, body: serde_json::Value) -> InboundPacket {
    InboundPacket::Publish {
        topic: format!("$dps/registrations/res/{status}/?$rid={request_id}"),
        payload: Bytes::from(body.to_string()),
    }
}

/// Scripted provisioning service: the register request gets an `assigning`
/// reply, every status query gets the assignment
pub fn provisioning_responder(operation_id: &str, endpoint: &str, device_id: &str) -> Responder {
    let operation_id = operation_id.to_string();
    let endpoint = endpoint.to_string();
    let device_id = device_id.to_string();

    Arc::new(move |topic: &str, _payload: &[u8]| {
        if topic.starts_with("$dps/registrations/PUT/iotdps-register/") {
            vec![registration_reply(
                202,
                request_id(topic),
                json!({"operationId": operation_id, "status": "assigning"}),
            )]
        } else if topic.starts_with("$dps/registrations/GET/iotdps-get-operationstatus/") {
            vec![registration_reply(
                200,
                request_id(topic),
                json!({
                    "operationId": operation_id,
                    "status": "assigned",
                    "registrationState": {
                        "registrationId": device_id,
                        "assignedHub": endpoint,
                        "deviceId": device_id,
                        "status": "assigned"
                    }
                }),
            )]
        } else {
            Vec::new()
        }
    })
}

/// Telemetry source that yields a fixed list of samples
pub struct ScriptedTelemetrySource {
    samples: Mutex<VecDeque<Bytes>>,
    delay: Duration,
    hold_open: bool,
}

impl ScriptedTelemetrySource {
    /// Yields `samples` in order, then ends
    pub fn new<I, B>(samples: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            samples: Mutex::new(samples.into_iter().map(Into::into).collect()),
            delay: Duration::ZERO,
            hold_open: false,
        }
    }

    /// Wait `delay` before each sample
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never end: once the samples run out, wait forever
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn remaining(&self) -> usize {
        lock(&self.samples).len()
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetrySource {
    async fn next_sample(&self) -> Option<Bytes> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let sample = lock(&self.samples).pop_front();
        match sample {
            Some(sample) => Some(sample),
            None if self.hold_open => std::future::pending().await,
            None => None,
        }
    }
}
