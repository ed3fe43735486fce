//! Transport layer for the onboarding workflows
//!
//! This module defines the seam between the protocol coordinators and the MQTT
//! session that carries them. Operations are fire-and-forget: completion and
//! acknowledgments arrive later through a [`TransportDelegate`] on the
//! transport's own event task, never as the return value of the call.

use crate::error::TransportError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub mod mqtt;

pub use rumqttc::QoS;

/// Connection state reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Connect requested, waiting for the broker
    Connecting,
    /// Broker acknowledged the connection
    Connected,
    /// Connection closed or failed, with reason
    Disconnected(String),
}

/// Closed set of inbound packet kinds the coordinators react to
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPacket {
    /// Connection acknowledged by the broker
    ConnAck { session_present: bool },
    /// Message published to one of our subscriptions
    Publish { topic: String, payload: Bytes },
    /// Delivery acknowledgment for one of our QoS 1 publishes
    PubAck { packet_id: u16 },
    /// Subscription acknowledgment with per-topic return codes
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    /// Anything else (PingResp, UnsubAck, ...)
    Other(String),
}

impl InboundPacket {
    /// Short name used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            InboundPacket::ConnAck { .. } => "connack",
            InboundPacket::Publish { .. } => "publish",
            InboundPacket::PubAck { .. } => "puback",
            InboundPacket::SubAck { .. } => "suback",
            InboundPacket::Other(_) => "other",
        }
    }
}

/// Client identity presented to the broker on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
}

/// Everything a [`Connector`] needs to open one MQTT session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: credentials.client_id,
            username: credentials.username,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }
}

/// Callback surface a transport drives from its event task.
///
/// Implementations must be cheap and non-blocking; they run inline with
/// packet processing.
pub trait TransportDelegate: Send + Sync {
    fn on_packet(&self, packet: InboundPacket);

    fn on_connection_state_change(&self, state: ConnectionState);

    fn on_error(&self, error: &TransportError);
}

/// Transport trait for the provisioning and session coordinators
///
/// This abstraction allows the coordinators to be driven by a real MQTT
/// client or by the in-memory mocks in [`crate::testing`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Install the delegate that receives inbound events. Must be called before `connect`.
    fn set_delegate(&self, delegate: Arc<dyn TransportDelegate>);

    /// Start connecting. Success means the attempt was started, not that the broker accepted it.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Safe to call repeatedly or without a prior connect.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;
}

/// Factory for transports, one per connection
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn build(&self, options: ConnectOptions) -> Result<Self::Transport, TransportError>;
}

/// Type alias for the production connector
pub type MqttConnector = mqtt::MqttConnector;
