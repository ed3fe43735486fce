//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client handle and the event loop task. The
//! task polls the event loop, routes each event through [`MessageHandler`],
//! and reports packets, state changes, and errors to the installed
//! [`TransportDelegate`]. There is no automatic reconnection: an event loop
//! error ends the session and is reported as `Disconnected`.

use super::connection::{configure_mqtt_options, TlsMaterial, REQUEST_CHANNEL_CAPACITY};
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::TransportError;
use crate::observability::metrics::metrics;
use crate::transport::{
    ConnectOptions, ConnectionState, Connector, InboundPacket, QoS, Transport, TransportDelegate,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, EventLoop};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `disconnect` waits for the event loop task to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds [`MqttTransport`]s, applying the device's TLS material to each
pub struct MqttConnector {
    tls: Option<TlsMaterial>,
}

impl MqttConnector {
    /// Connector for mutually authenticated TLS sessions
    pub fn new(tls: TlsMaterial) -> Self {
        Self { tls: Some(tls) }
    }

    /// Connector without TLS, for local test brokers
    pub fn plaintext() -> Self {
        Self { tls: None }
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl Connector for MqttConnector {
    type Transport = MqttTransport;

    fn build(&self, options: ConnectOptions) -> Result<MqttTransport, TransportError> {
        MqttTransport::new(&options, self.tls.as_ref())
    }
}

/// rumqttc-backed transport session
pub struct MqttTransport {
    endpoint: String,
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    delegate: Mutex<Option<Arc<dyn TransportDelegate>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(options: &ConnectOptions, tls: Option<&TlsMaterial>) -> Result<Self, TransportError> {
        let mqtt_options = configure_mqtt_options(options, tls)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            endpoint: format!("{}:{}", options.host, options.port),
            client,
            event_loop: Mutex::new(Some(event_loop)),
            delegate: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            shutdown_tx,
            event_loop_handle: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Record a state change and tell the delegate about it
    fn transition(
        state_tx: &watch::Sender<ConnectionState>,
        delegate: &dyn TransportDelegate,
        state: ConnectionState,
    ) {
        state_tx.send_replace(state.clone());
        delegate.on_connection_state_change(state);
    }

    /// Process one routed event. Returns true to keep polling, false to stop.
    fn process_event_route(
        route: EventRoute,
        state_tx: &watch::Sender<ConnectionState>,
        delegate: &dyn TransportDelegate,
        endpoint: &str,
    ) -> bool {
        match route {
            EventRoute::Inbound(packet @ InboundPacket::ConnAck { .. }) => {
                info!(endpoint = %endpoint, "MQTT connection acknowledged");
                metrics().connection_established();
                Self::transition(state_tx, delegate, ConnectionState::Connected);
                delegate.on_packet(packet);
                true
            }
            EventRoute::Inbound(packet) => {
                debug!(endpoint = %endpoint, kind = packet.kind(), "MQTT packet received");
                metrics().packet_received();
                delegate.on_packet(packet);
                true
            }
            EventRoute::Refused(code) => {
                error!(endpoint = %endpoint, code = %code, "MQTT connection refused");
                metrics().connection_failed();
                let reason = format!("connection refused: {code}");
                delegate.on_error(&TransportError::ConnectFailed(reason.clone()));
                Self::transition(state_tx, delegate, ConnectionState::Disconnected(reason));
                false
            }
            EventRoute::BrokerDisconnected => {
                warn!(endpoint = %endpoint, "MQTT broker closed the session");
                Self::transition(
                    state_tx,
                    delegate,
                    ConnectionState::Disconnected("broker disconnected".to_string()),
                );
                false
            }
            EventRoute::LocalDisconnect => {
                debug!(endpoint = %endpoint, "MQTT disconnect sent");
                Self::transition(
                    state_tx,
                    delegate,
                    ConnectionState::Disconnected("client disconnected".to_string()),
                );
                false
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Report an event loop failure; the loop always stops afterwards
    fn handle_event_loop_error(
        error: ConnectionError,
        state_tx: &watch::Sender<ConnectionState>,
        delegate: &dyn TransportDelegate,
        endpoint: &str,
    ) {
        let was_connecting = matches!(*state_tx.borrow(), ConnectionState::Connecting);
        if was_connecting {
            metrics().connection_failed();
        }

        error!(endpoint = %endpoint, error = %error, "MQTT event loop error");

        let reason = error.to_string();
        let transport_error = match error {
            ConnectionError::ConnectionRefused(code) => {
                TransportError::ConnectFailed(format!("connection refused: {code:?}"))
            }
            _ if was_connecting => TransportError::ConnectFailed(reason.clone()),
            _ => TransportError::EventLoop(reason.clone()),
        };
        delegate.on_error(&transport_error);
        Self::transition(state_tx, delegate, ConnectionState::Disconnected(reason));
    }

    fn spawn_event_loop(
        &self,
        mut event_loop: EventLoop,
        delegate: Arc<dyn TransportDelegate>,
    ) -> JoinHandle<()> {
        let state_tx = self.state_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let endpoint = self.endpoint.clone();
        let span = crate::mqtt_span!(endpoint = %endpoint);

        tokio::spawn(async move {
            debug!(endpoint = %endpoint, "Starting MQTT event loop");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!(endpoint = %endpoint, "Shutdown signal received, stopping MQTT event loop");
                            if !matches!(*state_tx.borrow(), ConnectionState::Disconnected(_)) {
                                Self::transition(
                                    &state_tx,
                                    delegate.as_ref(),
                                    ConnectionState::Disconnected("client shut down".to_string()),
                                );
                            }
                            break;
                        }
                    }
                    event = event_loop.poll() => {
                        match event {
                            Ok(event) => {
                                let route = MessageHandler::route_mqtt_event(&event);
                                if !Self::process_event_route(route, &state_tx, delegate.as_ref(), &endpoint) {
                                    break;
                                }
                            }
                            Err(e) => {
                                Self::handle_event_loop_error(e, &state_tx, delegate.as_ref(), &endpoint);
                                break;
                            }
                        }
                    }
                }
            }
            debug!(endpoint = %endpoint, "MQTT event loop stopped");
        }
        .instrument(span))
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), TransportError> {
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected { state });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn set_delegate(&self, delegate: Arc<dyn TransportDelegate>) {
        *lock(&self.delegate) = Some(delegate);
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let delegate = lock(&self.delegate)
            .clone()
            .ok_or_else(|| TransportError::ConnectFailed("no delegate installed".to_string()))?;
        let event_loop = lock(&self.event_loop).take().ok_or_else(|| {
            TransportError::ConnectFailed("event loop already started".to_string())
        })?;

        info!(endpoint = %self.endpoint, "Connecting to MQTT broker");
        metrics().connection_attempted();
        Self::transition(&self.state_tx, delegate.as_ref(), ConnectionState::Connecting);

        let handle = self.spawn_event_loop(event_loop, delegate);
        *lock(&self.event_loop_handle) = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(handle) = lock(&self.event_loop_handle).take() else {
            debug!(endpoint = %self.endpoint, "Disconnect requested without an active event loop");
            return Ok(());
        };

        match self.connection_state() {
            ConnectionState::Connected => {
                if let Err(e) = self.client.disconnect().await {
                    warn!(endpoint = %self.endpoint, error = %e, "Failed to queue MQTT disconnect, forcing shutdown");
                    self.shutdown_tx.send_replace(true);
                }
            }
            _ => {
                self.shutdown_tx.send_replace(true);
            }
        }

        let abort_handle = handle.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => debug!(endpoint = %self.endpoint, "Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(endpoint = %self.endpoint, error = %e, "Event loop task ended with error");
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint, "Event loop task didn't shut down gracefully, forcing abort");
                abort_handle.abort();
            }
            _ => {}
        }

        if !matches!(self.connection_state(), ConnectionState::Disconnected(_)) {
            let state = ConnectionState::Disconnected("client disconnected".to_string());
            self.state_tx.send_replace(state.clone());
            if let Some(delegate) = lock(&self.delegate).clone() {
                delegate.on_connection_state_change(state);
            }
        }

        info!(endpoint = %self.endpoint, "MQTT client disconnected");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.check_connection_state()?;

        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| TransportError::subscription_failed(topic, e))?;

        metrics().subscribed();
        info!(endpoint = %self.endpoint, topic = %topic, "Subscribed");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.check_connection_state()?;

        let size = payload.len();
        if let Err(e) = self.client.publish_bytes(topic, qos, retain, payload).await {
            metrics().publish_failed();
            return Err(TransportError::publish_failed(topic, e));
        }

        metrics().message_published();
        debug!(endpoint = %self.endpoint, topic = %topic, bytes = size, "Published");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if lock(&self.event_loop_handle).is_none() {
            return;
        }

        // Best effort: let a live session send DISCONNECT, otherwise stop the loop
        let sent_disconnect = self.connection_state() == ConnectionState::Connected
            && self.client.try_disconnect().is_ok();
        if !sent_disconnect {
            self.shutdown_tx.send_replace(true);
        }
    }
}
