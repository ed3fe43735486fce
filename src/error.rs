//! Error types for the onboarding client
//!
//! Every failure in the provisioning and session workflows resolves to one of
//! these values. Nothing in the client aborts the process on error.

use crate::transport::ConnectionState;
use crate::workflow::session::SessionPhase;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures (connect, publish, subscribe, TLS setup)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Subscription to {topic} failed")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),

    #[error("TLS material error: {0}")]
    Tls(String),

    #[error("Event loop error: {0}")]
    EventLoop(String),
}

impl TransportError {
    pub fn publish_failed<E>(topic: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::PublishFailed {
            topic: topic.to_string(),
            source: Box::new(source),
        }
    }

    pub fn subscription_failed<E>(topic: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::SubscriptionFailed {
            topic: topic.to_string(),
            source: Box::new(source),
        }
    }
}

/// Failures of the provisioning handshake
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Transport connect error: {reason}")]
    TransportConnect { reason: String },

    #[error("Provisioning timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Provisioning rejected by service (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Provisioning connection has not been acknowledged")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ProvisioningError {
    pub fn transport_connect<S: Into<String>>(reason: S) -> Self {
        Self::TransportConnect {
            reason: reason.into(),
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        Self::Timeout { elapsed }
    }

    pub fn rejected<S: Into<String>>(status: u16, message: S) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}

/// Failures of the telemetry session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Device has not been provisioned")]
    NotProvisioned,

    #[error("Session is not ready - current phase: {phase:?}")]
    NotReady { phase: SessionPhase },

    #[error("Transport connect error: {reason}")]
    TransportConnect { reason: String },

    #[error("Session did not become ready within {elapsed:?}")]
    ReadyTimeout { elapsed: Duration },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn transport_connect<S: Into<String>>(reason: S) -> Self {
        Self::TransportConnect {
            reason: reason.into(),
        }
    }
}

/// Umbrella error for the binary and for callers that drive the whole workflow
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
