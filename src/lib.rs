//! iot-onboard - device onboarding over MQTT
//!
//! A device-side client for a two-phase onboarding protocol:
//!
//! 1. **Provisioning** - exchange the device identity with the provisioning
//!    service for an assigned hub endpoint and device id.
//! 2. **Session** - connect to the assigned hub, subscribe to commands and
//!    property updates, and publish telemetry.
//!
//! Both phases run over an MQTT 3.1.1 session secured with mutual TLS.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iot_onboard::config::OnboardConfig;
//! use iot_onboard::transport::MqttConnector;
//! use iot_onboard::workflow::{IntervalTelemetrySource, WorkflowOrchestrator};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = OnboardConfig::load_from_file(Path::new("onboard.toml"))?;
//! let settings = config.to_settings();
//! let connector = match &config.tls {
//!     Some(tls) => MqttConnector::new(tls.load()?),
//!     None => MqttConnector::plaintext(),
//! };
//!
//! let source = Arc::new(IntervalTelemetrySource::new(settings.session.telemetry_interval));
//! let orchestrator = WorkflowOrchestrator::new(
//!     config.identity()?,
//!     connector,
//!     settings.provisioning,
//!     settings.session,
//!     source,
//! );
//!
//! orchestrator.start_provisioning().await?;
//! orchestrator.start_session().await?;
//! orchestrator.send_telemetry_once(None).await?;
//! println!("{:?}", orchestrator.current_outcome());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;
pub mod workflow;

pub use config::{ConfigError, OnboardConfig, ProvisioningSettings, SessionSettings, Settings};
pub use error::{ClientError, ClientResult, ProvisioningError, SessionError, TransportError};
pub use protocol::{Assignment, DeviceIdentity};
pub use workflow::{WorkflowOrchestrator, WorkflowOutcome};
