//! MQTT transport built on rumqttc
//!
//! Pure configuration and event routing are kept apart from the I/O task.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection configuration and TLS material
//! - [`message_handler`] - Pure routing of rumqttc events into [`InboundPacket`]s
//! - [`client`] - Impure I/O: the client handle and the event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use iot_onboard::transport::mqtt::MqttConnector;
//! use iot_onboard::transport::{ConnectOptions, Connector, Credentials, Transport};
//!
//! # tokio_test::block_on(async {
//! let connector = MqttConnector::plaintext();
//! let transport = connector.build(ConnectOptions::new(
//!     "localhost",
//!     1883,
//!     Credentials {
//!         client_id: "device-1".to_string(),
//!         username: "device-1".to_string(),
//!     },
//! ))?;
//! // install a delegate with `transport.set_delegate(..)` before connecting
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```
//!
//! [`InboundPacket`]: crate::transport::InboundPacket

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttTransport};
pub use connection::{configure_mqtt_options, TlsMaterial};
pub use message_handler::{EventRoute, MessageHandler};
