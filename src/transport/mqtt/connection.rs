//! Pure connection configuration for the MQTT transport
//!
//! This module turns [`ConnectOptions`] plus optional TLS material into
//! rumqttc options. Nothing here touches the network.

use crate::error::TransportError;
use crate::transport::ConnectOptions;
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::path::Path;
use std::time::Duration;

/// Request channel capacity between the client handle and the event loop
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// PEM material for mutual TLS
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Trust anchors used to verify the broker
    pub ca: Vec<u8>,
    /// Device certificate chain
    pub client_cert: Vec<u8>,
    /// Device private key
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_bytes", &self.ca.len())
            .field("client_cert_bytes", &self.client_cert.len())
            .field("client_key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Load PEM files from disk
    pub fn load(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<Self, TransportError> {
        Ok(Self {
            ca: read_pem(ca_path)?,
            client_cert: read_pem(cert_path)?,
            client_key: read_pem(key_path)?,
        })
    }

    fn to_rumqttc(&self) -> TlsConfiguration {
        TlsConfiguration::Simple {
            ca: self.ca.clone(),
            alpn: None,
            client_auth: Some((self.client_cert.clone(), self.client_key.clone())),
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    let bytes = std::fs::read(path)
        .map_err(|e| TransportError::Tls(format!("failed to read {}: {e}", path.display())))?;

    if !bytes.starts_with(b"-----BEGIN") {
        return Err(TransportError::Tls(format!(
            "{} is not PEM encoded",
            path.display()
        )));
    }

    Ok(bytes)
}

/// Validate connection options before handing them to rumqttc (pure function)
pub fn validate_connect_options(options: &ConnectOptions) -> Result<(), TransportError> {
    if options.host.trim().is_empty() {
        return Err(TransportError::InvalidOptions("host is empty".to_string()));
    }
    if options.port == 0 {
        return Err(TransportError::InvalidOptions("port is 0".to_string()));
    }
    if options.client_id.is_empty() {
        return Err(TransportError::InvalidOptions(
            "client id is empty".to_string(),
        ));
    }
    // rumqttc rejects sub-second keep alives other than zero
    if !options.keep_alive.is_zero() && options.keep_alive < Duration::from_secs(1) {
        return Err(TransportError::InvalidOptions(format!(
            "keep alive {:?} is below one second",
            options.keep_alive
        )));
    }
    Ok(())
}

/// Build rumqttc options from connect options (pure function)
pub fn configure_mqtt_options(
    options: &ConnectOptions,
    tls: Option<&TlsMaterial>,
) -> Result<MqttOptions, TransportError> {
    validate_connect_options(options)?;

    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);

    // Authentication is by client certificate; the password stays empty
    mqtt_options.set_credentials(&options.username, "");

    if let Some(material) = tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_config(material.to_rumqttc()));
    }

    Ok(mqtt_options)
}
