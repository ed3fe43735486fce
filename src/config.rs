//! Configuration system for the onboarding client
//!
//! A TOML file names the device identity and tunes the provisioning handshake,
//! the hub session, MQTT keep-alive and periodic telemetry. `[device]` is
//! required, and so is `[tls]` unless `mqtt.insecure` opts into plaintext.
//! Every other section falls back to defaults.

use crate::error::TransportError;
use crate::protocol::provisioning::GLOBAL_ENDPOINT;
use crate::protocol::{DeviceIdentity, IdentityError};
use crate::transport::mqtt::TlsMaterial;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main onboarding configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OnboardConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub provisioning: ProvisioningSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    /// Mutual TLS material; absent only with `mqtt.insecure = true`
    pub tls: Option<TlsSection>,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Device identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Provisioning scope the device enrolls under
    pub scope_id: String,
    /// Registration id, also the provisioning client id
    pub registration_id: String,
}

/// Provisioning handshake section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningSection {
    #[serde(default = "default_provisioning_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Delay before the first status poll
    #[serde(default = "default_poll_ms")]
    pub poll_delay_ms: u64,
    /// Minimum spacing between later polls
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for the whole handshake
    #[serde(default = "default_provisioning_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            endpoint: default_provisioning_endpoint(),
            port: default_port(),
            poll_delay_ms: default_poll_ms(),
            poll_interval_ms: default_poll_ms(),
            timeout_secs: default_provisioning_timeout(),
        }
    }
}

/// Hub session section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long to wait for the hub to acknowledge the connection
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Payload sent when a telemetry call carries none
    #[serde(default = "default_telemetry_payload")]
    pub telemetry_payload: String,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            ready_timeout_secs: default_ready_timeout(),
            telemetry_payload: default_telemetry_payload(),
        }
    }
}

/// MQTT session options shared by both connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Connect without TLS. Required when `[tls]` is absent.
    #[serde(default)]
    pub insecure: bool,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            clean_session: default_clean_session(),
            insecure: false,
        }
    }
}

/// PEM file locations for mutual TLS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub ca_path: PathBuf,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
}

impl TlsSection {
    pub fn load(&self) -> Result<TlsMaterial, TransportError> {
        TlsMaterial::load(&self.ca_path, &self.client_cert_path, &self.client_key_path)
    }
}

/// Periodic telemetry section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_interval")]
    pub interval_ms: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_ms: default_telemetry_interval(),
        }
    }
}

fn default_provisioning_endpoint() -> String {
    GLOBAL_ENDPOINT.to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_poll_ms() -> u64 {
    4000
}

fn default_provisioning_timeout() -> u64 {
    60
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_telemetry_payload() -> String {
    r#"{"status":"online"}"#.to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_clean_session() -> bool {
    true
}

fn default_telemetry_interval() -> u64 {
    200
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Runtime settings for the provisioning handshake
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningSettings {
    pub endpoint: String,
    pub port: u16,
    pub poll_delay: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        ProvisioningSection::default().to_settings(&MqttSection::default())
    }
}

/// Runtime settings for the hub session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub port: u16,
    pub ready_timeout: Duration,
    pub telemetry_payload: Bytes,
    pub telemetry_interval: Duration,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        HubSection::default().to_settings(&MqttSection::default(), &TelemetrySection::default())
    }
}

/// Both halves of the runtime settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub provisioning: ProvisioningSettings,
    pub session: SessionSettings,
}

impl ProvisioningSection {
    fn to_settings(&self, mqtt: &MqttSection) -> ProvisioningSettings {
        ProvisioningSettings {
            endpoint: self.endpoint.clone(),
            port: self.port,
            poll_delay: Duration::from_millis(self.poll_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_secs(self.timeout_secs),
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            clean_session: mqtt.clean_session,
        }
    }
}

impl HubSection {
    fn to_settings(&self, mqtt: &MqttSection, telemetry: &TelemetrySection) -> SessionSettings {
        SessionSettings {
            port: self.port,
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            telemetry_payload: Bytes::from(self.telemetry_payload.clone().into_bytes()),
            telemetry_interval: Duration::from_millis(telemetry.interval_ms),
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            clean_session: mqtt.clean_session,
        }
    }
}

impl OnboardConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: OnboardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate identity and value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;

        if self.provisioning.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "provisioning.endpoint cannot be empty".to_string(),
            ));
        }
        if self.provisioning.port == 0 || self.hub.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "ports must be non-zero".to_string(),
            ));
        }

        let positive = [
            ("provisioning.poll_interval_ms", self.provisioning.poll_interval_ms),
            ("provisioning.timeout_secs", self.provisioning.timeout_secs),
            ("hub.ready_timeout_secs", self.hub.ready_timeout_secs),
            ("telemetry.interval_ms", self.telemetry.interval_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }

        match (&self.tls, self.mqtt.insecure) {
            (None, false) => Err(ConfigError::InvalidConfig(
                "no [tls] section; set mqtt.insecure = true to connect without TLS".to_string(),
            )),
            (Some(_), true) => Err(ConfigError::InvalidConfig(
                "mqtt.insecure conflicts with the [tls] section".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        Ok(DeviceIdentity::new(
            &self.device.scope_id,
            &self.device.registration_id,
        )?)
    }

    /// Convert to runtime settings with `Duration`s
    pub fn to_settings(&self) -> Settings {
        Settings {
            provisioning: self.provisioning.to_settings(&self.mqtt),
            session: self.hub.to_settings(&self.mqtt, &self.telemetry),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
scope_id = "0ne00TEST"
registration_id = "test-device"

[provisioning]
endpoint = "localhost"
port = 1883
poll_delay_ms = 10
poll_interval_ms = 10
timeout_secs = 2

[mqtt]
insecure = true
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
