//! Loading configuration files from disk

use iot_onboard::config::{ConfigError, OnboardConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file
}

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
[device]
scope_id = "0ne00TEST"
registration_id = "sensor-7"

[provisioning]
endpoint = "dps.example.net"
port = 8884
poll_delay_ms = 1000
poll_interval_ms = 2500
timeout_secs = 45

[hub]
port = 8885
ready_timeout_secs = 10
telemetry_payload = '{"status":"booting"}'

[mqtt]
keep_alive_secs = 60
clean_session = false
insecure = true

[telemetry]
interval_ms = 500
"#,
    );

    let config = OnboardConfig::load_from_file(file.path()).unwrap();
    let identity = config.identity().unwrap();
    assert_eq!(identity.scope_id(), "0ne00TEST");
    assert_eq!(identity.registration_id(), "sensor-7");
    assert!(config.tls.is_none());

    let settings = config.to_settings();
    assert_eq!(settings.provisioning.endpoint, "dps.example.net");
    assert_eq!(settings.provisioning.port, 8884);
    assert_eq!(settings.provisioning.poll_delay, Duration::from_secs(1));
    assert_eq!(settings.provisioning.poll_interval, Duration::from_millis(2500));
    assert_eq!(settings.provisioning.timeout, Duration::from_secs(45));
    assert_eq!(settings.provisioning.keep_alive, Duration::from_secs(60));
    assert!(!settings.provisioning.clean_session);

    assert_eq!(settings.session.port, 8885);
    assert_eq!(settings.session.ready_timeout, Duration::from_secs(10));
    assert_eq!(&settings.session.telemetry_payload[..], br#"{"status":"booting"}"#);
    assert_eq!(settings.session.telemetry_interval, Duration::from_millis(500));
    assert!(!settings.session.clean_session);
}

#[test]
fn test_load_minimal_file() {
    let file = write_config(
        r#"
[device]
scope_id = "0ne00TEST"
registration_id = "sensor-7"

[mqtt]
insecure = true
"#,
    );

    let settings = OnboardConfig::load_from_file(file.path())
        .unwrap()
        .to_settings();
    assert_eq!(
        settings.provisioning.endpoint,
        "global.azure-devices-provisioning.net"
    );
    assert_eq!(settings.provisioning.poll_delay, Duration::from_secs(4));
    assert_eq!(settings.provisioning.timeout, Duration::from_secs(60));
    assert_eq!(settings.session.ready_timeout, Duration::from_secs(30));
    assert_eq!(settings.session.telemetry_interval, Duration::from_millis(200));
}

#[test]
fn test_tls_section_paths() {
    let file = write_config(
        r#"
[device]
scope_id = "0ne00TEST"
registration_id = "sensor-7"

[tls]
ca_path = "/etc/onboard/ca.pem"
client_cert_path = "/etc/onboard/device.pem"
client_key_path = "/etc/onboard/device.key"
"#,
    );

    let config = OnboardConfig::load_from_file(file.path()).unwrap();
    let tls = config.tls.expect("tls section");
    assert_eq!(tls.ca_path.to_str(), Some("/etc/onboard/ca.pem"));
    assert!(tls.load().is_err(), "missing PEM files are reported");
}

#[test]
fn test_file_without_tls_or_opt_in() {
    let file = write_config(
        r#"
[device]
scope_id = "0ne00TEST"
registration_id = "sensor-7"
"#,
    );
    let result = OnboardConfig::load_from_file(file.path());
    assert!(
        matches!(result, Err(ConfigError::InvalidConfig(ref message)) if message.contains("mqtt.insecure"))
    );
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = OnboardConfig::load_from_file(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_file() {
    let file = write_config("[device\nscope_id = ");
    let result = OnboardConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_identity_in_file() {
    let file = write_config(
        r#"
[device]
scope_id = "0ne00TEST"
registration_id = "bad/id"
"#,
    );
    let result = OnboardConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidIdentity(_))));
}

#[test]
fn test_zero_interval_in_file() {
    let file = write_config(
        r#"
[device]
scope_id = "0ne00TEST"
registration_id = "sensor-7"

[telemetry]
interval_ms = 0
"#,
    );
    let result = OnboardConfig::load_from_file(file.path());
    assert!(
        matches!(result, Err(ConfigError::InvalidConfig(ref message)) if message.contains("telemetry.interval_ms"))
    );
}

#[test]
fn test_rendered_config_loads_back() {
    let file = write_config(
        r#"
[device]
scope_id = "0ne00TEST"
registration_id = "sensor-7"

[mqtt]
insecure = true
"#,
    );
    let config = OnboardConfig::load_from_file(file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let copy = write_config(&rendered);
    assert_eq!(OnboardConfig::load_from_file(copy.path()).unwrap(), config);
}
