//! Wire grammar of the provisioning service and the assigned hub
//!
//! Everything here is pure: credential derivation, topic construction and
//! response parsing. The coordinators in [`crate::workflow`] drive the I/O.

pub mod hub;
pub mod provisioning;

pub use hub::{classify_topic, derive_hub_credentials, HubMessage, HubTopics, TopicKind};
pub use provisioning::{
    derive_provisioning_credentials, parse_registration_reply, Assignment, OperationStatus,
    ProvisioningTopics, RegistrationFailure, RegistrationReply, RegistrationResponse,
    ResponseError,
};

use thiserror::Error;

/// Immutable device identity used for provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    scope_id: String,
    registration_id: String,
}

impl DeviceIdentity {
    /// Validate and build an identity. Both fields end up embedded in MQTT
    /// topics and usernames, so wildcard and separator characters are refused.
    pub fn new(
        scope_id: impl Into<String>,
        registration_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let scope_id = scope_id.into();
        let registration_id = registration_id.into();

        validate_identity_field("scope_id", &scope_id)?;
        validate_identity_field("registration_id", &registration_id)?;

        Ok(Self {
            scope_id,
            registration_id,
        })
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }
}

fn validate_identity_field(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty { field });
    }

    if let Some(ch) = value
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '#' | '+' | '?' | '&'))
    {
        return Err(IdentityError::InvalidChar { field, ch });
    }

    Ok(())
}

/// Identity validation errors
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} contains invalid character: '{ch}'")]
    InvalidChar { field: &'static str, ch: char },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_identity() {
        let identity = DeviceIdentity::new("0ne00ABC123", "sensor-01").unwrap();
        assert_eq!(identity.scope_id(), "0ne00ABC123");
        assert_eq!(identity.registration_id(), "sensor-01");
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert_eq!(
            DeviceIdentity::new("", "R1"),
            Err(IdentityError::Empty { field: "scope_id" })
        );
        assert_eq!(
            DeviceIdentity::new("S1", ""),
            Err(IdentityError::Empty {
                field: "registration_id"
            })
        );
    }

    #[test]
    fn test_topic_characters_rejected() {
        for bad in ["a/b", "a#", "a+b", "a b", "a?b", "a&b"] {
            assert!(
                matches!(
                    DeviceIdentity::new("S1", bad),
                    Err(IdentityError::InvalidChar { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    proptest! {
        #[test]
        fn identity_accepts_dps_style_ids(id in "[a-z0-9][a-z0-9._:-]{0,63}") {
            prop_assert!(DeviceIdentity::new("0ne0001", id).is_ok());
        }
    }
}
