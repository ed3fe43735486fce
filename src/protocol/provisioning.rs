//! Device provisioning service grammar
//!
//! Credentials, topics and response parsing for the registration handshake.
//! A registration reply arrives on
//! `$dps/registrations/res/{status}/?$rid={rid}[&retry-after={secs}]` with a
//! JSON body describing the operation.

use super::DeviceIdentity;
use crate::transport::Credentials;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Global provisioning endpoint
pub const GLOBAL_ENDPOINT: &str = "global.azure-devices-provisioning.net";

/// Provisioning service API version embedded in the username
pub const API_VERSION: &str = "2019-03-31";

static RESPONSE_TOPIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$dps/registrations/res/(\d{3})/\?\$rid=([^&]*)(?:&retry-after=(\d+))?")
        .expect("response topic pattern is valid")
});

/// Client id and username for the provisioning connection (pure function)
pub fn derive_provisioning_credentials(identity: &DeviceIdentity) -> Credentials {
    Credentials {
        client_id: identity.registration_id().to_string(),
        username: format!(
            "{}/registrations/{}/api-version={API_VERSION}",
            identity.scope_id(),
            identity.registration_id()
        ),
    }
}

/// Topic builder for the registration handshake
pub struct ProvisioningTopics;

impl ProvisioningTopics {
    /// Filter covering every registration reply
    pub const RESPONSE_FILTER: &'static str = "$dps/registrations/res/#";

    pub fn register(request_id: u64) -> String {
        format!("$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
    }

    pub fn query(request_id: u64, operation_id: &str) -> String {
        format!(
            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={operation_id}"
        )
    }
}

/// Registration operation status reported by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
    Unknown(String),
}

impl OperationStatus {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "unassigned" => Self::Unassigned,
            "assigning" => Self::Assigning,
            "assigned" => Self::Assigned,
            "failed" => Self::Failed,
            "disabled" => Self::Disabled,
            _ => Self::Unknown(value.to_string()),
        }
    }

    /// Terminal failure states end the handshake
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Disabled)
    }
}

/// Hub assignment, present only when both parts are non-empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub endpoint: String,
    pub device_id: String,
}

/// Accepted (non-failure) registration reply
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResponse {
    pub status_code: u16,
    pub request_id: String,
    pub retry_after: Option<Duration>,
    pub operation_id: String,
    pub operation_status: OperationStatus,
    pub assignment: Option<Assignment>,
}

/// Service-side rejection of the registration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationFailure {
    pub status_code: u16,
    pub request_id: String,
    pub error_code: Option<u64>,
    pub tracking_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationReply {
    Progress(RegistrationResponse),
    Failure(RegistrationFailure),
}

/// Unparsable or uncorrelated registration replies
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("Malformed registration response: unrecognized topic {0}")]
    UnrecognizedTopic(String),

    #[error("Malformed registration response: invalid payload")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("Malformed registration response: missing operationId")]
    MissingOperationId,

    #[error("Malformed registration response: assigned hub {endpoint} without a device id")]
    IncompleteAssignment { endpoint: String },

    #[error("Malformed registration response: operation {received} does not match {expected}")]
    OperationMismatch { expected: String, received: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationPayload {
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    registration_state: Option<RegistrationStatePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationStatePayload {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    #[serde(default)]
    error_code: Option<u64>,
    #[serde(default)]
    tracking_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

struct ReplyTopic {
    status_code: u16,
    request_id: String,
    retry_after: Option<Duration>,
}

fn parse_reply_topic(topic: &str) -> Result<ReplyTopic, ResponseError> {
    let captures = RESPONSE_TOPIC
        .captures(topic)
        .ok_or_else(|| ResponseError::UnrecognizedTopic(topic.to_string()))?;

    let status_code = captures[1]
        .parse::<u16>()
        .map_err(|_| ResponseError::UnrecognizedTopic(topic.to_string()))?;
    let retry_after = captures
        .get(3)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(Duration::from_secs);

    Ok(ReplyTopic {
        status_code,
        request_id: captures[2].to_string(),
        retry_after,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Parse a registration reply from its topic and payload (pure function)
pub fn parse_registration_reply(
    topic: &str,
    payload: &[u8],
) -> Result<RegistrationReply, ResponseError> {
    let reply_topic = parse_reply_topic(topic)?;

    if reply_topic.status_code >= 300 {
        let error: Option<ErrorPayload> = serde_json::from_slice(payload).ok();
        let (error_code, tracking_id, message) = match error {
            Some(e) => (
                e.error_code,
                e.tracking_id,
                e.message
                    .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned()),
            ),
            None => (None, None, String::from_utf8_lossy(payload).into_owned()),
        };
        return Ok(RegistrationReply::Failure(RegistrationFailure {
            status_code: reply_topic.status_code,
            request_id: reply_topic.request_id,
            error_code,
            tracking_id,
            message,
        }));
    }

    let body: RegistrationPayload =
        serde_json::from_slice(payload).map_err(ResponseError::InvalidPayload)?;
    let operation_id = non_empty(body.operation_id).ok_or(ResponseError::MissingOperationId)?;

    let state = body.registration_state;
    let status = body
        .status
        .or_else(|| state.as_ref().and_then(|s| s.status.clone()))
        .map(|s| OperationStatus::parse(&s))
        .unwrap_or(OperationStatus::Unknown(String::new()));

    if status.is_failure() {
        let message = state
            .and_then(|s| s.error_message)
            .unwrap_or_else(|| format!("registration {status:?}"));
        return Ok(RegistrationReply::Failure(RegistrationFailure {
            status_code: reply_topic.status_code,
            request_id: reply_topic.request_id,
            error_code: None,
            tracking_id: None,
            message,
        }));
    }

    let assignment = match state {
        Some(state) => match (non_empty(state.assigned_hub), non_empty(state.device_id)) {
            (Some(endpoint), Some(device_id)) => Some(Assignment {
                endpoint,
                device_id,
            }),
            (Some(endpoint), None) => return Err(ResponseError::IncompleteAssignment { endpoint }),
            (None, _) => None,
        },
        None => None,
    };

    Ok(RegistrationReply::Progress(RegistrationResponse {
        status_code: reply_topic.status_code,
        request_id: reply_topic.request_id,
        retry_after: reply_topic.retry_after,
        operation_id,
        operation_status: status,
        assignment,
    }))
}
