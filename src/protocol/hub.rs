//! Assigned hub grammar: credentials, telemetry topic, feature subscriptions

use crate::transport::Credentials;
use bytes::Bytes;

/// Hub API version embedded in the username
pub const API_VERSION: &str = "2020-09-30";

const COMMANDS_PREFIX: &str = "$iothub/methods/POST/";
const PROPERTIES_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const PROPERTIES_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Client id and username for the hub connection (pure function)
pub fn derive_hub_credentials(endpoint: &str, device_id: &str) -> Credentials {
    Credentials {
        client_id: device_id.to_string(),
        username: format!("{endpoint}/{device_id}/?api-version={API_VERSION}"),
    }
}

/// Feature subscriptions a session makes once it is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TopicKind {
    Commands,
    PropertiesResponse,
    PropertiesPatch,
}

impl TopicKind {
    pub const ALL: [TopicKind; 3] = [
        TopicKind::Commands,
        TopicKind::PropertiesResponse,
        TopicKind::PropertiesPatch,
    ];

    /// Subscription filter for this feature
    pub fn filter(self) -> &'static str {
        match self {
            TopicKind::Commands => "$iothub/methods/POST/#",
            TopicKind::PropertiesResponse => "$iothub/twin/res/#",
            TopicKind::PropertiesPatch => "$iothub/twin/PATCH/properties/desired/#",
        }
    }
}

/// Classify an inbound hub topic by the feature it belongs to
pub fn classify_topic(topic: &str) -> Option<TopicKind> {
    if topic.starts_with(COMMANDS_PREFIX) {
        Some(TopicKind::Commands)
    } else if topic.starts_with(PROPERTIES_RESPONSE_PREFIX) {
        Some(TopicKind::PropertiesResponse)
    } else if topic.starts_with(PROPERTIES_PATCH_PREFIX) {
        Some(TopicKind::PropertiesPatch)
    } else {
        None
    }
}

/// Per-device topic builder
#[derive(Debug, Clone)]
pub struct HubTopics {
    device_id: String,
}

impl HubTopics {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn telemetry(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }
}

/// Inbound hub publish handed to the application
#[derive(Debug, Clone, PartialEq)]
pub struct HubMessage {
    pub kind: Option<TopicKind>,
    pub topic: String,
    pub payload: Bytes,
}

impl HubMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        let topic = topic.into();
        Self {
            kind: classify_topic(&topic),
            topic,
            payload,
        }
    }

    /// Request id carried in the `$rid` topic parameter, if any
    pub fn request_id(&self) -> Option<&str> {
        let (_, query) = self.topic.split_once("?$rid=")?;
        Some(query.split('&').next().unwrap_or(query))
    }

    /// Method name for command invocations
    pub fn command_name(&self) -> Option<&str> {
        if self.kind != Some(TopicKind::Commands) {
            return None;
        }
        self.topic[COMMANDS_PREFIX.len()..]
            .split('/')
            .next()
            .filter(|name| !name.is_empty())
    }
}
