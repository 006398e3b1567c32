use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{SubscriberId, SubscriptionFilter};
use crate::core::Outlier;

/// Server-to-subscriber envelope: `{type, data, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl HubMessage {
    fn new(kind: &'static str, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn connected(id: SubscriberId) -> Self {
        Self::new(
            "connected",
            json!({ "subscriber_id": id, "message": "Connected to outlier stream" }),
        )
    }

    pub fn outlier(outlier: &Outlier) -> Result<Self, serde_json::Error> {
        Ok(Self::new("outlier", serde_json::to_value(outlier)?))
    }

    pub fn subscribed(filter: &SubscriptionFilter) -> Result<Self, serde_json::Error> {
        Ok(Self::new("subscribed", serde_json::to_value(filter)?))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Subscriber-to-server control messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe(SubscriptionFilter),
    Ping,
    Pong,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
