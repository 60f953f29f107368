//! Wire shapes for the live channel.
//!
//! Inbound frames are `{topic, payload}` commands. Outbound frames are either
//! command replies (`{topic, payload: {success, msg, ..}}`) or broadcasts
//! (`{topic, kind, payload}`).

use parley_core::security::Credential;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const AUTH: &str = "auth";
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";

/// A parsed inbound command. Anything without a string `topic` fails to parse.
#[derive(Clone, Debug, Deserialize)]
pub struct CommandFrame {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl CommandFrame {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthPayload {
    pub username: String,
    #[serde(alias = "api_key")]
    pub credential: Credential,
}

#[derive(Debug, Deserialize)]
pub struct TopicsPayload {
    pub topics: Vec<String>,
}

pub fn auth_reply(success: bool, msg: &str) -> String {
    json!({
        "topic": AUTH,
        "payload": { "success": success, "msg": msg },
    })
    .to_string()
}

pub fn topics_reply(command: &str, topics: &[String], success: bool, msg: &str) -> String {
    json!({
        "topic": command,
        "payload": { "topics": topics, "success": success, "msg": msg },
    })
    .to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Snapshot,
    Insert,
    Delete,
}

impl BroadcastKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }
}

/// A state change addressed to one exact topic path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub topic: String,
    pub kind: BroadcastKind,
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn snapshot(topic: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            topic: topic.into(),
            kind: BroadcastKind::Snapshot,
            payload: Value::Array(items),
        }
    }

    pub fn insert(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            kind: BroadcastKind::Insert,
            payload,
        }
    }

    pub fn delete(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            kind: BroadcastKind::Delete,
            payload,
        }
    }

    pub fn to_frame(&self) -> String {
        json!({
            "topic": self.topic,
            "kind": self.kind.as_str(),
            "payload": self.payload,
        })
        .to_string()
    }
}
