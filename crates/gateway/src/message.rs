//! Message model shared by the push and pull paths.

use serde::{Deserialize, Serialize};

/// A message as submitted by a client, before the backend serializes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub namespace: String,
    pub group: String,
    #[serde(default)]
    pub user: String,
    pub content: String,
}

impl MessageBody {
    pub fn new(group: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            group: group.into(),
            user: String::new(),
            content: content.into(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// A serialized message: body plus the identity the backend assigned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: u64,
    pub sequence: u32,
    pub body: MessageBody,
}

/// Backend answer for one pushed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub timestamp: u64,
    pub sequence: u32,
    /// Set when the backend refused this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushResult {
    pub fn accepted(timestamp: u64, sequence: u32) -> Self {
        Self {
            timestamp,
            sequence,
            error: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }
}

/// Messages fanned out to a set of client sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageGroup {
    pub sessions: Vec<String>,
    pub msgs: Vec<Message>,
}
