//! Frame types for the Huddle protocol.
//!
//! Clients send [`InboundFrame`]s over the WebSocket and receive
//! [`OutboundFrame`]s. Both are plain JSON objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an inbound frame wants its content delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// A conversation the sender participates in.
    Conversation(i64),
    /// Legacy team-wide message.
    Team(i64),
    /// Legacy one-to-one message.
    Recipient(i64),
}

/// A frame sent by a client.
///
/// `conversation_id` takes precedence over the legacy `team_id` and
/// `recipient_id` fields; `team_id` takes precedence over `recipient_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,
    #[serde(default)]
    pub content: String,
}

impl InboundFrame {
    /// Create a conversation-addressed frame.
    #[must_use]
    pub fn to_conversation(conversation_id: i64, content: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create a legacy team-addressed frame.
    #[must_use]
    pub fn to_team(team_id: i64, content: impl Into<String>) -> Self {
        Self {
            team_id: Some(team_id),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create a legacy recipient-addressed frame.
    #[must_use]
    pub fn to_recipient(recipient_id: i64, content: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Resolve the effective address, if any.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        if let Some(id) = self.conversation_id {
            return Some(Address::Conversation(id));
        }
        if let Some(id) = self.team_id {
            return Some(Address::Team(id));
        }
        self.recipient_id.map(Address::Recipient)
    }

    /// Whether the content is empty once surrounding whitespace is removed.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Public identity of a message sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A persisted message as delivered to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    pub sender_id: i64,
    pub sender: SenderInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
