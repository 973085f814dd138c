//! Data model for conversations, participants and messages.

use crate::clock;
use chrono::{DateTime, Utc};
use huddle_protocol::{OutboundFrame, SenderInfo};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// A user identifier, issued by the identity provider.
pub type UserId = i64;

/// A team identifier, issued by the team roster owner.
pub type TeamId = i64;

/// A conversation identifier.
pub type ConversationId = i64;

/// A message identifier.
pub type MessageId = i64;

/// Kind of conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Exactly two users, deduplicated per pair.
    Direct,
    /// An explicit set of users with an optional title.
    Group,
    /// Participants mirror a team roster.
    Team,
}

impl ConversationKind {
    /// The stored name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
            ConversationKind::Team => "team",
        }
    }
}

impl ToSql for ConversationKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ConversationKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "direct" => Ok(ConversationKind::Direct),
            "group" => Ok(ConversationKind::Group),
            "team" => Ok(ConversationKind::Team),
            other => Err(FromSqlError::Other(
                format!("unknown conversation kind: {other}").into(),
            )),
        }
    }
}

/// Deterministic key shared by both orderings of a user pair.
#[must_use]
pub fn direct_key(a: UserId, b: UserId) -> String {
    format!("direct_{}_{}", a.min(b), a.max(b))
}

/// A message thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub(crate) const COLUMNS: &'static str =
        "c.id, c.kind, c.title, c.team_id, c.direct_key, c.created_at, c.updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            title: row.get(2)?,
            team_id: row.get(3)?,
            direct_key: row.get(4)?,
            created_at: clock::from_micros(row.get(5)?),
            updated_at: clock::from_micros(row.get(6)?),
        })
    }
}

/// A user's membership record in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub(crate) const COLUMNS: &'static str =
        "p.conversation_id, p.user_id, p.joined_at, p.last_read_at, p.left_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            user_id: row.get(1)?,
            joined_at: clock::from_micros(row.get(2)?),
            last_read_at: row.get::<_, Option<i64>>(3)?.map(clock::from_micros),
            left_at: row.get::<_, Option<i64>>(4)?.map(clock::from_micros),
        })
    }
}

/// Public identity of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl From<&UserSummary> for SenderInfo {
    fn from(user: &UserSummary) -> Self {
        SenderInfo {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
        }
    }
}

/// Where a message is addressed.
///
/// Legacy team and recipient addressing predates conversations and bypasses
/// them entirely; exactly one variant is ever stored per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum MessageTarget {
    Conversation(ConversationId),
    LegacyTeam(TeamId),
    LegacyDirect(UserId),
}

impl MessageTarget {
    /// Split into the `(conversation_id, team_id, recipient_id)` columns.
    #[must_use]
    pub fn columns(&self) -> (Option<ConversationId>, Option<TeamId>, Option<UserId>) {
        match *self {
            MessageTarget::Conversation(id) => (Some(id), None, None),
            MessageTarget::LegacyTeam(id) => (None, Some(id), None),
            MessageTarget::LegacyDirect(id) => (None, None, Some(id)),
        }
    }

    fn from_columns(
        conversation_id: Option<ConversationId>,
        team_id: Option<TeamId>,
        recipient_id: Option<UserId>,
    ) -> Option<Self> {
        match (conversation_id, team_id, recipient_id) {
            (Some(id), None, None) => Some(MessageTarget::Conversation(id)),
            (None, Some(id), None) => Some(MessageTarget::LegacyTeam(id)),
            (None, None, Some(id)) => Some(MessageTarget::LegacyDirect(id)),
            _ => None,
        }
    }

    /// The conversation this message belongs to, if conversation-addressed.
    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match *self {
            MessageTarget::Conversation(id) => Some(id),
            _ => None,
        }
    }
}

/// A persisted message with its sender's identity attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub target: MessageTarget,
    pub sender: UserSummary,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub(crate) const SELECT: &'static str = "SELECT m.id, m.conversation_id, m.team_id, m.recipient_id, m.sender_id, \
         m.content, m.created_at, u.username, u.display_name \
         FROM messages m LEFT JOIN users u ON u.id = m.sender_id";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let target = MessageTarget::from_columns(row.get(1)?, row.get(2)?, row.get(3)?)
            .ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Null,
                    "message must have exactly one target".into(),
                )
            })?;
        let sender_id: UserId = row.get(4)?;

        Ok(Self {
            id: row.get(0)?,
            target,
            sender: UserSummary {
                id: sender_id,
                username: row
                    .get::<_, Option<String>>(7)?
                    .unwrap_or_else(|| format!("user{sender_id}")),
                display_name: row.get(8)?,
            },
            content: row.get(5)?,
            created_at: clock::from_micros(row.get(6)?),
        })
    }

    /// The sending user's id.
    #[must_use]
    pub fn sender_id(&self) -> UserId {
        self.sender.id
    }
}

impl From<&Message> for OutboundFrame {
    fn from(message: &Message) -> Self {
        let (conversation_id, team_id, recipient_id) = message.target.columns();
        OutboundFrame {
            id: message.id,
            conversation_id,
            sender_id: message.sender.id,
            sender: SenderInfo::from(&message.sender),
            team_id,
            recipient_id,
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

/// A conversation as shown in a user's inbox.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub unread_count: u64,
    pub last_message: OutboundFrame,
}

/// A conversation with its current participants.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetails {
    pub conversation: Conversation,
    pub participants: Vec<Participant>,
}

/// One page of a conversation's history, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<OutboundFrame>,
    pub has_more: bool,
    pub total: u64,
}

/// Result of reconciling a team conversation against the team roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub conversation_id: ConversationId,
    pub added: Vec<UserId>,
    pub removed: Vec<UserId>,
}
