//! Error taxonomy for the conversation engine.

use crate::model::{ConversationId, MessageId, TeamId};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type ChatResult<T> = Result<T, ChatError>;

/// Broad classification callers use to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller may not perform the operation.
    Authorization,
    /// The request itself is malformed.
    Validation,
    /// A referenced conversation or message does not exist.
    NotFound,
    /// The store failed; the operation may succeed if retried.
    TransientStore,
}

/// Conversation engine errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Both sides of a direct conversation are the same user.
    #[error("Cannot start a conversation with yourself")]
    SelfConversation,

    /// The user is not a current participant of the conversation.
    #[error("Not a member of this conversation")]
    NotConversationMember,

    /// The user is not on the team's roster.
    #[error("Not a member of team {0}")]
    NotTeamMember(TeamId),

    /// The recipient has blocked the sender.
    #[error("Recipient does not accept messages from this sender")]
    Blocked,

    /// Unknown conversation.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// Unknown message, or a message outside the requested conversation.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Missing or malformed input.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Persistence failure.
    #[error("Storage error: {0}")]
    Store(String),
}

impl ChatError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::NotConversationMember | ChatError::NotTeamMember(_) | ChatError::Blocked => {
                ErrorKind::Authorization
            }
            ChatError::SelfConversation | ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::ConversationNotFound(_) | ChatError::MessageNotFound(_) => {
                ErrorKind::NotFound
            }
            ChatError::Store(_) => ErrorKind::TransientStore,
        }
    }

    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Store(e.to_string())
    }
}

impl From<r2d2::Error> for ChatError {
    fn from(e: r2d2::Error) -> Self {
        ChatError::Store(format!("connection pool: {e}"))
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChatError::Store(format!("blocking task failed: {e}"))
    }
}
