//! Post-persistence notification seam.

use crate::error::ChatResult;
use crate::model::{Message, UserId};
use async_trait::async_trait;
use tracing::debug;

/// Receives every message after it has been persisted.
///
/// Push delivery lives outside this crate; implementations hand the message
/// over to it. Failures are logged by the caller and never fail the send.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A message was stored for the given recipients (sender excluded).
    async fn message_created(&self, message: &Message, recipients: &[UserId]) -> ChatResult<()>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn message_created(&self, message: &Message, recipients: &[UserId]) -> ChatResult<()> {
        debug!(
            message_id = message.id,
            sender_id = message.sender_id(),
            recipients = recipients.len(),
            "Message created"
        );
        Ok(())
    }
}
