//! Message persistence and history.
//!
//! Conversation messages are guarded by current membership. Legacy team and
//! recipient messages bypass conversations and are checked against the
//! [`Directory`] instead.

use crate::clock;
use crate::conversation::{current_participant_ids, is_member};
use crate::directory::Directory;
use crate::error::{ChatError, ChatResult};
use crate::model::{
    ConversationId, Message, MessageId, MessagePage, MessageTarget, TeamId, UserId,
};
use crate::notify::{Notifier, TracingNotifier};
use crate::store::Store;
use huddle_protocol::OutboundFrame;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, warn};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// Default upper bound on message length, in characters.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 4000;

/// A freshly persisted message and who should see it live.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Message,
    /// Current participants for conversation messages, the roster for
    /// legacy team messages, sender and recipient for legacy direct ones.
    pub audience: Vec<UserId>,
}

impl SentMessage {
    /// Audience members other than the sender.
    #[must_use]
    pub fn recipients(&self) -> Vec<UserId> {
        let sender = self.message.sender_id();
        self.audience
            .iter()
            .copied()
            .filter(|id| *id != sender)
            .collect()
    }
}

/// Persists messages and serves conversation history.
#[derive(Clone)]
pub struct MessageService {
    store: Store,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
    max_content_chars: usize,
}

impl std::fmt::Debug for MessageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService")
            .field("store", &self.store)
            .field("max_content_chars", &self.max_content_chars)
            .finish_non_exhaustive()
    }
}

impl MessageService {
    /// Create a service that logs notifications.
    #[must_use]
    pub fn new(store: Store, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            directory,
            notifier: Arc::new(TracingNotifier),
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
        }
    }

    /// Replace the notifier invoked after each send.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the maximum message length in characters.
    #[must_use]
    pub fn with_max_content_chars(mut self, max: usize) -> Self {
        self.max_content_chars = max.max(1);
        self
    }

    /// Send a message to a conversation the sender belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for blank or oversized content and
    /// [`ChatError::NotConversationMember`] if the sender is not a current
    /// participant. Nothing is stored in either case.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> ChatResult<SentMessage> {
        let content = self.validate(content)?;

        let sent = self
            .store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if !is_member(&tx, conversation_id, sender_id)? {
                    return Err(ChatError::NotConversationMember);
                }

                let created_at = clock::now_micros();
                let message = insert_message(
                    &tx,
                    MessageTarget::Conversation(conversation_id),
                    sender_id,
                    &content,
                    created_at,
                )?;
                tx.execute(
                    "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                    params![conversation_id, created_at],
                )?;
                let audience = current_participant_ids(&tx, conversation_id)?;
                tx.commit()?;

                Ok(SentMessage { message, audience })
            })
            .await?;

        debug!(
            message_id = sent.message.id,
            conversation_id,
            sender_id,
            audience = sent.audience.len(),
            "Stored conversation message"
        );
        self.notify(&sent).await;
        Ok(sent)
    }

    /// Send a message to any target.
    ///
    /// Conversation targets behave as [`MessageService::send_message`].
    /// Legacy team messages require the sender to be on the team roster;
    /// legacy direct messages are refused when the recipient has blocked
    /// the sender.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotTeamMember`], [`ChatError::SelfConversation`]
    /// or [`ChatError::Blocked`] for refused legacy messages, besides the
    /// errors of [`MessageService::send_message`].
    pub async fn send(
        &self,
        target: MessageTarget,
        sender_id: UserId,
        content: &str,
    ) -> ChatResult<SentMessage> {
        let audience = match target {
            MessageTarget::Conversation(id) => return self.send_message(id, sender_id, content).await,
            MessageTarget::LegacyTeam(team_id) => self.team_audience(team_id, sender_id).await?,
            MessageTarget::LegacyDirect(recipient_id) => {
                if recipient_id == sender_id {
                    return Err(ChatError::SelfConversation);
                }
                if self.directory.has_blocked(recipient_id, sender_id).await? {
                    debug!(sender_id, recipient_id, "Recipient blocks sender");
                    return Err(ChatError::Blocked);
                }
                let mut pair = vec![sender_id, recipient_id];
                pair.sort_unstable();
                pair
            }
        };

        let content = self.validate(content)?;
        let message = self
            .store
            .run(move |conn| {
                insert_message(conn, target, sender_id, &content, clock::now_micros())
            })
            .await?;

        debug!(
            message_id = message.id,
            ?target,
            sender_id,
            "Stored legacy message"
        );
        let sent = SentMessage { message, audience };
        self.notify(&sent).await;
        Ok(sent)
    }

    /// One page of a conversation's history, oldest first.
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`. With `before`, only
    /// messages strictly older than that message are returned.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotConversationMember`] if the user is not a
    /// current participant and [`ChatError::MessageNotFound`] if the cursor
    /// is unknown or belongs to another conversation.
    pub async fn get_messages(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> ChatResult<MessagePage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let fetch = i64::try_from(limit + 1).unwrap_or(i64::MAX);

        self.store
            .run(move |conn| {
                if !is_member(conn, conversation_id, user_id)? {
                    return Err(ChatError::NotConversationMember);
                }

                let mut rows = match before {
                    Some(cursor_id) => {
                        let cursor: Option<(Option<ConversationId>, i64)> = conn
                            .query_row(
                                "SELECT conversation_id, created_at FROM messages WHERE id = ?1",
                                params![cursor_id],
                                |row| Ok((row.get(0)?, row.get(1)?)),
                            )
                            .optional()?;
                        let cursor_at = match cursor {
                            Some((Some(id), created_at)) if id == conversation_id => created_at,
                            _ => return Err(ChatError::MessageNotFound(cursor_id)),
                        };

                        let mut stmt = conn.prepare(&format!(
                            "{} WHERE m.conversation_id = ?1
                               AND (m.created_at < ?2 OR (m.created_at = ?2 AND m.id < ?3))
                             ORDER BY m.created_at DESC, m.id DESC LIMIT ?4",
                            Message::SELECT
                        ))?;
                        let rows = stmt
                            .query_map(
                                params![conversation_id, cursor_at, cursor_id, fetch],
                                Message::from_row,
                            )?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "{} WHERE m.conversation_id = ?1
                             ORDER BY m.created_at DESC, m.id DESC LIMIT ?2",
                            Message::SELECT
                        ))?;
                        let rows = stmt
                            .query_map(params![conversation_id, fetch], Message::from_row)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };

                let has_more = rows.len() > limit;
                rows.truncate(limit);
                rows.reverse();

                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )?;

                Ok(MessagePage {
                    messages: rows.iter().map(OutboundFrame::from).collect(),
                    has_more,
                    total: u64::try_from(total).unwrap_or_default(),
                })
            })
            .await
    }

    /// Load a single message with its sender.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::MessageNotFound`] for an unknown id.
    pub async fn get_message(&self, message_id: MessageId) -> ChatResult<Message> {
        self.store
            .run(move |conn| {
                load_message(conn, message_id)?.ok_or(ChatError::MessageNotFound(message_id))
            })
            .await
    }

    fn validate(&self, content: &str) -> ChatResult<String> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("Message content is required".into()));
        }
        if content.chars().count() > self.max_content_chars {
            return Err(ChatError::Validation(format!(
                "Message exceeds {} characters",
                self.max_content_chars
            )));
        }
        Ok(content.to_string())
    }

    async fn team_audience(&self, team_id: TeamId, sender_id: UserId) -> ChatResult<Vec<UserId>> {
        if !self.directory.is_team_member(team_id, sender_id).await? {
            return Err(ChatError::NotTeamMember(team_id));
        }
        self.directory.team_member_ids(team_id).await
    }

    async fn notify(&self, sent: &SentMessage) {
        let recipients = sent.recipients();
        if let Err(e) = self.notifier.message_created(&sent.message, &recipients).await {
            warn!(message_id = sent.message.id, error = %e, "Notifier failed");
        }
    }
}

fn insert_message(
    conn: &Connection,
    target: MessageTarget,
    sender_id: UserId,
    content: &str,
    created_at: i64,
) -> ChatResult<Message> {
    let (conversation_id, team_id, recipient_id) = target.columns();
    conn.execute(
        "INSERT INTO messages (conversation_id, team_id, recipient_id, sender_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![conversation_id, team_id, recipient_id, sender_id, content, created_at],
    )?;
    let id = conn.last_insert_rowid();
    load_message(conn, id)?.ok_or(ChatError::MessageNotFound(id))
}

fn load_message(conn: &Connection, message_id: MessageId) -> ChatResult<Option<Message>> {
    Ok(conn
        .query_row(
            &format!("{} WHERE m.id = ?1", Message::SELECT),
            params![message_id],
            Message::from_row,
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationService;
    use crate::directory::SqlDirectory;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct Fixture {
        conversations: ConversationService,
        messages: MessageService,
        directory: SqlDirectory,
    }

    async fn fixture() -> Fixture {
        let store = Store::memory().unwrap();
        let directory = SqlDirectory::new(store.clone());
        directory.upsert_user(1, "alice", Some("Alice".into())).await.unwrap();
        directory.upsert_user(2, "bob", None).await.unwrap();
        directory.upsert_user(3, "carol", None).await.unwrap();

        Fixture {
            conversations: ConversationService::new(store.clone()),
            messages: MessageService::new(store, Arc::new(directory.clone())),
            directory,
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(MessageId, Vec<UserId>)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn message_created(&self, message: &Message, recipients: &[UserId]) -> ChatResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((message.id, recipients.to_vec()));
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn message_created(&self, _: &Message, _: &[UserId]) -> ChatResult<()> {
            Err(ChatError::Store("push gateway unavailable".into()))
        }
    }

    fn contents(page: &MessagePage) -> Vec<&str> {
        page.messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn test_unread_and_pagination_scenario() {
        let f = fixture().await;
        let direct = f.conversations.create_direct(1, 2).await.unwrap();

        f.messages.send_message(direct.id, 1, "hi").await.unwrap();
        let there = f.messages.send_message(direct.id, 1, "there").await.unwrap();

        assert_eq!(f.conversations.unread_count(direct.id, 2).await.unwrap(), 2);

        let page = f.messages.get_messages(direct.id, 2, 1, None).await.unwrap();
        assert_eq!(contents(&page), vec!["there"]);
        assert!(page.has_more);
        assert_eq!(page.total, 2);

        let page = f
            .messages
            .get_messages(direct.id, 2, 1, Some(there.message.id))
            .await
            .unwrap();
        assert_eq!(contents(&page), vec!["hi"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_pagination_round_trip() {
        let f = fixture().await;
        let group = f.conversations.create_group(1, vec![2, 3], None).await.unwrap();

        let mut sent_ids = Vec::new();
        for i in 0..7 {
            let sent = f
                .messages
                .send_message(group.id, 1 + (i % 3), &format!("message {i}"))
                .await
                .unwrap();
            sent_ids.push(sent.message.id);
        }

        let mut seen = Vec::new();
        let mut pages = 0;
        let mut cursor = None;
        loop {
            let page = f.messages.get_messages(group.id, 2, 3, cursor).await.unwrap();
            pages += 1;
            assert!(page
                .messages
                .windows(2)
                .all(|w| (w[0].created_at, w[0].id) < (w[1].created_at, w[1].id)));
            let mut ids: Vec<_> = page.messages.iter().map(|m| m.id).collect();
            ids.extend(seen);
            seen = ids;
            cursor = page.messages.first().map(|m| m.id);
            if !page.has_more {
                break;
            }
        }

        assert_eq!(pages, 3);
        assert_eq!(seen, sent_ids);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), sent_ids.len());
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let f = fixture().await;
        let direct = f.conversations.create_direct(1, 2).await.unwrap();
        f.messages.send_message(direct.id, 1, "only").await.unwrap();
        f.messages.send_message(direct.id, 1, "two").await.unwrap();

        let page = f.messages.get_messages(direct.id, 1, 0, None).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.has_more);

        let page = f.messages.get_messages(direct.id, 1, 10_000, None).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_non_member_send_persists_nothing() {
        let f = fixture().await;
        let direct = f.conversations.create_direct(1, 2).await.unwrap();

        assert!(matches!(
            f.messages.send_message(direct.id, 3, "intrusion").await,
            Err(ChatError::NotConversationMember)
        ));

        let page = f.messages.get_messages(direct.id, 1, 10, None).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn test_non_member_cannot_read() {
        let f = fixture().await;
        let direct = f.conversations.create_direct(1, 2).await.unwrap();
        assert!(matches!(
            f.messages.get_messages(direct.id, 3, 10, None).await,
            Err(ChatError::NotConversationMember)
        ));
    }

    #[tokio::test]
    async fn test_cursor_from_other_conversation() {
        let f = fixture().await;
        let first = f.conversations.create_direct(1, 2).await.unwrap();
        let second = f.conversations.create_direct(1, 3).await.unwrap();
        let foreign = f.messages.send_message(second.id, 3, "elsewhere").await.unwrap();

        assert!(matches!(
            f.messages
                .get_messages(first.id, 1, 10, Some(foreign.message.id))
                .await,
            Err(ChatError::MessageNotFound(_))
        ));
        assert!(matches!(
            f.messages.get_messages(first.id, 1, 10, Some(12_345)).await,
            Err(ChatError::MessageNotFound(12_345))
        ));
    }

    #[tokio::test]
    async fn test_send_touches_updated_at_and_returns_audience() {
        let f = fixture().await;
        let group = f.conversations.create_group(1, vec![2, 3], None).await.unwrap();
        f.conversations.leave(group.id, 3).await.unwrap();

        let sent = f.messages.send_message(group.id, 2, "  hello  ").await.unwrap();
        assert_eq!(sent.message.content, "hello");
        assert_eq!(sent.message.sender.username, "bob");
        assert_eq!(sent.audience, vec![1, 2]);
        assert_eq!(sent.recipients(), vec![1]);

        let details = f.conversations.get_conversation(group.id, 1).await.unwrap();
        assert_eq!(details.conversation.updated_at, sent.message.created_at);
    }

    #[tokio::test]
    async fn test_content_validation() {
        let f = fixture().await;
        let direct = f.conversations.create_direct(1, 2).await.unwrap();
        let messages = f.messages.clone().with_max_content_chars(5);

        assert!(matches!(
            messages.send_message(direct.id, 1, "   ").await,
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(
            messages.send_message(direct.id, 1, "toolong").await,
            Err(ChatError::Validation(_))
        ));
        assert!(messages.send_message(direct.id, 1, "héllo").await.is_ok());
    }

    #[tokio::test]
    async fn test_legacy_team_message() {
        let f = fixture().await;
        f.directory.add_team_member(10, 1).await.unwrap();
        f.directory.add_team_member(10, 2).await.unwrap();

        let sent = f
            .messages
            .send(MessageTarget::LegacyTeam(10), 1, "standup")
            .await
            .unwrap();
        assert_eq!(sent.message.target, MessageTarget::LegacyTeam(10));
        assert_eq!(sent.audience, vec![1, 2]);

        assert!(matches!(
            f.messages.send(MessageTarget::LegacyTeam(10), 3, "let me in").await,
            Err(ChatError::NotTeamMember(10))
        ));
    }

    #[tokio::test]
    async fn test_legacy_direct_message() {
        let f = fixture().await;

        let sent = f
            .messages
            .send(MessageTarget::LegacyDirect(2), 1, "psst")
            .await
            .unwrap();
        let loaded = f.messages.get_message(sent.message.id).await.unwrap();
        assert_eq!(loaded.target, MessageTarget::LegacyDirect(2));
        assert_eq!(loaded.sender.display_name.as_deref(), Some("Alice"));

        assert!(matches!(
            f.messages.send(MessageTarget::LegacyDirect(1), 1, "me").await,
            Err(ChatError::SelfConversation)
        ));

        f.directory.block_user(2, 1).await.unwrap();
        assert!(matches!(
            f.messages.send(MessageTarget::LegacyDirect(2), 1, "again").await,
            Err(ChatError::Blocked)
        ));
        assert!(f.messages.send(MessageTarget::LegacyDirect(1), 2, "ok").await.is_ok());
    }

    #[tokio::test]
    async fn test_send_routes_conversation_target() {
        let f = fixture().await;
        let direct = f.conversations.create_direct(1, 2).await.unwrap();
        let sent = f
            .messages
            .send(MessageTarget::Conversation(direct.id), 2, "via send")
            .await
            .unwrap();
        assert_eq!(sent.message.target.conversation_id(), Some(direct.id));
        assert_eq!(sent.audience, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_notifier_receives_recipients() {
        let f = fixture().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let messages = f.messages.clone().with_notifier(notifier.clone());
        let group = f.conversations.create_group(1, vec![2, 3], None).await.unwrap();

        let sent = messages.send_message(group.id, 1, "ping").await.unwrap();

        let calls = notifier.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(sent.message.id, vec![2, 3])]);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_fail_send() {
        let f = fixture().await;
        let messages = f.messages.clone().with_notifier(Arc::new(FailingNotifier));
        let direct = f.conversations.create_direct(1, 2).await.unwrap();

        assert!(messages.send_message(direct.id, 1, "still here").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_message() {
        let f = fixture().await;
        assert!(matches!(
            f.messages.get_message(77).await,
            Err(ChatError::MessageNotFound(77))
        ));
    }
}
