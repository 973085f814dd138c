//! Conversation lifecycle and membership.
//!
//! Direct conversations are deduplicated per user pair through their
//! `direct_key`; team conversations are bound one-to-one to a team. Both are
//! created with `INSERT .. ON CONFLICT DO NOTHING` followed by a re-read, so
//! concurrent callers converge on the same row.

use crate::clock;
use crate::error::{ChatError, ChatResult};
use crate::model::{
    direct_key, Conversation, ConversationDetails, ConversationId, ConversationKind,
    ConversationSummary, Message, Participant, SyncOutcome, TeamId, UserId,
};
use crate::store::Store;
use chrono::{DateTime, Utc};
use huddle_protocol::OutboundFrame;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Creates conversations and manages their participants.
#[derive(Debug, Clone)]
pub struct ConversationService {
    store: Store,
}

impl ConversationService {
    /// Create a service over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Get or create the direct conversation between two users.
    ///
    /// Argument order does not matter: `(a, b)` and `(b, a)` resolve to the
    /// same conversation.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::SelfConversation`] if `a == b`.
    pub async fn create_direct(&self, a: UserId, b: UserId) -> ChatResult<Conversation> {
        if a == b {
            return Err(ChatError::SelfConversation);
        }

        let key = direct_key(a, b);
        self.store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = clock::now_micros();

                let inserted = tx.execute(
                    "INSERT INTO conversations (kind, direct_key, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(direct_key) DO NOTHING",
                    params![ConversationKind::Direct, key, now],
                )?;
                if inserted == 1 {
                    let id = tx.last_insert_rowid();
                    add_participants(&tx, id, &[a, b], now)?;
                    info!(conversation_id = id, a, b, "Created direct conversation");
                }

                let conversation = tx.query_row(
                    &format!(
                        "SELECT {} FROM conversations c WHERE c.direct_key = ?1",
                        Conversation::COLUMNS
                    ),
                    params![key],
                    Conversation::from_row,
                )?;
                tx.commit()?;
                Ok(conversation)
            })
            .await
    }

    /// Create a new group conversation.
    ///
    /// The creator is always a participant. Duplicate ids are ignored and a
    /// blank title is treated as no title.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] if nobody besides the creator is
    /// listed.
    pub async fn create_group(
        &self,
        creator: UserId,
        participant_ids: Vec<UserId>,
        title: Option<String>,
    ) -> ChatResult<Conversation> {
        let mut members: BTreeSet<UserId> = participant_ids.into_iter().collect();
        members.remove(&creator);
        if members.is_empty() {
            return Err(ChatError::Validation(
                "A group needs at least one participant besides the creator".into(),
            ));
        }
        members.insert(creator);

        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        self.store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = clock::now_micros();

                tx.execute(
                    "INSERT INTO conversations (kind, title, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)",
                    params![ConversationKind::Group, title, now],
                )?;
                let id = tx.last_insert_rowid();
                let members: Vec<UserId> = members.into_iter().collect();
                add_participants(&tx, id, &members, now)?;

                let conversation = load_conversation(&tx, id)?
                    .ok_or(ChatError::ConversationNotFound(id))?;
                tx.commit()?;

                info!(
                    conversation_id = id,
                    creator,
                    participants = members.len(),
                    "Created group conversation"
                );
                Ok(conversation)
            })
            .await
    }

    /// Get or create the conversation bound to a team.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn ensure_team(&self, team_id: TeamId) -> ChatResult<Conversation> {
        self.store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let conversation = ensure_team_conversation(&tx, team_id)?;
                tx.commit()?;
                Ok(conversation)
            })
            .await
    }

    /// Make a team conversation's participants exactly `member_ids`.
    ///
    /// Missing members are added; participants not listed are deleted. The
    /// conversation is created first if the team has none yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; nothing is changed in that case.
    pub async fn sync_team_members(
        &self,
        team_id: TeamId,
        member_ids: Vec<UserId>,
    ) -> ChatResult<SyncOutcome> {
        let wanted: BTreeSet<UserId> = member_ids.into_iter().collect();

        let outcome = self
            .store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let conversation = ensure_team_conversation(&tx, team_id)?;
                let now = clock::now_micros();

                let existing: BTreeSet<UserId> = {
                    let mut stmt = tx.prepare(
                        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1",
                    )?;
                    let ids = stmt
                        .query_map(params![conversation.id], |row| row.get(0))?
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    ids
                };

                let added: Vec<UserId> = wanted.difference(&existing).copied().collect();
                let removed: Vec<UserId> = existing.difference(&wanted).copied().collect();

                add_participants(&tx, conversation.id, &added, now)?;
                for user_id in &removed {
                    tx.execute(
                        "DELETE FROM conversation_participants
                         WHERE conversation_id = ?1 AND user_id = ?2",
                        params![conversation.id, user_id],
                    )?;
                }
                tx.commit()?;

                Ok(SyncOutcome {
                    conversation_id: conversation.id,
                    added,
                    removed,
                })
            })
            .await?;

        info!(
            team_id,
            conversation_id = outcome.conversation_id,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "Synced team conversation members"
        );
        Ok(outcome)
    }

    /// Conversations the user currently belongs to that have at least one
    /// message, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list_conversations(&self, user_id: UserId) -> ChatResult<Vec<ConversationSummary>> {
        self.store
            .run(move |conn| {
                let conversations = {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM conversations c
                         JOIN conversation_participants p
                           ON p.conversation_id = c.id AND p.user_id = ?1 AND p.left_at IS NULL
                         WHERE EXISTS (SELECT 1 FROM messages m WHERE m.conversation_id = c.id)
                         ORDER BY c.updated_at DESC, c.id DESC",
                        Conversation::COLUMNS
                    ))?;
                    let rows = stmt
                        .query_map(params![user_id], Conversation::from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut summaries = Vec::with_capacity(conversations.len());
                for conversation in conversations {
                    let Some(last) = last_message(conn, conversation.id)? else {
                        continue;
                    };
                    let unread_count = count_unread(conn, conversation.id, user_id)?;
                    summaries.push(ConversationSummary {
                        conversation,
                        unread_count,
                        last_message: OutboundFrame::from(&last),
                    });
                }
                Ok(summaries)
            })
            .await
    }

    /// A conversation with its current participants.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::ConversationNotFound`] for an unknown id and
    /// [`ChatError::NotConversationMember`] if the user is not a current
    /// participant.
    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<ConversationDetails> {
        self.store
            .run(move |conn| {
                let conversation = load_conversation(conn, conversation_id)?
                    .ok_or(ChatError::ConversationNotFound(conversation_id))?;
                if !is_member(conn, conversation_id, user_id)? {
                    return Err(ChatError::NotConversationMember);
                }

                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM conversation_participants p
                     WHERE p.conversation_id = ?1 AND p.left_at IS NULL
                     ORDER BY p.joined_at, p.user_id",
                    Participant::COLUMNS
                ))?;
                let participants = stmt
                    .query_map(params![conversation_id], Participant::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(ConversationDetails {
                    conversation,
                    participants,
                })
            })
            .await
    }

    /// Record that the user has read the conversation up to `at`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotConversationMember`] if the user has no
    /// participant row.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> ChatResult<()> {
        let updated = self
            .store
            .run(move |conn| {
                Ok(conn.execute(
                    "UPDATE conversation_participants SET last_read_at = ?3
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    params![conversation_id, user_id, clock::to_micros(at)],
                )?)
            })
            .await?;

        if updated == 0 {
            return Err(ChatError::NotConversationMember);
        }
        debug!(conversation_id, user_id, "Marked conversation read");
        Ok(())
    }

    /// Leave a group conversation. The participant row is kept with
    /// `left_at` set.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for direct and team conversations,
    /// and [`ChatError::NotConversationMember`] if the user is not a current
    /// participant.
    pub async fn leave(&self, conversation_id: ConversationId, user_id: UserId) -> ChatResult<()> {
        self.store
            .run(move |conn| {
                let conversation = load_conversation(conn, conversation_id)?
                    .ok_or(ChatError::ConversationNotFound(conversation_id))?;
                if conversation.kind != ConversationKind::Group {
                    return Err(ChatError::Validation(format!(
                        "Cannot leave a {} conversation",
                        conversation.kind.as_str()
                    )));
                }

                let updated = conn.execute(
                    "UPDATE conversation_participants SET left_at = ?3
                     WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                    params![conversation_id, user_id, clock::now_micros()],
                )?;
                if updated == 0 {
                    return Err(ChatError::NotConversationMember);
                }
                Ok(())
            })
            .await?;

        info!(conversation_id, user_id, "Left conversation");
        Ok(())
    }

    /// Whether the user is a current participant.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn is_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<bool> {
        self.store
            .run(move |conn| is_member(conn, conversation_id, user_id))
            .await
    }

    /// Messages from others the user has not read yet.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotConversationMember`] if the user is not a
    /// current participant.
    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<u64> {
        self.store
            .run(move |conn| {
                if !is_member(conn, conversation_id, user_id)? {
                    return Err(ChatError::NotConversationMember);
                }
                count_unread(conn, conversation_id, user_id)
            })
            .await
    }
}

fn add_participants(
    conn: &Connection,
    conversation_id: ConversationId,
    user_ids: &[UserId],
    joined_at: i64,
) -> ChatResult<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(conversation_id, user_id) DO NOTHING",
    )?;
    for user_id in user_ids {
        stmt.execute(params![conversation_id, user_id, joined_at])?;
    }
    Ok(())
}

fn ensure_team_conversation(conn: &Connection, team_id: TeamId) -> ChatResult<Conversation> {
    let now = clock::now_micros();
    let inserted = conn.execute(
        "INSERT INTO conversations (kind, team_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(team_id) DO NOTHING",
        params![ConversationKind::Team, team_id, now],
    )?;
    if inserted == 1 {
        info!(team_id, conversation_id = conn.last_insert_rowid(), "Created team conversation");
    }

    Ok(conn.query_row(
        &format!(
            "SELECT {} FROM conversations c WHERE c.team_id = ?1",
            Conversation::COLUMNS
        ),
        params![team_id],
        Conversation::from_row,
    )?)
}

fn last_message(conn: &Connection, conversation_id: ConversationId) -> ChatResult<Option<Message>> {
    Ok(conn
        .query_row(
            &format!(
                "{} WHERE m.conversation_id = ?1 ORDER BY m.created_at DESC, m.id DESC LIMIT 1",
                Message::SELECT
            ),
            params![conversation_id],
            Message::from_row,
        )
        .optional()?)
}

fn count_unread(conn: &Connection, conversation_id: ConversationId, user_id: UserId) -> ChatResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages m
         JOIN conversation_participants p
           ON p.conversation_id = m.conversation_id AND p.user_id = ?2
         WHERE m.conversation_id = ?1
           AND m.sender_id != ?2
           AND m.created_at > COALESCE(p.last_read_at, p.joined_at)",
        params![conversation_id, user_id],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

pub(crate) fn load_conversation(
    conn: &Connection,
    conversation_id: ConversationId,
) -> ChatResult<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM conversations c WHERE c.id = ?1",
                Conversation::COLUMNS
            ),
            params![conversation_id],
            Conversation::from_row,
        )
        .optional()?)
}

pub(crate) fn is_member(
    conn: &Connection,
    conversation_id: ConversationId,
    user_id: UserId,
) -> ChatResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM conversation_participants
                       WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL)",
        params![conversation_id, user_id],
        |row| row.get(0),
    )?)
}

pub(crate) fn current_participant_ids(
    conn: &Connection,
    conversation_id: ConversationId,
) -> ChatResult<Vec<UserId>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = ?1 AND left_at IS NULL
         ORDER BY user_id",
    )?;
    let ids = stmt
        .query_map(params![conversation_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
