//! Shared fixtures for the Huddle benchmarks.

use std::sync::Arc;
use std::time::Duration;
use tenvis_huddle_core::{
    ConnectionSnapshot, ConversationId, ConversationService, HubHandle, MessageService,
    SqlDirectory, Store, UserId,
};
use tokio::sync::mpsc;

/// Services over an in-memory store with one direct conversation between
/// users 1 and 2.
pub struct Fixture {
    pub conversations: ConversationService,
    pub messages: MessageService,
    pub conversation_id: ConversationId,
}

/// Build a [`Fixture`].
///
/// # Panics
///
/// Panics if the in-memory store cannot be set up.
pub async fn fixture() -> Fixture {
    let store = Store::memory().expect("in-memory store");
    let directory = SqlDirectory::new(store.clone());
    directory.upsert_user(1, "alice", None).await.expect("seed user");
    directory.upsert_user(2, "bob", None).await.expect("seed user");

    let conversations = ConversationService::new(store.clone());
    let conversation_id = conversations
        .create_direct(1, 2)
        .await
        .expect("direct conversation")
        .id;

    Fixture {
        messages: MessageService::new(store, Arc::new(directory)),
        conversations,
        conversation_id,
    }
}

/// Register `count` connections, users `1..=count`, each drained by its own
/// task so queues never fill.
///
/// # Panics
///
/// Panics if the hub is not running.
pub async fn connect_drained(hub: &HubHandle, count: usize, team_id: i64) {
    for user_id in 1..=count as UserId {
        let snapshot = ConnectionSnapshot::new(
            user_id,
            [team_id].into_iter().collect(),
            Default::default(),
            Duration::from_secs(3600),
        );
        let (_, receiver) = hub.register(Arc::new(snapshot)).await.expect("hub running");
        tokio::spawn(drain(receiver));
    }
}

async fn drain(mut receiver: mpsc::Receiver<Arc<str>>) {
    while receiver.recv().await.is_some() {}
}
