//! Connection registry and broadcaster.
//!
//! The registry map is owned by [`Hub::run`], a single loop that handles one
//! command at a time. Everything else talks to it through a cloneable
//! [`HubHandle`]. A client whose outbound queue is full when an event arrives
//! is evicted rather than waited on.

use crate::message::SentMessage;
use crate::model::{ConversationId, MessageTarget, TeamId, UserId};
use crate::snapshot::ConnectionSnapshot;
use huddle_protocol::{encode_outbound, OutboundFrame, ProtocolError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Unique id of one live connection.
pub type ClientId = u64;

/// Errors returned by [`HubHandle`].
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub loop has stopped.
    #[error("Hub is not running")]
    Closed,
}

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each command channel into the hub.
    pub command_buffer: usize,
    /// Capacity of each client's outbound queue.
    pub outbound_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_buffer: 1024,
            outbound_queue: 256,
        }
    }
}

/// How an event selects its recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Current participants of a conversation, resolved when the message
    /// was stored.
    Conversation {
        conversation_id: ConversationId,
        audience: HashSet<UserId>,
    },
    /// Everyone whose snapshot lists the team.
    Team(TeamId),
    /// Only the sender and the recipient.
    Direct { recipient_id: UserId },
}

/// An encoded message on its way to live connections.
#[derive(Debug, Clone)]
pub struct HubEvent {
    pub sender_id: UserId,
    pub route: Route,
    /// JSON text, encoded once and shared by every recipient.
    pub payload: Arc<str>,
}

impl HubEvent {
    /// Build the event for a stored message.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbound frame cannot be encoded.
    pub fn from_sent(sent: &SentMessage) -> Result<Self, ProtocolError> {
        let payload = encode_outbound(&OutboundFrame::from(&sent.message))?;
        let route = match sent.message.target {
            MessageTarget::Conversation(conversation_id) => Route::Conversation {
                conversation_id,
                audience: sent.audience.iter().copied().collect(),
            },
            MessageTarget::LegacyTeam(team_id) => Route::Team(team_id),
            MessageTarget::LegacyDirect(recipient_id) => Route::Direct { recipient_id },
        };

        Ok(Self {
            sender_id: sent.message.sender_id(),
            route,
            payload: Arc::from(payload),
        })
    }

    /// Whether a connection with this snapshot should receive the event.
    #[must_use]
    pub fn is_deliverable_to(&self, snapshot: &ConnectionSnapshot) -> bool {
        if snapshot.has_blocked(self.sender_id) {
            return false;
        }
        match &self.route {
            Route::Team(team_id) => snapshot.is_team_member(*team_id),
            Route::Direct { recipient_id } => {
                snapshot.user_id == self.sender_id || snapshot.user_id == *recipient_id
            }
            Route::Conversation { audience, .. } => audience.contains(&snapshot.user_id),
        }
    }
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub clients: usize,
    /// Distinct users with at least one live connection.
    pub users: usize,
    /// Payloads queued to clients since start.
    pub delivered: u64,
    /// Clients dropped because their queue was full.
    pub evictions: u64,
}

struct Registration {
    id: ClientId,
    snapshot: Arc<ConnectionSnapshot>,
    sender: mpsc::Sender<Arc<str>>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("user_id", &self.snapshot.user_id)
            .finish()
    }
}

/// The registry loop. Create with [`Hub::new`] and drive with [`Hub::run`].
pub struct Hub {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ClientId>,
    broadcast_rx: mpsc::Receiver<HubEvent>,
    stats_rx: mpsc::Receiver<oneshot::Sender<HubStats>>,
    clients: HashMap<ClientId, Registration>,
    delivered: u64,
    evictions: u64,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    #[must_use]
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let buffer = config.command_buffer.max(1);
        let (register_tx, register_rx) = mpsc::channel(buffer);
        let (unregister_tx, unregister_rx) = mpsc::channel(buffer);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(buffer);
        let (stats_tx, stats_rx) = mpsc::channel(buffer);

        let hub = Self {
            register_rx,
            unregister_rx,
            broadcast_rx,
            stats_rx,
            clients: HashMap::new(),
            delivered: 0,
            evictions: 0,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            stats_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            outbound_queue: config.outbound_queue.max(1),
        };
        (hub, handle)
    }

    /// Create a hub and run it on a new task.
    #[must_use]
    pub fn spawn(config: HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until every handle has been dropped.
    pub async fn run(mut self) {
        info!("Hub started");
        loop {
            tokio::select! {
                biased;
                Some(registration) = self.register_rx.recv() => self.register(registration),
                Some(id) = self.unregister_rx.recv() => self.unregister(id),
                Some(event) = self.broadcast_rx.recv() => self.broadcast(&event),
                Some(reply) = self.stats_rx.recv() => {
                    let _ = reply.send(self.stats());
                }
                else => break,
            }
        }
        info!(clients = self.clients.len(), "Hub stopped");
    }

    fn register(&mut self, registration: Registration) {
        debug!(
            client_id = registration.id,
            user_id = registration.snapshot.user_id,
            "Client registered"
        );
        self.clients.insert(registration.id, registration);
    }

    fn unregister(&mut self, id: ClientId) {
        if let Some(registration) = self.clients.remove(&id) {
            debug!(
                client_id = id,
                user_id = registration.snapshot.user_id,
                "Client unregistered"
            );
        }
    }

    fn broadcast(&mut self, event: &HubEvent) {
        let mut dropped = Vec::new();

        for registration in self.clients.values() {
            if !event.is_deliverable_to(&registration.snapshot) {
                continue;
            }
            match registration.sender.try_send(Arc::clone(&event.payload)) {
                Ok(()) => self.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        client_id = registration.id,
                        user_id = registration.snapshot.user_id,
                        "Outbound queue full, evicting client"
                    );
                    self.evictions += 1;
                    dropped.push(registration.id);
                }
                Err(TrySendError::Closed(_)) => dropped.push(registration.id),
            }
        }

        for id in dropped {
            self.clients.remove(&id);
        }
    }

    fn stats(&self) -> HubStats {
        let users: HashSet<UserId> = self
            .clients
            .values()
            .map(|r| r.snapshot.user_id)
            .collect();
        HubStats {
            clients: self.clients.len(),
            users: users.len(),
            delivered: self.delivered,
            evictions: self.evictions,
        }
    }
}

/// Cloneable entry point into a running [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientId>,
    broadcast_tx: mpsc::Sender<HubEvent>,
    stats_tx: mpsc::Sender<oneshot::Sender<HubStats>>,
    next_id: Arc<AtomicU64>,
    outbound_queue: usize,
}

impl HubHandle {
    /// Register a connection; returns its id and the receiving end of its
    /// outbound queue. The queue closes when the hub drops the client.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn register(
        &self,
        snapshot: Arc<ConnectionSnapshot>,
    ) -> Result<(ClientId, mpsc::Receiver<Arc<str>>), HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.outbound_queue);
        self.register_tx
            .send(Registration {
                id,
                snapshot,
                sender,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        Ok((id, receiver))
    }

    /// Remove a connection. Unknown or already removed ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.unregister_tx
            .send(id)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Queue an event for fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn broadcast(&self, event: HubEvent) -> Result<(), HubError> {
        self.broadcast_tx
            .send(event)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Current hub counters.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, response) = oneshot::channel();
        self.stats_tx
            .send(reply)
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }
}
