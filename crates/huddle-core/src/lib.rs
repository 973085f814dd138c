//! # huddle-core
//!
//! Conversations, message persistence and live fan-out for Huddle.
//!
//! - **ConversationService** - direct, group and team conversations and
//!   their participants
//! - **MessageService** - message persistence and cursor pagination
//! - **Hub** - registry of live connections and event broadcaster
//! - **Directory** - identity, team rosters and block lists owned elsewhere
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────┐     ┌─────────────┐
//! │   Client    │────▶│ MessageService │────▶│    Store    │
//! └─────────────┘     └────────────────┘     └─────────────┘
//!        │                    │                     ▲
//!        │ register           │ SentMessage         │
//!        ▼                    ▼                     │
//! ┌─────────────┐     ┌────────────────┐     ┌─────────────────────┐
//! │     Hub     │◀────│   HubEvent     │     │ ConversationService │
//! └─────────────┘     └────────────────┘     └─────────────────────┘
//! ```

pub mod clock;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod hub;
pub mod message;
pub mod migrations;
pub mod model;
pub mod notify;
pub mod snapshot;
pub mod store;

pub use conversation::ConversationService;
pub use directory::{Directory, SqlDirectory};
pub use error::{ChatError, ChatResult, ErrorKind};
pub use hub::{ClientId, Hub, HubConfig, HubError, HubEvent, HubHandle, HubStats, Route};
pub use message::{MessageService, SentMessage, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use model::{
    Conversation, ConversationDetails, ConversationId, ConversationKind, ConversationSummary,
    Message, MessageId, MessagePage, MessageTarget, Participant, SyncOutcome, TeamId, UserId,
    UserSummary,
};
pub use notify::{Notifier, TracingNotifier};
pub use snapshot::ConnectionSnapshot;
pub use store::Store;
