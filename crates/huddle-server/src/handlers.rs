//! Server composition and HTTP entry points.
//!
//! Builds the shared state (store, services, hub), mounts the WebSocket,
//! REST and health routes, and serves them.

use crate::api::{self, ApiError};
use crate::auth::{AuthUser, TokenKeys};
use crate::client;
use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use huddle_protocol::FrameCodec;
use serde_json::json;
use std::sync::Arc;
use tenvis_huddle_core::{
    ConnectionSnapshot, ConversationService, Directory, Hub, HubConfig, HubEvent, HubHandle,
    MessageService, MessageTarget, SentMessage, SqlDirectory, Store,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Multiple of `limits.max_message_size` at which the socket itself refuses
/// a frame.
const OVERSIZE_CEILING_FACTOR: usize = 4;

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    pub store: Store,
    pub directory: Arc<dyn Directory>,
    pub conversations: ConversationService,
    pub messages: MessageService,
    pub hub: HubHandle,
    pub tokens: TokenKeys,
    pub codec: FrameCodec,
}

impl AppState {
    /// Create app state over an open store and a running hub.
    #[must_use]
    pub fn new(config: Config, store: Store, hub: HubHandle, tokens: TokenKeys) -> Self {
        let directory: Arc<dyn Directory> = Arc::new(SqlDirectory::new(store.clone()));
        let messages = MessageService::new(store.clone(), Arc::clone(&directory))
            .with_max_content_chars(config.limits.max_content_chars);

        Self {
            tokens,
            codec: FrameCodec::new(config.limits.max_message_size),
            conversations: ConversationService::new(store.clone()),
            messages,
            directory,
            store,
            hub,
            config,
        }
    }

    /// Open the configured store, start a hub and build the state.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if no JWT secret is configured, or if the store
    /// cannot be opened or migrated.
    pub fn from_config(config: Config) -> Result<Arc<Self>> {
        let tokens = token_keys(&config)?;
        let store = open_store(&config)?;
        let hub = Hub::spawn(HubConfig {
            outbound_queue: config.limits.outbound_queue,
            ..HubConfig::default()
        });
        Ok(Arc::new(Self::new(config, store, hub, tokens)))
    }

    /// Hand a stored message to the hub for live delivery.
    ///
    /// Failures are logged; the message is already persisted.
    pub async fn publish(&self, sent: &SentMessage) {
        metrics::record_message(route_label(&sent.message.target));

        let event = match HubEvent::from_sent(sent) {
            Ok(event) => event,
            Err(e) => {
                error!(message_id = sent.message.id, error = %e, "Failed to encode message");
                metrics::record_error("encode");
                return;
            }
        };
        metrics::record_frame(event.payload.len(), "outbound");
        if let Err(e) = self.hub.broadcast(event).await {
            warn!(message_id = sent.message.id, error = %e, "Broadcast failed");
        }
    }
}

fn route_label(target: &MessageTarget) -> &'static str {
    match target {
        MessageTarget::Conversation(_) => "conversation",
        MessageTarget::LegacyTeam(_) => "legacy_team",
        MessageTarget::LegacyDirect(_) => "legacy_direct",
    }
}

fn token_keys(config: &Config) -> Result<TokenKeys> {
    let secret = config
        .auth
        .jwt_secret
        .as_deref()
        .map(str::trim)
        .filter(|secret| !secret.is_empty())
        .context("auth.jwt_secret is not set; configure it or export HUDDLE_JWT_SECRET")?;
    Ok(TokenKeys::new(secret))
}

fn open_store(config: &Config) -> Result<Store> {
    let path = &config.database.path;
    if path == ":memory:" {
        return Store::memory().context("Failed to create in-memory store");
    }
    Store::open(shellexpand::tilde(path).as_ref(), config.database.pool_size)
        .with_context(|| format!("Failed to open database {path}"))
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Serve the router on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let state = AppState::from_config(config.clone())?;

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hub.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "clients": stats.clients,
                "users": stats.users,
                "evictions": stats.evictions,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "version": env!("CARGO_PKG_VERSION"),
                "error": e.to_string(),
            })),
        ),
    }
}

/// WebSocket upgrade handler.
///
/// The caller's snapshot is loaded before upgrading so a directory failure
/// is reported as an HTTP error. Tokens for users the directory does not
/// know are refused.
async fn ws_handler(
    ws: WebSocketUpgrade,
    user: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    if state.directory.user(user.id).await?.is_none() {
        warn!(user_id = user.id, "Token for unknown user");
        return Err(ApiError::Unauthenticated);
    }
    let snapshot = ConnectionSnapshot::load(
        state.directory.as_ref(),
        user.id,
        state.config.session.snapshot_ttl(),
    )
    .await?;

    // Frames between the codec limit and this ceiling are read and then
    // skipped by the codec; anything larger ends the connection.
    let ceiling = state
        .config
        .limits
        .max_message_size
        .saturating_mul(OVERSIZE_CEILING_FACTOR);
    Ok(ws
        .max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_upgrade(move |socket| client::serve(socket, state, Arc::new(snapshot))))
}
