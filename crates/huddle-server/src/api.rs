//! REST API for conversations and messages.
//!
//! Every `/api` route needs an authenticated caller. The `/internal` route
//! is for the roster owner and is guarded by a shared secret instead.

use crate::auth::{AuthUser, InternalCaller};
use crate::handlers::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use huddle_protocol::OutboundFrame;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tenvis_huddle_core::{
    clock, ChatError, Conversation, ConversationDetails, ConversationId, ConversationSummary,
    ErrorKind, MessageId, MessagePage, SyncOutcome, TeamId, UserId, DEFAULT_PAGE_SIZE,
};
use thiserror::Error;
use tracing::{error, info};

/// Errors surfaced to REST callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No valid credentials were presented.
    #[error("Authentication required")]
    Unauthenticated,

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Chat(e) => match e.kind() {
                ErrorKind::Authorization => StatusCode::FORBIDDEN,
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::TransientStore => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Stable machine-readable class of this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "authorization",
            ApiError::Chat(e) => match e.kind() {
                ErrorKind::Authorization => "authorization",
                ErrorKind::Validation => "validation",
                ErrorKind::NotFound => "not_found",
                ErrorKind::TransientStore => "transient_store",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
            crate::metrics::record_error("store");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Routes under `/api` and `/internal`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/direct", post(create_direct))
        .route("/api/conversations/group", post(create_group))
        .route("/api/conversations/:id", get(get_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(get_messages).post(send_message),
        )
        .route("/api/conversations/:id/read", post(mark_read))
        .route("/api/conversations/:id/leave", post(leave))
        .route("/api/teams/:id/conversation", get(team_conversation))
        .route("/internal/teams/:id/members", put(sync_team_members))
}

#[derive(Debug, Deserialize)]
struct CreateDirectRequest {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    participant_ids: Vec<UserId>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
    before: Option<MessageId>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SyncMembersRequest {
    member_ids: Vec<UserId>,
}

async fn create_direct(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(request): Json<CreateDirectRequest>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .conversations
        .create_direct(user.id, request.user_id)
        .await?;
    Ok(Json(conversation))
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(request): Json<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state
        .conversations
        .create_group(user.id, request.participant_ids, request.title)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.conversations.list_conversations(user.id).await?))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<ConversationId>,
) -> ApiResult<Json<ConversationDetails>> {
    Ok(Json(state.conversations.get_conversation(id, user.id).await?))
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<ConversationId>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<MessagePage>> {
    let page = state
        .messages
        .get_messages(
            id,
            user.id,
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            query.before,
        )
        .await?;
    Ok(Json(page))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<ConversationId>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<OutboundFrame>)> {
    let sent = state
        .messages
        .send_message(id, user.id, &request.content)
        .await?;
    state.publish(&sent).await;
    Ok((StatusCode::CREATED, Json(OutboundFrame::from(&sent.message))))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<ConversationId>,
) -> ApiResult<StatusCode> {
    state
        .conversations
        .mark_read(id, user.id, clock::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<ConversationId>,
) -> ApiResult<StatusCode> {
    state.conversations.leave(id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn team_conversation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(team_id): Path<TeamId>,
) -> ApiResult<Json<ConversationDetails>> {
    if !state.directory.is_team_member(team_id, user.id).await? {
        return Err(ChatError::NotTeamMember(team_id).into());
    }

    let roster = state.directory.team_member_ids(team_id).await?;
    let outcome = state
        .conversations
        .sync_team_members(team_id, roster)
        .await?;
    let details = state
        .conversations
        .get_conversation(outcome.conversation_id, user.id)
        .await?;
    Ok(Json(details))
}

async fn sync_team_members(
    State(state): State<Arc<AppState>>,
    _caller: InternalCaller,
    Path(team_id): Path<TeamId>,
    Json(request): Json<SyncMembersRequest>,
) -> ApiResult<Json<SyncOutcome>> {
    let outcome = state
        .conversations
        .sync_team_members(team_id, request.member_ids)
        .await?;
    info!(
        team_id,
        added = outcome.added.len(),
        removed = outcome.removed.len(),
        "Roster sync received"
    );
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(ChatError::NotConversationMember).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(ChatError::SelfConversation).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ChatError::ConversationNotFound(1)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ChatError::Store("locked".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ApiError::Unauthenticated.kind(), "authorization");
        assert_eq!(ApiError::from(ChatError::Blocked).kind(), "authorization");
        assert_eq!(
            ApiError::from(ChatError::Validation("x".into())).kind(),
            "validation"
        );
        assert_eq!(
            ApiError::from(ChatError::MessageNotFound(3)).kind(),
            "not_found"
        );
    }
}
