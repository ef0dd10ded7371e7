//! HTTP routes on the signaling port
//!
//! One axum router serves the health/stats probes, the optional user and
//! message API, and the WebSocket upgrade for relay connections.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use callrelay_core::{is_valid_email, UserId};

use crate::server::{handle_socket, ServerState};
use crate::storage::{Storage, StorageError, StoredMessage, StoredUser};

/// HTTP errors, rendered as `{"error": "..."}`
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid JSON body: {}", .0.body_text())]
    InvalidBody(#[from] JsonRejection),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("user already exists")]
    UserExists,

    #[error("storage not configured")]
    StorageDisabled,

    #[error("internal error")]
    Storage(#[from] StorageError),
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HttpError::InvalidBody(rejection) => rejection.status(),
            HttpError::NotFound(_) => StatusCode::NOT_FOUND,
            HttpError::UserExists => StatusCode::CONFLICT,
            HttpError::StorageDisabled => StatusCode::SERVICE_UNAVAILABLE,
            HttpError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        if let HttpError::Storage(e) = &self {
            warn!("Storage error: {}", e);
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterUser {
    email: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SaveMessage {
    from: String,
    to: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    from: Option<String>,
    to: Option<String>,
}

type AppState = State<Arc<ServerState>>;

/// Build the router for one server
pub(crate) fn router(state: Arc<ServerState>) -> Router {
    let body_limit = state.max_message_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/api/users/register", post(register_user))
        .route("/api/users/:email", get(get_user))
        .route("/api/messages", post(save_message).get(messages_between))
        .fallback(fallback)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
}

async fn health(State(state): AppState) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "identities": state.registry.len(),
        "connections": state.live_connections(),
    }))
}

async fn stats(State(state): AppState) -> Json<Value> {
    Json(json!({
        "identities": state.registry.len(),
        "connections": state.live_connections(),
    }))
}

async fn register_user(
    State(state): AppState,
    body: Result<Json<RegisterUser>, JsonRejection>,
) -> Result<(StatusCode, Json<StoredUser>), HttpError> {
    let storage = storage(&state)?;
    let Json(body) = body?;

    if !is_valid_email(body.email.trim()) {
        return Err(HttpError::BadRequest("invalid email address".into()));
    }
    if body.name.trim().is_empty() {
        return Err(HttpError::BadRequest("name is required".into()));
    }

    match storage.register_user(&body.email, &body.name) {
        Ok(user) => Ok((StatusCode::CREATED, Json(user))),
        Err(StorageError::UserExists(_)) => Err(HttpError::UserExists),
        Err(e) => Err(e.into()),
    }
}

async fn get_user(
    State(state): AppState,
    Path(email): Path<String>,
) -> Result<Json<StoredUser>, HttpError> {
    storage(&state)?
        .get_user(&email)?
        .map(Json)
        .ok_or(HttpError::NotFound("user not found"))
}

async fn save_message(
    State(state): AppState,
    body: Result<Json<SaveMessage>, JsonRejection>,
) -> Result<(StatusCode, Json<StoredMessage>), HttpError> {
    let storage = storage(&state)?;
    let Json(body) = body?;

    let (Ok(from), Ok(to)) = (UserId::new(&body.from), UserId::new(&body.to)) else {
        return Err(HttpError::BadRequest(
            "from and to must be valid identifiers".into(),
        ));
    };
    let message = storage.insert_message(from.as_str(), to.as_str(), &body.message)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn messages_between(
    State(state): AppState,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<StoredMessage>>, HttpError> {
    let storage = storage(&state)?;
    let (Some(from), Some(to)) = (query.from, query.to) else {
        return Err(HttpError::BadRequest(
            "from and to query parameters are required".into(),
        ));
    };
    Ok(Json(storage.messages_between(from.trim(), to.trim())?))
}

/// WebSocket upgrades on any path; everything else is 404
async fn fallback(
    State(state): AppState,
    upgrade: Option<WebSocketUpgrade>,
    uri: Uri,
) -> Response {
    if let Some(ws) = upgrade {
        let ceiling = state.frame_ceiling();
        return ws
            .max_message_size(ceiling)
            .max_frame_size(ceiling)
            .on_upgrade(move |socket| handle_socket(socket, state))
            .into_response();
    }

    debug!("No route for {}", uri);
    if uri.path().starts_with("/api/") && state.storage.is_none() {
        return HttpError::StorageDisabled.into_response();
    }
    HttpError::NotFound("not found").into_response()
}

fn storage(state: &ServerState) -> Result<&Storage, HttpError> {
    state.storage.as_deref().ok_or(HttpError::StorageDisabled)
}
