//! Route handlers for the collaboration server.
//!
//! This module contains all the HTTP route handlers and related types for the Axum server.

use axum::{
    Router,
    extract::{Path, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::error::Error;
use crate::ot::DocumentId;
use crate::server::config::ServerConfig;
use crate::server::websocket::handle_websocket_connection;
use crate::sync::{ServerAuthority, ServerStats};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub authority: Arc<ServerAuthority>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let authority = ServerAuthority::new(config.retention)
            .with_create_missing(config.create_missing_documents);
        AppState {
            authority: Arc::new(authority),
            config: Arc::new(config),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub stats: ServerStats,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub value: Value,
    pub version: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps crate errors onto HTTP responses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::UnknownDocument(_) => StatusCode::NOT_FOUND,
            Error::DocumentExists(_) => StatusCode::CONFLICT,
            Error::Malformed(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Basic health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        stats: state.authority.stats(),
    })
}

/// Current value and version of a document.
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentSnapshot>, ApiError> {
    let document_id = DocumentId::from(id);
    let (value, version) = state.authority.snapshot(&document_id)?;
    Ok(Json(DocumentSnapshot {
        document_id,
        value,
        version,
    }))
}

/// Seeds a document with its initial value.
pub async fn put_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(value): Json<Value>,
) -> Result<(StatusCode, Json<DocumentSnapshot>), ApiError> {
    let document_id = DocumentId::from(id);
    state
        .authority
        .create_document(document_id.clone(), value.clone())?;
    info!(document = %document_id, "document seeded over http");
    Ok((
        StatusCode::CREATED,
        Json(DocumentSnapshot {
            document_id,
            value,
            version: 0,
        }),
    ))
}

/// WebSocket connection handler for collaborative editing
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let document_id = DocumentId::from(id);
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.authority, document_id, state.config)
    })
}

/// Creates and configures the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents/:id", get(get_document).put(put_document))
        .route("/ws/:id", get(ws_handler))
        .with_state(state)
}
