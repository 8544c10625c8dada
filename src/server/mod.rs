//! Web server module for the collaboration service.
//!
//! This module contains the Axum web server: HTTP endpoints to seed and read
//! documents, and the WebSocket endpoint clients synchronize over.

pub mod config;
pub mod routes;
pub mod websocket;

// Re-export main server functionality
pub use config::ServerConfig;
pub use routes::{AppState, create_router};
