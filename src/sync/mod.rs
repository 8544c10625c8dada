//! Synchronization between clients and the server.
//!
//! This module contains the wire protocol, the server authority that orders
//! every edit of a document, the presence arena, and the client state machine
//! with its WebSocket driver.

pub mod authority;
pub mod client;
pub mod connection;
pub mod presence;
pub mod protocol;

// Re-export the main public API
pub use authority::{DocumentSession, JoinOutcome, Outbound, ServerAuthority, ServerStats, Submission};
pub use client::{ClientEvent, ClientSync, ConnectionState};
pub use connection::{ClientConfig, ClientHandle};
pub use presence::{ClientRecord, PresenceManager};
pub use protocol::{ClientMessage, PresenceMap, ServerMessage};
