//! # collab-ot - collaborative document synchronization
//!
//! Operational transformation over JSON documents, with a server authority
//! that orders every edit and a client state machine that keeps an optimistic
//! local replica in step with it.
//!
//! ## Features
//!
//! - **Convergent**: concurrent edits are transformed so every replica ends up
//!   with the same value
//! - **Tree-shaped documents**: node edits on objects and arrays, character
//!   edits on strings, moves within an array
//! - **Invertible**: every operation can be undone exactly
//! - **Resilient clients**: pending edits survive disconnects and are replayed
//!   on reconnect
//! - **Presence**: live selections of every participant
//!
//! ## Example
//!
//! ```rust
//! use collab_ot::{Operation, Side, path, transform};
//! use serde_json::json;
//!
//! let doc = json!({"title": "ac"});
//! let a = Operation::insert_text(path!["title", 1], "b");
//! let b = Operation::insert_text(path!["title", 0], ">");
//!
//! let (a2, b2) = transform(&a, &b, Side::Left);
//! let left = b2.apply(&a.apply(&doc).unwrap()).unwrap();
//! let right = a2.apply(&b.apply(&doc).unwrap()).unwrap();
//! assert_eq!(left, right);
//! assert_eq!(left, json!({"title": ">abc"}));
//! ```

pub mod error;
pub mod ot;
pub mod server;
pub mod sync;

// Re-export the main public API
pub use error::{Error, Result};
pub use ot::{
    ClientId, Component, DocumentId, DocumentReplica, EditKind, Operation, Path, PathSegment,
    Selection, Side, apply, compose, invert, transform, transform_against, value_at,
};
pub use sync::{
    ClientEvent, ClientMessage, ClientRecord, ClientSync, ConnectionState, ServerAuthority,
    ServerMessage,
};
