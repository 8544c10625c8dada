//! Operational transformation over JSON documents.
//!
//! This module contains the edit primitives, the transform engine and the
//! versioned document replica shared by clients and the server.

pub mod component;
pub mod operation;
pub mod replica;
pub mod transform;
pub mod types;

// Re-export the main public API
pub use component::{Component, EditKind, value_at};
pub use operation::{Operation, apply, compose, invert};
pub use replica::DocumentReplica;
pub use transform::{transform, transform_against};
pub use types::{ClientId, DocumentId, Path, PathSegment, Selection, Side};
