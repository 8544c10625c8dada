//! Identifiers for participants and documents.
//!
//! This module contains the definition of ClientId, which uniquely identifies
//! each participant in a document session, and DocumentId, which names the
//! document a session edits.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A unique identifier for each participant (client) of a document session.
///
/// Client identifiers are totally ordered; the order is what makes the
/// transform tie-break deterministic across replicas (see [`crate::Side`]).
/// A client keeps its identifier across reconnects so the server can recognise
/// operations it has already accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Creates a new random identifier.
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }

    /// Gets the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// A stable display color in `#rrggbb` form, derived from the identifier.
    pub fn color(&self) -> String {
        let hash = self.0.as_u128();
        let r = (hash & 0xFF) as u8;
        let g = ((hash >> 8) & 0xFF) as u8;
        let b = ((hash >> 16) & 0xFF) as u8;
        format!("#{r:02x}{g:02x}{b:02x}")
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClientId {
    fn from(id: Uuid) -> Self {
        ClientId(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a shared document. One server session exists per document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        DocumentId(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        DocumentId(id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
