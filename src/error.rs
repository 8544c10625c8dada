//! Error types shared by the operation model, the replicas and the sync protocol.

use thiserror::Error;

use crate::ot::types::{DocumentId, Path};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the synchronization engine can report.
///
/// Variants fall into four families, see [`Error::is_protocol_error`],
/// [`Error::is_rejection`] and [`Error::is_staleness`]. Transport failures are
/// the fourth and are always recovered by reconnecting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A path did not resolve in the current document shape.
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: Path, reason: &'static str },

    /// The edit kind does not fit the addressed node.
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: Path,
        expected: &'static str,
        found: &'static str,
    },

    /// A replica was asked to skip or repeat a version.
    #[error("version gap: replica at {current}, got {received}")]
    VersionGap { current: u64, received: u64 },

    /// A client referenced a version the server has not reached.
    #[error("base version {base} is ahead of the document version {current}")]
    VersionAhead { base: u64, current: u64 },

    #[error("unknown document '{0}'")]
    UnknownDocument(DocumentId),

    #[error("document '{0}' already exists")]
    DocumentExists(DocumentId),

    /// The base version fell out of the server's retention window.
    #[error("resync required, document is at version {current_version}")]
    ResyncRequired { current_version: u64 },

    /// Pending edits did not apply on top of a fresh snapshot and were dropped.
    #[error("{count} pending edit(s) no longer apply and were dropped")]
    StaleEditsDropped { count: usize },

    /// A message arrived that does not fit the current protocol state.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    pub(crate) fn invalid_path(path: &[crate::ot::types::PathSegment], reason: &'static str) -> Self {
        Error::InvalidPath {
            path: Path::from(path),
            reason,
        }
    }

    /// Errors that are fatal to the offending connection.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::VersionGap { .. }
                | Error::VersionAhead { .. }
                | Error::UnknownDocument(_)
                | Error::Malformed(_)
                | Error::Serialization(_)
        )
    }

    /// Errors caused by an operation that does not fit the document; these are
    /// reported to the originating client only.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::InvalidPath { .. } | Error::TypeMismatch { .. })
    }

    /// Errors recovered by the client's full-resync path.
    pub fn is_staleness(&self) -> bool {
        matches!(
            self,
            Error::ResyncRequired { .. } | Error::StaleEditsDropped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let gap = Error::VersionGap {
            current: 3,
            received: 5,
        };
        assert!(gap.is_protocol_error());
        assert!(!gap.is_rejection());

        let path = Error::invalid_path(&[], "empty");
        assert!(path.is_rejection());
        assert!(!path.is_protocol_error());

        let stale = Error::ResyncRequired { current_version: 9 };
        assert!(stale.is_staleness());
        assert_eq!(
            stale.to_string(),
            "resync required, document is at version 9"
        );
    }
}
