//! Versioned local copy of a document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ot::operation::{Operation, apply};

/// A document value together with the server version it reflects.
///
/// The version only moves forward one step at a time through
/// [`apply_accepted`](Self::apply_accepted) or [`advance`](Self::advance), or
/// jumps when the whole replica is replaced by a snapshot with
/// [`reset`](Self::reset). Local optimistic edits change the value but never
/// the version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentReplica {
    value: Value,
    version: u64,
}

impl DocumentReplica {
    /// An empty object document at version 0.
    pub fn new() -> Self {
        Self::with_value(Value::Object(Default::default()), 0)
    }

    pub fn with_value(value: Value, version: u64) -> Self {
        DocumentReplica { value, version }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Applies an operation the server accepted as `new_version`.
    ///
    /// Value and version change together or not at all.
    ///
    /// # Errors
    ///
    /// * `VersionGap` - `new_version` is not exactly `version + 1`
    /// * `InvalidPath` / `TypeMismatch` - the operation does not fit the value
    pub fn apply_accepted(&mut self, operation: &Operation, new_version: u64) -> Result<()> {
        self.check_next(new_version)?;
        self.value = apply(&self.value, operation)?;
        self.version = new_version;
        Ok(())
    }

    /// Applies an optimistic local edit. The version is unchanged.
    pub fn apply_local(&mut self, operation: &Operation) -> Result<()> {
        self.value = apply(&self.value, operation)?;
        Ok(())
    }

    /// Moves to `new_version` without touching the value, for an
    /// acknowledgment of an edit that is already applied locally.
    pub fn advance(&mut self, new_version: u64) -> Result<()> {
        self.check_next(new_version)?;
        self.version = new_version;
        Ok(())
    }

    /// Replaces the replica with a server snapshot.
    pub fn reset(&mut self, value: Value, version: u64) {
        self.value = value;
        self.version = version;
    }

    /// A copy of the current value and version.
    pub fn snapshot(&self) -> (Value, u64) {
        (self.value.clone(), self.version)
    }

    fn check_next(&self, new_version: u64) -> Result<()> {
        if new_version != self.version + 1 {
            return Err(Error::VersionGap {
                current: self.version,
                received: new_version,
            });
        }
        Ok(())
    }
}

impl Default for DocumentReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    #[test]
    fn test_apply_accepted_in_order() {
        let mut replica = DocumentReplica::with_value(json!({"t": ""}), 0);
        replica
            .apply_accepted(&Operation::insert_text(path!["t", 0], "a"), 1)
            .unwrap();
        replica
            .apply_accepted(&Operation::insert_text(path!["t", 1], "b"), 2)
            .unwrap();

        assert_eq!(replica.value(), &json!({"t": "ab"}));
        assert_eq!(replica.version(), 2);
    }

    #[test]
    fn test_version_gap_leaves_replica_untouched() {
        let mut replica = DocumentReplica::with_value(json!({"t": "x"}), 4);
        let op = Operation::insert_text(path!["t", 0], "a");

        for bad in [4, 6, 0] {
            let err = replica.apply_accepted(&op, bad).unwrap_err();
            assert!(matches!(err, Error::VersionGap { current: 4, received } if received == bad));
        }
        assert_eq!(replica.snapshot(), (json!({"t": "x"}), 4));
    }

    #[test]
    fn test_failed_apply_keeps_version() {
        let mut replica = DocumentReplica::with_value(json!({"list": []}), 1);
        let op = Operation::delete(path!["list", 0], json!(1));

        assert!(replica.apply_accepted(&op, 2).is_err());
        assert_eq!(replica.version(), 1);
    }

    #[test]
    fn test_local_apply_then_advance() {
        let mut replica = DocumentReplica::new();
        replica
            .apply_local(&Operation::insert(path!["k"], json!(1)))
            .unwrap();
        assert_eq!(replica.version(), 0);

        replica.advance(1).unwrap();
        assert_eq!(replica.snapshot(), (json!({"k": 1}), 1));
        assert!(replica.advance(3).is_err());
    }

    #[test]
    fn test_reset() {
        let mut replica = DocumentReplica::new();
        replica.reset(json!([1, 2]), 17);
        assert_eq!(replica.version(), 17);
        assert_eq!(replica.value(), &json!([1, 2]));
    }
}
