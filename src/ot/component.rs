//! Component edits and their application to a document value.
//!
//! This module contains the Component enum, the single-step edits an
//! [`Operation`](crate::Operation) is made of, along with the path resolution
//! used to apply them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ot::types::{Path, PathSegment};

/// The four edit kinds of the operation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
    Move,
}

/// A single edit addressed by a path into the document.
///
/// Each component carries what is needed to invert it: deletes keep a snapshot
/// of what they removed and replaces keep the previous value.
///
/// # Text
///
/// Strings are sequences of characters. `InsertText` and `DeleteText` address a
/// string node followed by a character offset, e.g. `["title", 3]`. Node edits
/// never descend into a string.
///
/// # Moves
///
/// `Move` relocates an array element within its parent array. `from` and `to`
/// share the parent prefix, and the last index of `to` is read in the array
/// after the element has been taken out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Component {
    Insert { path: Path, value: Value },
    Delete { path: Path, value: Value },
    InsertText { path: Path, text: String },
    DeleteText { path: Path, text: String },
    Replace { path: Path, old: Value, new: Value },
    Move { from: Path, to: Path },
}

impl Component {
    pub fn kind(&self) -> EditKind {
        match self {
            Component::Insert { .. } | Component::InsertText { .. } => EditKind::Insert,
            Component::Delete { .. } | Component::DeleteText { .. } => EditKind::Delete,
            Component::Replace { .. } => EditKind::Replace,
            Component::Move { .. } => EditKind::Move,
        }
    }

    /// The path this component is addressed by (`from` for a move).
    pub fn path(&self) -> &Path {
        match self {
            Component::Insert { path, .. }
            | Component::Delete { path, .. }
            | Component::InsertText { path, .. }
            | Component::DeleteText { path, .. }
            | Component::Replace { path, .. } => path,
            Component::Move { from, .. } => from,
        }
    }

    /// True for edits that leave every document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Component::InsertText { text, .. } | Component::DeleteText { text, .. } => {
                text.is_empty()
            }
            Component::Move { from, to } => from == to,
            _ => false,
        }
    }

    /// Re-roots every path of this component `depth` segments down.
    pub(crate) fn strip_prefix(&self, depth: usize) -> Component {
        let cut = |p: &Path| Path::from(&p[depth.min(p.len())..]);
        match self {
            Component::Insert { path, value } => Component::Insert {
                path: cut(path),
                value: value.clone(),
            },
            Component::Delete { path, value } => Component::Delete {
                path: cut(path),
                value: value.clone(),
            },
            Component::InsertText { path, text } => Component::InsertText {
                path: cut(path),
                text: text.clone(),
            },
            Component::DeleteText { path, text } => Component::DeleteText {
                path: cut(path),
                text: text.clone(),
            },
            Component::Replace { path, old, new } => Component::Replace {
                path: cut(path),
                old: old.clone(),
                new: new.clone(),
            },
            Component::Move { from, to } => Component::Move {
                from: cut(from),
                to: cut(to),
            },
        }
    }

    /// Applies this component to `doc` in place.
    ///
    /// Callers that need atomicity apply to a copy; see
    /// [`Operation::apply`](crate::Operation::apply).
    pub(crate) fn apply_to(&self, doc: &mut Value) -> Result<()> {
        match self {
            Component::Insert { path, value } => {
                let (last, parent) = split_path(path)?;
                let container = resolve_mut(doc, parent)?;
                match (container, last) {
                    (Value::Array(items), PathSegment::Index(i)) => {
                        if *i > items.len() {
                            return Err(Error::invalid_path(path, "index past end of array"));
                        }
                        items.insert(*i, value.clone());
                    }
                    (Value::Object(map), PathSegment::Key(k)) => {
                        if map.contains_key(k) {
                            return Err(Error::invalid_path(path, "key already present"));
                        }
                        map.insert(k.clone(), value.clone());
                    }
                    (Value::Array(_), PathSegment::Key(_)) | (Value::Object(_), PathSegment::Index(_)) => {
                        return Err(Error::invalid_path(path, "segment does not fit container"));
                    }
                    (other, _) => return Err(mismatch(path, "array or object", other)),
                }
            }
            Component::Delete { path, .. } => {
                let (last, parent) = split_path(path)?;
                let container = resolve_mut(doc, parent)?;
                match (container, last) {
                    (Value::Array(items), PathSegment::Index(i)) => {
                        if *i >= items.len() {
                            return Err(Error::invalid_path(path, "index out of range"));
                        }
                        items.remove(*i);
                    }
                    (Value::Object(map), PathSegment::Key(k)) => {
                        if map.remove(k).is_none() {
                            return Err(Error::invalid_path(path, "missing key"));
                        }
                    }
                    (Value::Array(_), PathSegment::Key(_)) | (Value::Object(_), PathSegment::Index(_)) => {
                        return Err(Error::invalid_path(path, "segment does not fit container"));
                    }
                    (other, _) => return Err(mismatch(path, "array or object", other)),
                }
            }
            Component::InsertText { path, text } => {
                let (offset, string) = text_target(doc, path)?;
                let chars = string.chars().count();
                if offset > chars {
                    return Err(Error::invalid_path(path, "offset past end of text"));
                }
                let at = byte_offset(string, offset);
                string.insert_str(at, text);
            }
            Component::DeleteText { path, text } => {
                let (offset, string) = text_target(doc, path)?;
                let Some(end) = offset
                    .checked_add(text.chars().count())
                    .filter(|&end| end <= string.chars().count())
                else {
                    return Err(Error::invalid_path(path, "range past end of text"));
                };
                let start = byte_offset(string, offset);
                let end = byte_offset(string, end);
                string.replace_range(start..end, "");
            }
            Component::Replace { path, new, .. } => {
                let node = resolve_mut(doc, path)?;
                *node = new.clone();
            }
            Component::Move { from, to } => {
                let (from_last, parent) = split_path(from)?;
                if to.len() != from.len() || to.parent() != parent {
                    return Err(Error::invalid_path(to, "move must stay within its parent"));
                }
                let items = match resolve_mut(doc, parent)? {
                    Value::Array(items) => items,
                    other => return Err(mismatch(from, "array", other)),
                };
                let (Some(f), Some(t)) = (from_last.as_index(), to.last_index()) else {
                    return Err(Error::invalid_path(from, "move needs array indices"));
                };
                if f >= items.len() || t >= items.len() {
                    return Err(Error::invalid_path(to, "index out of range"));
                }
                let item = items.remove(f);
                items.insert(t, item);
            }
        }
        Ok(())
    }
}

/// Reads the node at `path`, when it resolves.
pub fn value_at<'a>(doc: &'a Value, path: &[PathSegment]) -> Result<&'a Value> {
    let mut node = doc;
    for (depth, segment) in path.iter().enumerate() {
        node = match (node, segment) {
            (Value::Object(map), PathSegment::Key(k)) => map
                .get(k)
                .ok_or_else(|| Error::invalid_path(&path[..=depth], "missing key"))?,
            (Value::Array(items), PathSegment::Index(i)) => items
                .get(*i)
                .ok_or_else(|| Error::invalid_path(&path[..=depth], "index out of range"))?,
            (Value::Array(_), PathSegment::Key(_)) | (Value::Object(_), PathSegment::Index(_)) => {
                return Err(Error::invalid_path(&path[..=depth], "segment does not fit container"));
            }
            (other, _) => return Err(mismatch(&path[..depth], "array or object", other)),
        };
    }
    Ok(node)
}

pub(crate) fn resolve_mut<'a>(doc: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    let mut node = doc;
    for (depth, segment) in path.iter().enumerate() {
        node = match (node, segment) {
            (Value::Object(map), PathSegment::Key(k)) => map
                .get_mut(k)
                .ok_or_else(|| Error::invalid_path(&path[..=depth], "missing key"))?,
            (Value::Array(items), PathSegment::Index(i)) => items
                .get_mut(*i)
                .ok_or_else(|| Error::invalid_path(&path[..=depth], "index out of range"))?,
            (Value::Array(_), PathSegment::Key(_)) | (Value::Object(_), PathSegment::Index(_)) => {
                return Err(Error::invalid_path(&path[..=depth], "segment does not fit container"));
            }
            (other, _) => return Err(mismatch(&path[..depth], "array or object", other)),
        };
    }
    Ok(node)
}

/// Reads the characters a text deletion at `path` would remove.
pub(crate) fn text_at(doc: &Value, path: &[PathSegment], len: usize) -> Result<String> {
    let (last, parent) = split_path(path)?;
    let Some(offset) = last.as_index() else {
        return Err(Error::invalid_path(path, "text offset must be an index"));
    };
    match value_at(doc, parent)? {
        Value::String(s) => {
            if offset.checked_add(len).is_none_or(|end| end > s.chars().count()) {
                return Err(Error::invalid_path(path, "range past end of text"));
            }
            Ok(s.chars().skip(offset).take(len).collect())
        }
        other => Err(mismatch(parent, "string", other)),
    }
}

fn text_target<'a>(doc: &'a mut Value, path: &'a Path) -> Result<(usize, &'a mut String)> {
    let (last, parent) = split_path(path)?;
    let Some(offset) = last.as_index() else {
        return Err(Error::invalid_path(path, "text offset must be an index"));
    };
    match resolve_mut(doc, parent)? {
        Value::String(s) => Ok((offset, s)),
        other => Err(mismatch(parent, "string", other)),
    }
}

fn split_path(path: &[PathSegment]) -> Result<(&PathSegment, &[PathSegment])> {
    path.split_last()
        .ok_or_else(|| Error::invalid_path(path, "edit needs a non-empty path"))
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

fn mismatch(path: &[PathSegment], expected: &'static str, found: &Value) -> Error {
    Error::TypeMismatch {
        path: Path::from(path),
        expected,
        found: type_name(found),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    fn apply(doc: &Value, c: Component) -> Result<Value> {
        let mut out = doc.clone();
        c.apply_to(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_insert_into_array_and_object() {
        let doc = json!({"items": [1, 3]});
        let doc = apply(&doc, Component::Insert { path: path!["items", 1], value: json!(2) }).unwrap();
        assert_eq!(doc, json!({"items": [1, 2, 3]}));

        let doc = apply(&doc, Component::Insert { path: path!["title"], value: json!("t") }).unwrap();
        assert_eq!(doc["title"], json!("t"));
    }

    #[test]
    fn test_insert_into_scalar_is_type_mismatch() {
        let doc = json!({"n": 5});
        let err = apply(&doc, Component::Insert { path: path!["n", 0], value: json!(1) }).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_missing_path_is_invalid() {
        let doc = json!({"items": []});
        let err = apply(&doc, Component::Delete { path: path!["items", 0], value: json!(null) }).unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));

        let err = apply(&doc, Component::Replace { path: path!["nope"], old: json!(null), new: json!(1) }).unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[test]
    fn test_text_edits_use_char_offsets() {
        let doc = json!({"t": "h€llo"});
        let doc = apply(&doc, Component::InsertText { path: path!["t", 2], text: "✓".into() }).unwrap();
        assert_eq!(doc["t"], json!("h€✓llo"));

        let doc = apply(&doc, Component::DeleteText { path: path!["t", 1], text: "€✓".into() }).unwrap();
        assert_eq!(doc["t"], json!("hllo"));
    }

    #[test]
    fn test_text_edit_on_array_is_type_mismatch() {
        let doc = json!({"t": [1]});
        let err = apply(&doc, Component::InsertText { path: path!["t", 0], text: "x".into() }).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_move_within_array() {
        let doc = json!(["a", "b", "c"]);
        let doc = apply(&doc, Component::Move { from: path![0], to: path![2] }).unwrap();
        assert_eq!(doc, json!(["b", "c", "a"]));

        let err = apply(&doc, Component::Move { from: path![0], to: path![3] }).unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[test]
    fn test_replace_root() {
        let doc = json!({"a": 1});
        let doc = apply(&doc, Component::Replace { path: Path::root(), old: json!({"a": 1}), new: json!([]) }).unwrap();
        assert_eq!(doc, json!([]));
    }

    #[test]
    fn test_wire_tagging() {
        let c = Component::InsertText { path: path!["t", 0], text: "X".into() };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json, json!({"kind": "insert_text", "path": ["t", 0], "text": "X"}));
        assert_eq!(c.kind(), EditKind::Insert);
    }
}
