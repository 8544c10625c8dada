//! Operations: ordered lists of component edits.
//!
//! This module contains the Operation struct and the three laws of the
//! operation model: `apply`, `invert` and `compose`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::ot::component::{Component, text_at, value_at};
use crate::ot::types::Path;

/// An ordered sequence of component edits.
///
/// Components are applied in order; each one's path is read against the
/// document produced by the components before it. An operation is only
/// meaningful against the document version it was generated from (its base
/// version) until it has been transformed.
///
/// On the wire an operation is a JSON array of components.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Operation {
    components: Vec<Component>,
}

impl Operation {
    /// Creates an operation from components, dropping the ones that are no-ops.
    pub fn new(components: Vec<Component>) -> Self {
        Operation {
            components: components.into_iter().filter(|c| !c.is_noop()).collect(),
        }
    }

    /// The empty operation.
    pub fn noop() -> Self {
        Operation::default()
    }

    pub fn insert(path: Path, value: Value) -> Self {
        Operation::new(vec![Component::Insert { path, value }])
    }

    /// Removes the node at `path`; `value` is the snapshot of what is removed.
    pub fn delete(path: Path, value: Value) -> Self {
        Operation::new(vec![Component::Delete { path, value }])
    }

    pub fn replace(path: Path, old: Value, new: Value) -> Self {
        Operation::new(vec![Component::Replace { path, old, new }])
    }

    pub fn insert_text(path: Path, text: impl Into<String>) -> Self {
        Operation::new(vec![Component::InsertText {
            path,
            text: text.into(),
        }])
    }

    pub fn delete_text(path: Path, text: impl Into<String>) -> Self {
        Operation::new(vec![Component::DeleteText {
            path,
            text: text.into(),
        }])
    }

    /// Moves the array element at `from` to `to` (read after removal).
    pub fn move_item(from: Path, to: Path) -> Self {
        Operation::new(vec![Component::Move { from, to }])
    }

    /// Chains `next` after `self`. Same as [`compose`].
    pub fn then(self, next: Operation) -> Self {
        compose(&self, &next)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Component> {
        self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_noop(&self) -> bool {
        self.components.is_empty()
    }

    /// See [`apply`].
    pub fn apply(&self, document: &Value) -> Result<Value> {
        apply(document, self)
    }

    /// See [`invert`].
    pub fn invert(&self, document_before: &Value) -> Result<Operation> {
        invert(self, document_before)
    }
}

impl From<Vec<Component>> for Operation {
    fn from(components: Vec<Component>) -> Self {
        Operation::new(components)
    }
}

/// Applies `operation` to `document`, returning the new document.
///
/// Works on a copy: on error the caller's document is untouched, so a failed
/// apply never leaves a partially edited value behind.
///
/// # Errors
///
/// * `InvalidPath` - a component's path does not resolve
/// * `TypeMismatch` - a component does not fit the node it addresses
pub fn apply(document: &Value, operation: &Operation) -> Result<Value> {
    let mut out = document.clone();
    for component in &operation.components {
        component.apply_to(&mut out)?;
    }
    Ok(out)
}

/// Builds the operation that undoes `operation`.
///
/// Snapshots come from `document_before` rather than from the operation, so
/// the inverse is exact even when an operation's stored snapshots are stale.
/// `apply(apply(d, op), invert(op, d)) == d`.
pub fn invert(operation: &Operation, document_before: &Value) -> Result<Operation> {
    let mut doc = document_before.clone();
    let mut inverse = Vec::with_capacity(operation.components.len());

    for component in &operation.components {
        let undo = match component {
            Component::Insert { path, value } => Component::Delete {
                path: path.clone(),
                value: value.clone(),
            },
            Component::Delete { path, .. } => Component::Insert {
                path: path.clone(),
                value: value_at(&doc, path)?.clone(),
            },
            Component::InsertText { path, text } => Component::DeleteText {
                path: path.clone(),
                text: text.clone(),
            },
            Component::DeleteText { path, text } => Component::InsertText {
                path: path.clone(),
                text: text_at(&doc, path, text.chars().count())?,
            },
            Component::Replace { path, new, .. } => Component::Replace {
                path: path.clone(),
                old: new.clone(),
                new: value_at(&doc, path)?.clone(),
            },
            Component::Move { from, to } => Component::Move {
                from: to.clone(),
                to: from.clone(),
            },
        };
        component.apply_to(&mut doc)?;
        inverse.push(undo);
    }

    inverse.reverse();
    Ok(Operation::new(inverse))
}

/// Merges two sequential operations into one.
///
/// `apply(d, compose(a, b)) == apply(apply(d, a), b)`. Adjacent text edits
/// are folded together so a burst of typing collapses into one component.
pub fn compose(first: &Operation, second: &Operation) -> Operation {
    let mut out: Vec<Component> = Vec::with_capacity(first.len() + second.len());
    for component in first.components.iter().chain(second.components.iter()) {
        push_merged(&mut out, component.clone());
    }
    Operation { components: out }
}

fn push_merged(out: &mut Vec<Component>, next: Component) {
    if next.is_noop() {
        return;
    }
    if let Some(prev) = out.last_mut() {
        match (prev, &next) {
            (
                Component::InsertText { path: p, text: t },
                Component::InsertText { path: q, text: u },
            ) if p.parent() == q.parent() => {
                if let (Some(start), Some(at)) = (p.last_index(), q.last_index()) {
                    let end = start.saturating_add(t.chars().count());
                    if (start..=end).contains(&at) {
                        let split = t
                            .char_indices()
                            .nth(at - start)
                            .map_or(t.len(), |(i, _)| i);
                        t.insert_str(split, u);
                        return;
                    }
                }
            }
            (
                Component::DeleteText { path: p, text: t },
                Component::DeleteText { path: q, text: u },
            ) if p.parent() == q.parent() => {
                if let (Some(start), Some(at)) = (p.last_index(), q.last_index()) {
                    // forward delete at the same offset
                    if at == start {
                        t.push_str(u);
                        return;
                    }
                    // backspace over the characters just before
                    if at.checked_add(u.chars().count()) == Some(start) {
                        let mut merged = u.clone();
                        merged.push_str(t);
                        *t = merged;
                        *p = p.with_last_index(at);
                        return;
                    }
                }
            }
            _ => {}
        }
    }
    out.push(next);
}
