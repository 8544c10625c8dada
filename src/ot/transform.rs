//! Operational transformation of concurrent operations.
//!
//! `transform(a, b, side)` takes two operations generated against the same
//! document and returns `(a', b')` such that
//! `apply(apply(d, a), b') == apply(apply(d, b), a')`.
//!
//! # Policies
//!
//! - Equal insertion points (array gap, text offset, object key) are ordered by
//!   `side`: the `Left` operation's content comes first. For an object key the
//!   `Left` insert wins and the other one becomes a no-op.
//! - Deleting something a concurrent operation already deleted is a no-op.
//! - Edits inside a subtree that a concurrent operation deleted or replaced are
//!   dropped. The delete/replace absorbs them into its snapshot so it still
//!   inverts exactly.
//! - Concurrent replaces of the same node: `Left` wins. Delete beats replace.
//! - Overlapping text deletes remove the union of both ranges. A text delete
//!   split by a concurrent insert becomes two deletes around the inserted text.
//! - A concurrent insert at a moved element's destination lands before it.
//!   Two moves of the same element: the `Left` destination wins. Two moves of
//!   different elements are placed by their gaps in the array without either
//!   element, ties ordered by `side`.
//!
//! Index arithmetic saturates: an index near `usize::MAX` can only come from
//! a bogus operation, and `apply` rejects it as out of range.

use serde_json::Value;

use crate::ot::component::Component;
use crate::ot::operation::Operation;
use crate::ot::types::{Path, PathSegment, Side};

/// Transforms two concurrent operations against each other.
///
/// `side` is the priority of `a`; `b` is transformed with the opposite side.
/// Use [`Side::for_clients`] to derive it so every replica agrees.
pub fn transform(a: &Operation, b: &Operation, side: Side) -> (Operation, Operation) {
    let (a_out, b_out) = transform_lists(
        a.components().to_vec(),
        b.components().to_vec(),
        side,
    );
    (Operation::new(a_out), Operation::new(b_out))
}

/// Transforms `a` so it applies after `b`, discarding the other half.
pub fn transform_against(a: &Operation, b: &Operation, side: Side) -> Operation {
    transform(a, b, side).0
}

fn transform_lists(
    a: Vec<Component>,
    b: Vec<Component>,
    side: Side,
) -> (Vec<Component>, Vec<Component>) {
    if a.is_empty() || b.is_empty() {
        return (a, b);
    }

    if a.len() == 1 && b.len() == 1 {
        let a_out = transform_component(&a[0], &b[0], side);
        let b_out = transform_component(&b[0], &a[0], side.flip());
        return (a_out, b_out);
    }

    if a.len() > 1 {
        let mut head = a;
        let tail = head.split_off(1);
        let (head_out, b_mid) = transform_lists(head, b, side);
        let (tail_out, b_out) = transform_lists(tail, b_mid, side);
        let mut a_out = head_out;
        a_out.extend(tail_out);
        return (a_out, b_out);
    }

    let mut head = b;
    let tail = head.split_off(1);
    let (a_mid, head_out) = transform_lists(a, head, side);
    let (a_out, tail_out) = transform_lists(a_mid, tail, side);
    let mut b_out = head_out;
    b_out.extend(tail_out);
    (a_out, b_out)
}

/// How the last segment of a path is read while it is being rewritten.
#[derive(Debug, Clone, Copy)]
enum Role {
    /// An existing node (or character).
    Node,
    /// An insertion point between nodes (or characters).
    Gap(Side),
}

impl Role {
    fn is_left_gap(self) -> bool {
        matches!(self, Role::Gap(Side::Left))
    }

    fn is_gap(self) -> bool {
        matches!(self, Role::Gap(_))
    }
}

/// Rewrites component `a` so it applies after component `b`.
fn transform_component(a: &Component, b: &Component, side: Side) -> Vec<Component> {
    if a.is_noop() {
        return Vec::new();
    }
    if b.is_noop() {
        return vec![a.clone()];
    }

    match a {
        Component::Insert { path, value } => {
            if let Component::Insert {
                path: other,
                value: theirs,
            } = b
            {
                if other == path && path.last().and_then(PathSegment::as_key).is_some() {
                    return if side.is_left() {
                        vec![Component::Replace {
                            path: path.clone(),
                            old: theirs.clone(),
                            new: value.clone(),
                        }]
                    } else {
                        Vec::new()
                    };
                }
            }
            map_path(path, Role::Gap(side), b)
                .map(|path| Component::Insert {
                    path,
                    value: value.clone(),
                })
                .into_iter()
                .collect()
        }

        Component::Delete { path, value } => match b {
            Component::Delete { path: other, .. } if other == path => Vec::new(),
            Component::Replace { path: other, new, .. } if other == path => {
                vec![Component::Delete {
                    path: path.clone(),
                    value: new.clone(),
                }]
            }
            _ if path.is_ancestor_of(b.path()) => vec![Component::Delete {
                path: path.clone(),
                value: absorb(value, path.len(), b),
            }],
            _ => map_path(path, Role::Node, b)
                .map(|path| Component::Delete {
                    path,
                    value: value.clone(),
                })
                .into_iter()
                .collect(),
        },

        Component::Replace { path, old, new } => match b {
            Component::Replace {
                path: other,
                new: theirs,
                ..
            } if other == path => {
                if side.is_left() {
                    vec![Component::Replace {
                        path: path.clone(),
                        old: theirs.clone(),
                        new: new.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }
            Component::Delete { path: other, .. } if other == path => Vec::new(),
            _ if path.is_ancestor_of(b.path()) => vec![Component::Replace {
                path: path.clone(),
                old: absorb(old, path.len(), b),
                new: new.clone(),
            }],
            _ => map_path(path, Role::Node, b)
                .map(|path| Component::Replace {
                    path,
                    old: old.clone(),
                    new: new.clone(),
                })
                .into_iter()
                .collect(),
        },

        Component::InsertText { path, text } => map_path(path, Role::Gap(side), b)
            .map(|path| Component::InsertText {
                path,
                text: text.clone(),
            })
            .into_iter()
            .collect(),

        Component::DeleteText { path, text } => transform_delete_text(path, text, b),

        Component::Move { from, to } => transform_move(from, to, b, side),
    }
}

fn transform_delete_text(path: &Path, text: &str, b: &Component) -> Vec<Component> {
    let (Some(i), len) = (path.last_index(), text.chars().count()) else {
        return vec![Component::DeleteText {
            path: path.clone(),
            text: text.to_string(),
        }];
    };

    match b {
        Component::InsertText {
            path: other,
            text: inserted,
        } if same_string(path, other) => {
            let Some(j) = other.last_index() else {
                return vec![delete_text(path.clone(), text.to_string())];
            };
            let n = inserted.chars().count();
            if j <= i {
                vec![delete_text(path.with_last_index(i.saturating_add(n)), text.to_string())]
            } else if j >= i.saturating_add(len) {
                vec![delete_text(path.clone(), text.to_string())]
            } else {
                // the insert landed inside our range: delete around it
                let (before, after) = split_chars(text, j - i);
                vec![
                    delete_text(path.clone(), before),
                    delete_text(path.with_last_index(i.saturating_add(n)), after),
                ]
            }
        }
        Component::DeleteText {
            path: other,
            text: deleted,
        } if same_string(path, other) => {
            let Some(j) = other.last_index() else {
                return vec![delete_text(path.clone(), text.to_string())];
            };
            let n = deleted.chars().count();
            let remaining: String = text
                .chars()
                .enumerate()
                .filter(|(k, _)| {
                    let at = i.saturating_add(*k);
                    at < j || at >= j.saturating_add(n)
                })
                .map(|(_, ch)| ch)
                .collect();
            if remaining.is_empty() {
                return Vec::new();
            }
            let start = if i < j {
                i
            } else if i >= j.saturating_add(n) {
                i - n
            } else {
                j
            };
            vec![delete_text(path.with_last_index(start), remaining)]
        }
        _ => map_path(path, Role::Node, b)
            .map(|path| delete_text(path, text.to_string()))
            .into_iter()
            .collect(),
    }
}

fn transform_move(from: &Path, to: &Path, b: &Component, side: Side) -> Vec<Component> {
    let parent = from.parent();
    let (Some(f), Some(t)) = (from.last_index(), to.last_index()) else {
        return vec![Component::Move {
            from: from.clone(),
            to: to.clone(),
        }];
    };
    let moved = |nf: usize, nt: usize| {
        vec![Component::Move {
            from: from.with_last_index(nf),
            to: to.with_last_index(nt),
        }]
    };

    match b {
        Component::Move {
            from: other_from,
            to: other_to,
        } if other_from.parent() == parent => {
            let (Some(f2), Some(t2)) = (other_from.last_index(), other_to.last_index()) else {
                return moved(f, t);
            };
            if f == f2 {
                // same element: the left destination wins
                return if side.is_left() { moved(t2, t) } else { Vec::new() };
            }
            // where our element sits once the other move is done
            let q = f - usize::from(f > f2);
            let new_from = if q >= t2 { q.saturating_add(1) } else { q };
            // both destinations as gaps in the array without either element
            let other_pos = f2 - usize::from(f2 > f);
            let ours = if t <= other_pos { t } else { t - 1 };
            let theirs = if t2 <= q { t2 } else { t2 - 1 };
            let new_to = if ours < theirs || (ours == theirs && side.is_left()) {
                ours
            } else {
                ours.saturating_add(1)
            };
            moved(new_from, new_to)
        }
        Component::Delete { path: other, .. } if other.parent() == parent => {
            let Some(k) = other.last_index() else {
                return moved(f, t);
            };
            if k == f {
                return Vec::new();
            }
            let new_from = f - usize::from(k < f);
            let k_without_ours = k - usize::from(k > f);
            let new_to = if t <= k_without_ours { t } else { t - 1 };
            moved(new_from, new_to)
        }
        Component::Insert { path: other, .. } if other.parent() == parent => {
            let Some(i) = other.last_index() else {
                return moved(f, t);
            };
            let new_from = if f >= i { f.saturating_add(1) } else { f };
            let i_without_ours = if i <= f { i } else { i - 1 };
            // the inserted node takes the gap; our element lands after it
            let new_to = if t >= i_without_ours { t.saturating_add(1) } else { t };
            moved(new_from, new_to)
        }
        _ => match map_path(&Path::from(parent), Role::Node, b) {
            Some(new_parent) => vec![Component::Move {
                from: from.rebase(&new_parent),
                to: to.rebase(&new_parent),
            }],
            None => Vec::new(),
        },
    }
}

/// Rewrites `p` for a document that `b` has already been applied to.
///
/// Returns `None` when the node `p` addresses (or any of its ancestors) no
/// longer exists.
fn map_path(p: &Path, role: Role, b: &Component) -> Option<Path> {
    match b {
        Component::Insert { path: other, .. } => {
            let (Some(i), Some(d)) = (other.last_index(), other.len().checked_sub(1)) else {
                return Some(p.clone());
            };
            match index_in_container(p, other) {
                Some(j) => {
                    let at_gap = p.len() == d + 1 && role.is_gap();
                    let shift = j > i || (j == i && !(at_gap && role.is_left_gap()));
                    Some(if shift { p.with_index_at(d, j.saturating_add(1)) } else { p.clone() })
                }
                None => Some(p.clone()),
            }
        }

        Component::InsertText {
            path: other,
            text,
        } => {
            let (Some(i), Some(j)) = (other.last_index(), p.last_index()) else {
                return Some(p.clone());
            };
            if !same_string(p, other) {
                return Some(p.clone());
            }
            let shift = j > i || (j == i && !role.is_left_gap());
            Some(if shift {
                p.with_last_index(j.saturating_add(text.chars().count()))
            } else {
                p.clone()
            })
        }

        Component::Delete { path: other, .. } => {
            let Some(d) = other.len().checked_sub(1) else {
                return Some(p.clone());
            };
            if p.len() <= d || p[..d] != other[..d] {
                return Some(p.clone());
            }
            let at_gap = p.len() == d + 1 && role.is_gap();
            match (&other[d], &p[d]) {
                (PathSegment::Index(i), PathSegment::Index(j)) => {
                    if j < i {
                        Some(p.clone())
                    } else if j > i {
                        Some(p.with_index_at(d, j - 1))
                    } else if at_gap {
                        Some(p.clone())
                    } else {
                        None
                    }
                }
                (PathSegment::Key(k), PathSegment::Key(q)) if k == q => {
                    if at_gap {
                        Some(p.clone())
                    } else {
                        None
                    }
                }
                _ => Some(p.clone()),
            }
        }

        Component::DeleteText {
            path: other,
            text,
        } => {
            let (Some(i), Some(j)) = (other.last_index(), p.last_index()) else {
                return Some(p.clone());
            };
            if !same_string(p, other) {
                return Some(p.clone());
            }
            let n = text.chars().count();
            let mapped = if j <= i {
                j
            } else if j >= i.saturating_add(n) {
                j - n
            } else {
                i
            };
            Some(p.with_last_index(mapped))
        }

        Component::Replace { path: other, .. } => {
            if !other.is_prefix_of(p) {
                Some(p.clone())
            } else if p.len() == other.len() && role.is_gap() {
                Some(p.clone())
            } else {
                None
            }
        }

        Component::Move { from, to } => {
            let (Some(f), Some(t), Some(d)) =
                (from.last_index(), to.last_index(), from.len().checked_sub(1))
            else {
                return Some(p.clone());
            };
            let Some(j) = index_in_container(p, from) else {
                return Some(p.clone());
            };
            let at_gap = p.len() == d + 1 && role.is_gap();
            let mapped = if at_gap {
                let without = j - usize::from(j > f);
                if without > t { without.saturating_add(1) } else { without }
            } else if j == f {
                t
            } else {
                let without = j - usize::from(j > f);
                if without >= t { without.saturating_add(1) } else { without }
            };
            Some(p.with_index_at(d, mapped))
        }
    }
}

/// The index `p` takes inside the container `sibling` points into, if any.
fn index_in_container(p: &Path, sibling: &Path) -> Option<usize> {
    let d = sibling.len().checked_sub(1)?;
    if p.len() > d && p[..d] == sibling[..d] {
        p[d].as_index()
    } else {
        None
    }
}

fn same_string(a: &Path, b: &Path) -> bool {
    a.len() == b.len() && a.parent() == b.parent()
}

fn delete_text(path: Path, text: String) -> Component {
    Component::DeleteText { path, text }
}

fn split_chars(text: &str, at: usize) -> (String, String) {
    let split = text.char_indices().nth(at).map_or(text.len(), |(i, _)| i);
    (text[..split].to_string(), text[split..].to_string())
}

/// Folds `edit`, which lives below `depth` segments, into `snapshot`.
fn absorb(snapshot: &Value, depth: usize, edit: &Component) -> Value {
    let mut out = snapshot.clone();
    match edit.strip_prefix(depth).apply_to(&mut out) {
        Ok(()) => out,
        Err(_) => snapshot.clone(),
    }
}
