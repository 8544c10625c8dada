//! Paths into a document value.
//!
//! A path is a list of segments walked from the document root. Object members
//! are addressed by key, array elements and string characters by index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// One step of a [`Path`].
///
/// Serializes untagged, so a path reads on the wire as a plain JSON array such
/// as `["items", 2, "title"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(_) => None,
        }
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(k) => Some(k),
            PathSegment::Index(_) => None,
        }
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Key(k) => write!(f, "{k:?}"),
        }
    }
}

/// An absolute path from the document root. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The path of the containing node. The root is its own parent.
    pub fn parent(&self) -> &[PathSegment] {
        match self.0.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.0.last()
    }

    /// The trailing index, when the path ends in a sequence position.
    pub fn last_index(&self) -> Option<usize> {
        self.0.last().and_then(PathSegment::as_index)
    }

    /// Returns a copy with the trailing segment replaced by `index`.
    pub fn with_last_index(&self, index: usize) -> Path {
        let mut segments = self.0.clone();
        if let Some(last) = segments.last_mut() {
            *last = PathSegment::Index(index);
        }
        Path(segments)
    }

    /// Returns a copy with the segment at `depth` replaced by `index`.
    pub fn with_index_at(&self, depth: usize, index: usize) -> Path {
        let mut segments = self.0.clone();
        segments[depth] = PathSegment::Index(index);
        Path(segments)
    }

    /// Returns `self` followed by `segment`.
    pub fn child(&self, segment: impl Into<PathSegment>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    /// True when `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &[PathSegment]) -> bool {
        other.len() >= self.0.len() && other[..self.0.len()] == self.0[..]
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &[PathSegment]) -> bool {
        other.len() > self.0.len() && self.is_prefix_of(other)
    }

    /// Re-roots `other` below this path, when it lives there.
    pub fn relative<'a>(&self, other: &'a [PathSegment]) -> Option<&'a [PathSegment]> {
        self.is_prefix_of(other).then(|| &other[self.0.len()..])
    }

    /// Replaces the leading `prefix.len()` segments with `prefix`.
    pub fn rebase(&self, prefix: &[PathSegment]) -> Path {
        let mut segments = prefix.to_vec();
        segments.extend_from_slice(&self.0[prefix.len()..]);
        Path(segments)
    }
}

impl Deref for Path {
    type Target = [PathSegment];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(segments: Vec<PathSegment>) -> Self {
        Path(segments)
    }
}

impl From<&[PathSegment]> for Path {
    fn from(segments: &[PathSegment]) -> Self {
        Path(segments.to_vec())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{segment}")?;
        }
        f.write_str("]")
    }
}

/// Builds a [`Path`] from keys and indices.
///
/// ```rust
/// use collab_ot::path;
///
/// let p = path!["items", 2, "title"];
/// assert_eq!(p.len(), 3);
/// ```
#[macro_export]
macro_rules! path {
    () => {
        $crate::Path::root()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::Path::from(vec![$($crate::PathSegment::from($segment)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_relations() {
        let parent = path!["items", 2];
        let child = path!["items", 2, "title"];

        assert!(parent.is_prefix_of(&child));
        assert!(parent.is_ancestor_of(&child));
        assert!(parent.is_prefix_of(&parent));
        assert!(!parent.is_ancestor_of(&parent));
        assert!(!child.is_prefix_of(&parent));
        assert_eq!(parent.relative(&child), Some(&[PathSegment::from("title")][..]));
    }

    #[test]
    fn test_wire_form() {
        let p = path!["items", 2, "title"];
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"["items",2,"title"]"#);

        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_rebase_and_indices() {
        let p = path!["a", 1, "b"];
        assert_eq!(p.with_index_at(1, 4), path!["a", 4, "b"]);
        assert_eq!(p.rebase(&[PathSegment::from("z")]), path!["z", 1, "b"]);
        assert_eq!(path![0, 3].with_last_index(7), path![0, 7]);
        assert_eq!(path![0, 3].last_index(), Some(3));
        assert_eq!(Path::root().parent(), &[] as &[PathSegment]);
    }

    #[test]
    fn test_display() {
        assert_eq!(path!["items", 2].to_string(), r#"["items", 2]"#);
        assert_eq!(Path::root().to_string(), "[]");
    }
}
