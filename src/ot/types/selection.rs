//! Logical selection ranges used by presence.

use serde::{Deserialize, Serialize};

use crate::ot::types::path::Path;

/// A text selection in logical document coordinates.
///
/// Both ends are paths into the document value (for text, a string node path
/// followed by a character offset). Pixel geometry is derived by whatever
/// renders the document and is never carried here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Path,
    pub focus: Path,
}

impl Selection {
    pub fn new(anchor: Path, focus: Path) -> Self {
        Selection { anchor, focus }
    }

    /// A collapsed selection (a caret).
    pub fn caret(at: Path) -> Self {
        Selection {
            anchor: at.clone(),
            focus: at,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}
