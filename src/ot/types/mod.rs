//! Type definitions for the operation model.
//!
//! This module contains the fundamental types used throughout the OT implementation,
//! organized into focused submodules for better maintainability.

pub mod client_id;
pub mod path;
pub mod selection;
pub mod side;

pub use client_id::{ClientId, DocumentId};
pub use path::{Path, PathSegment};
pub use selection::Selection;
pub use side::Side;
