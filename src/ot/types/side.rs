//! Tie-break priority used when two concurrent edits target the same spot.

use serde::{Deserialize, Serialize};

use crate::ot::types::client_id::ClientId;

/// Which of two concurrent operations wins a tie.
///
/// `transform(a, b, side)` reads `side` as the priority of `a`; `b` always gets
/// the opposite side. At an equal insertion point the `Left` operation's content
/// is ordered first, and in a conflicting write the `Left` operation wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Returns the opposite side.
    pub fn flip(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Derives the side of `ours` against `theirs` from the client identifiers.
    ///
    /// Every replica and every server instance computes the same answer for the
    /// same pair, so concurrent inserts are ordered identically everywhere. The
    /// smaller identifier goes left; a client compared with itself is `Left`.
    pub fn for_clients(ours: &ClientId, theirs: &ClientId) -> Self {
        if ours <= theirs { Side::Left } else { Side::Right }
    }

    pub fn is_left(self) -> bool {
        self == Side::Left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_flip() {
        assert_eq!(Side::Left.flip(), Side::Right);
        assert_eq!(Side::Right.flip(), Side::Left);
    }

    #[test]
    fn test_for_clients_is_antisymmetric() {
        let a = ClientId::from(Uuid::from_u128(1));
        let b = ClientId::from(Uuid::from_u128(2));

        assert_eq!(Side::for_clients(&a, &b), Side::Left);
        assert_eq!(Side::for_clients(&b, &a), Side::Right);
        assert_eq!(Side::for_clients(&a, &b).flip(), Side::for_clients(&b, &a));
        assert_eq!(Side::for_clients(&a, &a), Side::Left);
    }
}
