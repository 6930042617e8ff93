//! Identifier types.
//!
//! `BlockId` and `ObjectId` are wrap-capable sequence numbers: any two ids
//! are ordered by signed modular distance, never by plain integer
//! comparison, so a transfer can run past the numeric top of the id space
//! without disturbing window bookkeeping. `SegmentId` indexes a symbol
//! within a single block and does not wrap.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a symbol within a block.
///
/// Data symbols occupy `[0, num_data)`, parity symbols `[num_data, size)`.
pub type SegmentId = u16;

/// Block sequence number.
///
/// Wraps over the full `u32` space; ordering uses the signed half-window
/// (`delta` / `precedes` / `follows`), so `0` follows `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(u32);

impl BlockId {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Signed modular distance `self - other`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // the wrap is the point
    pub const fn delta(self, other: Self) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// `self` sorts before `other` in sequence space.
    #[must_use]
    pub const fn precedes(self, other: Self) -> bool {
        self.delta(other) < 0
    }

    /// `self` sorts after `other` in sequence space.
    #[must_use]
    pub const fn follows(self, other: Self) -> bool {
        self.delta(other) > 0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    /// Wrapping advance by `n`.
    #[must_use]
    pub const fn offset(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Wrapping retreat by `n`.
    #[must_use]
    pub const fn offset_back(self, n: u32) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Unsigned wrapping distance from `lo`.
    ///
    /// The span-accounting primitive: an occupied window `[lo, hi]` covers
    /// `hi.span_from(lo) + 1` ids.
    #[must_use]
    pub const fn span_from(self, lo: Self) -> u32 {
        self.0.wrapping_sub(lo.0)
    }

    /// Sequence-order minimum.
    #[must_use]
    pub fn seq_min(self, other: Self) -> Self {
        if self.precedes(other) {
            self
        } else {
            other
        }
    }

    /// Sequence-order maximum.
    #[must_use]
    pub fn seq_max(self, other: Self) -> Self {
        if self.follows(other) {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BlockId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Object transport sequence number.
///
/// Same wrap semantics as [`BlockId`] over the `u16` space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u16);

impl ObjectId {
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Signed modular distance `self - other`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // the wrap is the point
    pub const fn delta(self, other: Self) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }

    /// `self` sorts before `other` in sequence space.
    #[must_use]
    pub const fn precedes(self, other: Self) -> bool {
        self.delta(other) < 0
    }

    /// `self` sorts after `other` in sequence space.
    #[must_use]
    pub const fn follows(self, other: Self) -> bool {
        self.delta(other) > 0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ObjectId {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_ordering_is_modular() {
        let a = BlockId::new(u32::MAX);
        let b = a.next();
        assert_eq!(b, BlockId::new(0));
        assert!(a.precedes(b));
        assert!(b.follows(a));
        assert_eq!(b.delta(a), 1);
        assert_eq!(a.delta(b), -1);
    }

    #[test]
    fn block_id_span_wraps() {
        let lo = BlockId::new(u32::MAX - 2);
        let hi = BlockId::new(4);
        assert_eq!(hi.span_from(lo), 7);
        assert_eq!(hi.span_from(lo) + 1, 8);
    }

    #[test]
    fn block_id_seq_min_max() {
        let a = BlockId::new(u32::MAX);
        let b = BlockId::new(3);
        assert_eq!(a.seq_min(b), a);
        assert_eq!(a.seq_max(b), b);
        assert_eq!(a.seq_min(a), a);
    }

    #[test]
    fn block_id_offsets() {
        let id = BlockId::new(10);
        assert_eq!(id.offset(5), BlockId::new(15));
        assert_eq!(id.offset_back(12), BlockId::new(u32::MAX - 1));
        assert_eq!(id.prev().next(), id);
    }

    #[test]
    fn object_id_ordering_is_modular() {
        let a = ObjectId::new(u16::MAX);
        let b = a.next();
        assert_eq!(b, ObjectId::new(0));
        assert!(a.precedes(b));
        assert!(b.follows(a));
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = BlockId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: BlockId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }
}
