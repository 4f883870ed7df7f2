//! Modular 32-bit sequence space.
//!
//! Sequence numbers wrap at 2^32.  Two numbers are compared by looking at
//! their wrapping difference: `a` is before `b` when `b - a` (mod 2^32) is in
//! `1..2^31`.  This is only meaningful while the two values are less than
//! 2^31 apart, which the bounded in-flight window and reorder buffer
//! guarantee.
//!
//! Plain `<` on the raw `u32` is never correct here, which is why [`Seq`]
//! does not implement `PartialOrd`.

use std::fmt;

const HALF: u32 = 1 << 31;

/// A sequence (or acknowledgement) number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(pub u32);

impl Seq {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The number after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// The number before this one.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }

    #[must_use]
    pub const fn add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Forward distance from `self` to `later` (mod 2^32).
    pub const fn distance_to(self, later: Self) -> u32 {
        later.0.wrapping_sub(self.0)
    }

    /// `true` if `self` comes strictly before `other`.
    pub const fn is_before(self, other: Self) -> bool {
        let d = other.0.wrapping_sub(self.0);
        d != 0 && d < HALF
    }

    /// `true` if `self` comes strictly after `other`.
    pub const fn is_after(self, other: Self) -> bool {
        other.is_before(self)
    }

    /// `true` if `self` lies in the half-open range `[start, end)`.
    pub const fn in_range(self, start: Self, end: Self) -> bool {
        start.distance_to(self) < start.distance_to(end)
    }
}

impl From<u32> for Seq {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
