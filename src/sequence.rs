//! Multilink sequence number arithmetic.
//!
//! MP fragments carry either a 12-bit ("short") or a 24-bit ("long")
//! sequence number that wraps around. Ordering between two sequence numbers
//! is only meaningful as a signed circular distance: `a` is after `b` when
//! `diff(a, b) > 0`. Plain integer comparison breaks at the wrap point and
//! must never be used on raw sequence numbers.
//!
//! # Example
//!
//! ```
//! use ppp_multilink::SeqMode;
//!
//! let mode = SeqMode::Short;
//! assert_eq!(mode.next(4095), 0);
//! assert_eq!(mode.diff(0, 4095), 1);
//! assert_eq!(mode.diff(4095, 0), -1);
//! ```

use serde::{Deserialize, Serialize};

/// Sequence number as carried on the wire (masked to the mode's width).
pub type Seq = u32;

/// Sequence number width of an MP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeqMode {
    /// 12-bit sequence numbers, 2-byte header.
    Short,
    /// 24-bit sequence numbers, 4-byte header.
    Long,
}

impl SeqMode {
    /// Select the mode from the `*ShortSeq` configuration flags.
    pub const fn from_short(short: bool) -> Self {
        if short {
            Self::Short
        } else {
            Self::Long
        }
    }

    /// Number of sequence bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Short => 12,
            Self::Long => 24,
        }
    }

    /// Mask covering the sequence bits.
    pub const fn mask(self) -> u32 {
        (1 << self.bits()) - 1
    }

    /// Number of distinct sequence numbers.
    pub const fn modulus(self) -> u32 {
        1 << self.bits()
    }

    /// Size in bytes of the MP header for this mode.
    pub const fn header_len(self) -> usize {
        match self {
            Self::Short => 2,
            Self::Long => 4,
        }
    }

    /// Signed circular distance from `b` to `a`.
    ///
    /// The raw difference is masked to the sequence width and sign-extended,
    /// so the result lies in `[-modulus/2, modulus/2)`.
    #[inline]
    pub const fn diff(self, a: Seq, b: Seq) -> i32 {
        let shift = 32 - self.bits();
        let raw = a.wrapping_sub(b) & self.mask();
        ((raw << shift) as i32) >> shift
    }

    /// Sequence number following `seq`.
    #[inline]
    pub const fn next(self, seq: Seq) -> Seq {
        seq.wrapping_add(1) & self.mask()
    }

    /// Sequence number preceding `seq`.
    #[inline]
    pub const fn prev(self, seq: Seq) -> Seq {
        seq.wrapping_sub(1) & self.mask()
    }

    /// Returns true if `a` comes strictly after `b`.
    #[inline]
    pub const fn is_after(self, a: Seq, b: Seq) -> bool {
        self.diff(a, b) > 0
    }
}

impl std::fmt::Display for SeqMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Short => write!(f, "short (12-bit)"),
            Self::Long => write!(f, "long (24-bit)"),
        }
    }
}
