//! Persisted addresses and transaction-local references.
//!
//! Offsets in the store are always multiples of [`ALIGN`], so they are stored
//! divided by `ALIGN` in a `u32`, plus one so that zero can mean "absent".
//! This limits a store to `(2^32 - 1) * 8` bytes (about 32 GiB).
//!
//! A node or data record created by a transaction has no address until the
//! transaction commits. Until then it is referred to by an intref, an index
//! into the transaction's [`IntRefs`](crate::storage::IntRefs) table. [`Ref`]
//! makes the distinction explicit so no code can do address arithmetic on an
//! intref.

use std::fmt;
use std::num::NonZeroU32;

/// log2 of the allocation alignment.
pub const SHIFT: u32 = 3;

/// Allocation alignment in bytes (must be a power of 2).
pub const ALIGN: u64 = 1 << SHIFT;

/// Largest byte offset an [`Address`] can encode.
pub const MAX_OFFSET: u64 = (u32::MAX as u64 - 1) << SHIFT;

/// Round `n` up to a multiple of [`ALIGN`].
#[must_use]
pub const fn align(n: u64) -> u64 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// A persisted location in a store, encoded as `(offset / ALIGN) + 1`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(NonZeroU32);

impl Address {
    /// Encode a byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not aligned or exceeds [`MAX_OFFSET`].
    #[must_use]
    pub fn from_offset(offset: u64) -> Self {
        assert!(offset % ALIGN == 0, "unaligned offset {offset}");
        assert!(offset <= MAX_OFFSET, "offset {offset} exceeds maximum store size");
        #[allow(clippy::cast_possible_truncation)] // range checked above
        let raw = (offset >> SHIFT) as u32 + 1;
        match NonZeroU32::new(raw) {
            Some(n) => Self(n),
            None => unreachable!("encoded address is never zero"),
        }
    }

    /// Decode the byte offset this address refers to.
    #[must_use]
    pub const fn offset(self) -> u64 {
        ((self.0.get() - 1) as u64) << SHIFT
    }

    /// The encoded form, as stored on disk.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.get()
    }

    /// Inverse of [`raw`](Self::raw). Zero (absent) gives `None`.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// The address `n` bytes further on. `n` must be a multiple of [`ALIGN`].
    #[must_use]
    pub fn advance(self, n: u64) -> Self {
        Self::from_offset(self.offset() + n)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.raw())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.offset())
    }
}

/// A reference to either a persisted object or a transaction-local one.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ref {
    /// Already persisted.
    Adr(Address),
    /// Index into the owning transaction's intref table.
    IntRef(u32),
}

impl Ref {
    #[must_use]
    pub const fn is_intref(self) -> bool {
        matches!(self, Self::IntRef(_))
    }

    /// The persisted address, if this is not an intref.
    #[must_use]
    pub const fn address(self) -> Option<Address> {
        match self {
            Self::Adr(adr) => Some(adr),
            Self::IntRef(_) => None,
        }
    }

    /// The persisted address.
    ///
    /// # Panics
    ///
    /// Panics if this is an intref. Callers use this where the protocol
    /// guarantees every reference has been resolved.
    #[must_use]
    pub fn expect_address(self, context: &str) -> Address {
        match self {
            Self::Adr(adr) => adr,
            Self::IntRef(i) => panic!("{context}: unresolved intref {i}"),
        }
    }
}

impl From<Address> for Ref {
    fn from(adr: Address) -> Self {
        Self::Adr(adr)
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adr(adr) => write!(f, "{adr:?}"),
            Self::IntRef(i) => write!(f, "IntRef({i})"),
        }
    }
}
