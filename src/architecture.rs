//! The abstraction between the generic core and a concrete instruction set.

use byteorder::{ByteOrder, LittleEndian};

use crate::il::{BitWidth, Name};

/// A machine word consumed by the decoder.
///
/// Tokens are fixed-width unsigned integers; the decoder reads them from the
/// byte image in little-endian order and matches bit patterns against them.
pub trait Token: Copy + Eq + std::fmt::Debug + 'static {
    /// Width of the token in bits (a power of two).
    const BITS: u32;

    /// Width of the token in bytes.
    const SIZE: usize = (Self::BITS / 8) as usize;

    /// Reads one token from the start of `buf`, little endian. `None` if the
    /// buffer is too short.
    fn read(buf: &[u8]) -> Option<Self>;

    /// Truncating conversion from the pattern-compiler's working type.
    fn from_u64(bits: u64) -> Self;

    /// Zero-extending conversion into the pattern-compiler's working type.
    fn to_u64(self) -> u64;

    /// The all-ones token.
    fn all_set() -> Self {
        Self::from_u64(u64::MAX)
    }
}

impl Token for u8 {
    const BITS: u32 = 8;

    fn read(buf: &[u8]) -> Option<Self> {
        buf.first().copied()
    }

    fn from_u64(bits: u64) -> Self {
        bits as u8
    }

    fn to_u64(self) -> u64 {
        u64::from(self)
    }
}

impl Token for u16 {
    const BITS: u32 = 16;

    fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= 2).then(|| LittleEndian::read_u16(buf))
    }

    fn from_u64(bits: u64) -> Self {
        bits as u16
    }

    fn to_u64(self) -> u64 {
        u64::from(self)
    }
}

impl Token for u32 {
    const BITS: u32 = 32;

    fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= 4).then(|| LittleEndian::read_u32(buf))
    }

    fn from_u64(bits: u64) -> Self {
        bits as u32
    }

    fn to_u64(self) -> u64 {
        u64::from(self)
    }
}

impl Token for u64 {
    const BITS: u32 = 64;

    fn read(buf: &[u8]) -> Option<Self> {
        (buf.len() >= 8).then(|| LittleEndian::read_u64(buf))
    }

    fn from_u64(bits: u64) -> Self {
        bits
    }

    fn to_u64(self) -> u64 {
        self
    }
}

/// Description of a concrete instruction-set architecture.
///
/// The descriptor is cloned into every decode attempt, so implementations
/// should be cheap handles; a shared counter for [`temporary`] names is
/// usually carried behind an `Arc`. Keeping the counter inside the descriptor
/// (instead of a process-wide global) lets independent drivers run with
/// independent name spaces.
///
/// [`temporary`]: Architecture::temporary
pub trait Architecture: Clone {
    /// The machine word the decoder consumes.
    type Token: Token;

    /// Opaque state threaded through a decode attempt, available to semantic
    /// actions (e.g. decoded prefixes).
    type State: Clone + Default;

    /// Whether `name` denotes an architectural register or flag.
    fn is_register(&self, name: &str) -> bool;

    /// Declared width of an architectural name, if any.
    fn register_width(&self, name: &str) -> Option<BitWidth>;

    /// A fresh, unique, non-architectural temporary name.
    fn temporary(&self) -> Name;
}
