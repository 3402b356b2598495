//! Storage errors and big-endian byte helpers shared by the on-disk formats.
//!
//! Everything the engine persists uses a fixed big-endian byte order. Reads
//! go through these helpers so a short buffer becomes `None` instead of a
//! panic, letting callers turn it into a corruption error with context.

use std::path::PathBuf;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// The store file could not be opened or created.
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A chunk could not be memory mapped.
    ChunkMap { chunk: u64, source: std::io::Error },
    /// Access outside the allocated part of the store.
    OutOfBounds { offset: u64, len: u64, end: u64 },
    /// Write attempted on a store opened read-only.
    ReadOnly,
    /// An allocation does not fit in a chunk, or the store has reached its
    /// maximum addressable size.
    TooLarge,
    /// Corruption detected.
    Corruption(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Open { path, source } => {
                write!(f, "can't open or create {}: {source}", path.display())
            }
            Self::ChunkMap { chunk, source } => write!(f, "can't map chunk {chunk}: {source}"),
            Self::OutOfBounds { offset, len, end } => write!(
                f,
                "access of {len} bytes at offset {offset} out of bounds (end: {end})"
            ),
            Self::ReadOnly => write!(f, "store is read-only"),
            Self::TooLarge => write!(f, "allocation exceeds the chunk or store size"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Open { source: e, .. } | Self::ChunkMap { source: e, .. } => {
                Some(e)
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read a big-endian `u16` at `at`, or `None` if the buffer is too short.
#[must_use]
pub fn get_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian `u32` at `at`, or `None` if the buffer is too short.
#[must_use]
pub fn get_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a big-endian `u64` at `at`, or `None` if the buffer is too short.
#[must_use]
pub fn get_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at.checked_add(8)?)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    Some(u64::from_be_bytes(word))
}

/// Pad `buf` with zeros up to the next multiple of [`ALIGN`](crate::storage::ALIGN).
pub fn pad_to_align(buf: &mut Vec<u8>) {
    #[allow(clippy::cast_possible_truncation)] // ALIGN is 8
    let aligned = crate::storage::address::align(buf.len() as u64) as usize;
    buf.resize(aligned, 0);
}
