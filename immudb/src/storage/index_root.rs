//! Index root records.
//!
//! Every commit ends by appending an index root to the index store. The last
//! valid root names the root node of every tree, the redirections trie and
//! how much of the data log it covers, so opening a database only needs the
//! tail of the index store.
//!
//! ```text
//! magic: [u8; 4]        "IMRT"
//! version: u16
//! tree count: u16
//! per tree: tblnum u16, levels u8, pad u8, root u32
//! redirects root: u32   0 when empty
//! last commit: u32      0 when none
//! data size: u64
//! timestamp: u32, pad u32
//! checksum: u32         CRC32 of everything before it
//! size: u32
//! ```

use std::fmt;

use crate::storage::address::Address;
use crate::storage::io::{StorageError, get_u16, get_u32, get_u64};
use crate::storage::mmap::Storage;

/// Magic bytes identifying an index root.
pub const MAGIC: [u8; 4] = *b"IMRT";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 8;
const TREE_SIZE: usize = 8;
const FOOTER_SIZE: usize = 24;
const TRAILER_SIZE: usize = 8;
const MIN_SIZE: usize = HEADER_SIZE + FOOTER_SIZE + TRAILER_SIZE;

/// Root of one stored tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRoot {
    pub tblnum: u16,
    pub root: Address,
    pub levels: u8,
}

/// The persisted state of the index as of one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRoot {
    /// Sorted by table number.
    pub tables: Vec<TableRoot>,
    pub redirects: Option<Address>,
    pub last_commit: Option<Address>,
    /// Length of the data log covered by this root.
    pub data_size: u64,
    pub timestamp: u32,
}

/// Errors decoding an index root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRootError {
    InvalidMagic([u8; 4]),
    UnsupportedVersion(u16),
    Truncated,
    ChecksumMismatch,
    BadAddress { table: u16 },
}

impl fmt::Display for IndexRootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(f, "invalid magic: {:?}", String::from_utf8_lossy(magic))
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::Truncated => write!(f, "truncated index root"),
            Self::ChecksumMismatch => write!(f, "index root checksum mismatch"),
            Self::BadAddress { table } => write!(f, "table {table} has no root address"),
        }
    }
}

impl std::error::Error for IndexRootError {}

impl From<IndexRootError> for StorageError {
    fn from(e: IndexRootError) -> Self {
        Self::Corruption(e.to_string())
    }
}

/// The last index root of a store and where valid data ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundRoot {
    pub adr: Address,
    pub root: IndexRoot,
    /// Offset just past the root.
    pub end: u64,
}

impl IndexRoot {
    #[must_use]
    pub fn table(&self, tblnum: u16) -> Option<&TableRoot> {
        self.tables
            .binary_search_by_key(&tblnum, |t| t.tblnum)
            .ok()
            .map(|i| &self.tables[i])
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + TREE_SIZE * self.tables.len() + FOOTER_SIZE + TRAILER_SIZE
    }

    /// # Panics
    ///
    /// Panics if there are more than 65535 tables.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let size = self.encoded_len();
        let count = u16::try_from(self.tables.len()).unwrap_or_else(|_| {
            panic!("too many tables: {}", self.tables.len());
        });
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf.extend_from_slice(&count.to_be_bytes());
        for t in &self.tables {
            buf.extend_from_slice(&t.tblnum.to_be_bytes());
            buf.push(t.levels);
            buf.push(0);
            buf.extend_from_slice(&t.root.raw().to_be_bytes());
        }
        buf.extend_from_slice(&raw(self.redirects).to_be_bytes());
        buf.extend_from_slice(&raw(self.last_commit).to_be_bytes());
        buf.extend_from_slice(&self.data_size.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&[0; 4]);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)] // bounded by 65535 tables
        let size_word = size as u32;
        buf.extend_from_slice(&size_word.to_be_bytes());
        debug_assert_eq!(buf.len(), size);
        buf
    }

    /// Decode a root occupying exactly `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, IndexRootError> {
        if buf.len() < MIN_SIZE {
            return Err(IndexRootError::Truncated);
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[..4]);
        if magic != MAGIC {
            return Err(IndexRootError::InvalidMagic(magic));
        }
        let version = get_u16(buf, 4).ok_or(IndexRootError::Truncated)?;
        if version != FORMAT_VERSION {
            return Err(IndexRootError::UnsupportedVersion(version));
        }
        let count = usize::from(get_u16(buf, 6).ok_or(IndexRootError::Truncated)?);
        let size = HEADER_SIZE + TREE_SIZE * count + FOOTER_SIZE + TRAILER_SIZE;
        if buf.len() != size || get_u32(buf, size - 4) != u32::try_from(size).ok() {
            return Err(IndexRootError::Truncated);
        }
        let crc = get_u32(buf, size - 8).ok_or(IndexRootError::Truncated)?;
        if crc != crc32fast::hash(&buf[..size - 8]) {
            return Err(IndexRootError::ChecksumMismatch);
        }

        let mut tables = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_SIZE + TREE_SIZE * i;
            let tblnum = get_u16(buf, at).ok_or(IndexRootError::Truncated)?;
            let root = get_u32(buf, at + 4)
                .and_then(Address::from_raw)
                .ok_or(IndexRootError::BadAddress { table: tblnum })?;
            tables.push(TableRoot {
                tblnum,
                root,
                levels: buf[at + 2],
            });
        }
        let at = HEADER_SIZE + TREE_SIZE * count;
        let field = |n: usize| get_u32(buf, at + n).ok_or(IndexRootError::Truncated);
        Ok(Self {
            tables,
            redirects: Address::from_raw(field(0)?),
            last_commit: Address::from_raw(field(4)?),
            data_size: get_u64(buf, at + 8).ok_or(IndexRootError::Truncated)?,
            timestamp: field(16)?,
        })
    }

    /// Append the root to `stor`.
    pub fn write(&self, stor: &Storage) -> Result<Address, StorageError> {
        let bytes = self.encode();
        let adr = stor.alloc(bytes.len() as u64)?;
        stor.write(adr, &bytes)?;
        Ok(adr)
    }

    /// Read the root stored at `adr`.
    pub fn read(stor: &Storage, adr: Address) -> Result<Self, StorageError> {
        let buf = stor.buffer(adr)?;
        let count = usize::from(get_u16(buf, 6).ok_or(IndexRootError::Truncated)?);
        let size = HEADER_SIZE + TREE_SIZE * count + FOOTER_SIZE + TRAILER_SIZE;
        let buf = buf.get(..size).ok_or(IndexRootError::Truncated)?;
        Ok(Self::decode(buf)?)
    }

    /// Find the last valid root by scanning backward from the logical end.
    ///
    /// Anything after the returned root was written by a commit that did not
    /// complete. `None` means the store holds no valid root.
    pub fn find_last(stor: &Storage) -> Result<Option<FoundRoot>, StorageError> {
        let chunk = stor.chunk_size();
        let mut end = stor.end();
        while end >= MIN_SIZE as u64 {
            if let Some(found) = Self::root_ending_at(stor, end, chunk)? {
                return Ok(Some(found));
            }
            end -= 8;
        }
        Ok(None)
    }

    fn root_ending_at(stor: &Storage, end: u64, chunk: u64) -> Result<Option<FoundRoot>, StorageError> {
        let last = Address::from_offset(end - 8);
        let size = u64::from(stor.read_u32(last, 4)?);
        if size < MIN_SIZE as u64 || size > end || size % 8 != 0 {
            return Ok(None);
        }
        let start = end - size;
        if start / chunk != (end - 1) / chunk {
            return Ok(None);
        }
        let adr = Address::from_offset(start);
        #[allow(clippy::cast_possible_truncation)] // below the chunk size
        let bytes = stor.slice(adr, size as usize)?;
        Ok(Self::decode(bytes).ok().map(|root| FoundRoot { adr, root, end }))
    }
}

fn raw(adr: Option<Address>) -> u32 {
    adr.map_or(0, Address::raw)
}
