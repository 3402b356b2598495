//! Commit segments in the data log.
//!
//! Each committed transaction appends one self-describing segment:
//!
//! ```text
//! Head (16 bytes):
//!   size: u32       total segment length, multiple of 8
//!   timestamp: u32  seconds; 0 while incomplete or if aborted
//!   type: u8        'u' update, 's' schema, 'b' bulk load
//!   pad: [u8; 7]
//!
//! Entries, each 8-aligned, tagged by their first u16:
//!   REMOVE  0xFFFF, pad u16, adr u32
//!   UPDATE  0xFFFE, pad u16, from u32, then an add entry
//!   add     tblnum u16 (1..=0x7FFF), pad u16, reclen u32, record, zero pad
//!   END     0x0000, 6 pad bytes
//!
//! Trailer (8 bytes):
//!   checksum: u32   CRC32 of bytes [8, size - 8)
//!   size: u32       repeated
//! ```
//!
//! A data record's address is the start of its add entry. The segment is
//! written with a zero timestamp and the timestamp is filled in last, so a
//! commit torn by a crash reads as aborted.

use crate::storage::address::{Address, align};
use crate::storage::io::{StorageError, get_u16, get_u32, pad_to_align};
use crate::storage::mmap::Storage;
use crate::storage::record::Record;

/// Segment head length.
pub const HEAD_SIZE: usize = 16;
/// Segment trailer length.
pub const TRAILER_SIZE: usize = 8;
/// END entry length.
pub const END_SIZE: usize = 8;
/// Add entry header length (before the record bytes).
pub const ADD_HEADER: usize = 8;

pub const END: u16 = 0x0000;
pub const UPDATE: u16 = 0xFFFE;
pub const REMOVE: u16 = 0xFFFF;
/// Largest table number; larger tags are reserved.
pub const MAX_TBLNUM: u16 = 0x7FFF;

/// Which kind of transaction produced a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitType {
    Update,
    Schema,
    Bulk,
}

impl CommitType {
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Update => b'u',
            Self::Schema => b's',
            Self::Bulk => b'b',
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'u' => Some(Self::Update),
            b's' => Some(Self::Schema),
            b'b' => Some(Self::Bulk),
            _ => None,
        }
    }
}

/// A data record as stored in an add entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub tblnum: u16,
    pub record: Record,
}

impl DataRecord {
    #[must_use]
    pub const fn new(tblnum: u16, record: Record) -> Self {
        Self { tblnum, record }
    }

    /// Decode the add entry at the start of `buf`.
    pub fn decode(buf: &[u8], adr: Address) -> Result<Self, StorageError> {
        let corrupt = |msg: &str| StorageError::Corruption(format!("data record at {adr}: {msg}"));
        let tblnum = get_u16(buf, 0).ok_or_else(|| corrupt("truncated header"))?;
        if tblnum == END || tblnum > MAX_TBLNUM {
            return Err(corrupt("not an add entry"));
        }
        let len = get_u32(buf, 4).ok_or_else(|| corrupt("truncated header"))? as usize;
        let bytes = buf
            .get(ADD_HEADER..ADD_HEADER + len)
            .ok_or_else(|| corrupt("record overruns buffer"))?;
        let record = Record::decode(bytes).map_err(|e| corrupt(&e.to_string()))?;
        if record.len() != len {
            return Err(corrupt("record length mismatch"));
        }
        Ok(Self { tblnum, record })
    }

    /// Read the data record stored at `adr`.
    pub fn read(stor: &Storage, adr: Address) -> Result<Self, StorageError> {
        Self::decode(stor.buffer(adr)?, adr)
    }

    /// Aligned length of the add entry.
    #[must_use]
    pub fn stor_size(&self) -> usize {
        entry_size(&self.record)
    }
}

#[allow(clippy::cast_possible_truncation)] // ALIGN is 8
fn entry_size(record: &Record) -> usize {
    align((ADD_HEADER + record.len()) as u64) as usize
}

/// Checksum of a complete segment.
#[must_use]
pub fn checksum(segment: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&segment[8..segment.len() - TRAILER_SIZE]);
    hasher.finalize()
}

/// Lays out a commit segment.
#[derive(Debug)]
pub struct CommitBuilder {
    kind: CommitType,
    buf: Vec<u8>,
    entries: usize,
}

/// Handle for an add entry, resolved to an address once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOffset(usize);

impl CommitBuilder {
    #[must_use]
    pub fn new(kind: CommitType) -> Self {
        let mut buf = vec![0u8; HEAD_SIZE];
        buf[8] = kind.tag();
        Self {
            kind,
            buf,
            entries: 0,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CommitType {
        self.kind
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Segment length once finished.
    #[must_use]
    pub fn size(&self) -> usize {
        self.buf.len() + END_SIZE + TRAILER_SIZE
    }

    pub fn remove(&mut self, adr: Address) {
        self.tagged(REMOVE, adr);
    }

    /// # Panics
    ///
    /// Panics if `tblnum` is not a valid table number.
    pub fn add(&mut self, tblnum: u16, record: &Record) -> EntryOffset {
        assert!(
            (1..=MAX_TBLNUM).contains(&tblnum),
            "invalid table number {tblnum}"
        );
        let at = self.buf.len();
        self.buf.extend_from_slice(&tblnum.to_be_bytes());
        self.buf.extend_from_slice(&[0, 0]);
        #[allow(clippy::cast_possible_truncation)] // records are below 4 GiB
        let len = record.len() as u32;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(record.as_bytes());
        pad_to_align(&mut self.buf);
        self.entries += 1;
        EntryOffset(at)
    }

    pub fn update(&mut self, from: Address, tblnum: u16, record: &Record) -> EntryOffset {
        self.tagged(UPDATE, from);
        self.add(tblnum, record)
    }

    fn tagged(&mut self, tag: u16, adr: Address) {
        self.buf.extend_from_slice(&tag.to_be_bytes());
        self.buf.extend_from_slice(&[0, 0]);
        self.buf.extend_from_slice(&adr.raw().to_be_bytes());
        self.entries += 1;
    }

    /// Complete the segment bytes with a zero timestamp.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&[0u8; END_SIZE]);
        let size = self.buf.len() + TRAILER_SIZE;
        #[allow(clippy::cast_possible_truncation)] // bounded by the chunk size
        let size_bytes = (size as u32).to_be_bytes();
        self.buf[0..4].copy_from_slice(&size_bytes);
        self.buf.extend_from_slice(&[0u8; TRAILER_SIZE]);
        let crc = checksum(&self.buf);
        self.buf[size - 8..size - 4].copy_from_slice(&crc.to_be_bytes());
        self.buf[size - 4..].copy_from_slice(&size_bytes);
        self.buf
    }

    /// Allocate and write the segment with a zero timestamp.
    ///
    /// Fails with [`StorageError::TooLarge`] if the segment cannot fit in a
    /// chunk.
    pub fn write(self, stor: &Storage) -> Result<WrittenCommit, StorageError> {
        let bytes = self.finish();
        if bytes.len() as u64 >= stor.chunk_size() {
            return Err(StorageError::TooLarge);
        }
        let adr = stor.alloc(bytes.len() as u64)?;
        stor.write(adr, &bytes)?;
        Ok(WrittenCommit {
            adr,
            size: bytes.len(),
        })
    }
}

/// A segment written to the log but not yet timestamped.
#[derive(Debug, Clone, Copy)]
pub struct WrittenCommit {
    pub adr: Address,
    pub size: usize,
}

impl WrittenCommit {
    /// The address of the data record added by `entry`.
    #[must_use]
    pub fn record_adr(&self, entry: EntryOffset) -> Address {
        self.adr.advance(entry.0 as u64)
    }

    /// Write the timestamp, making the commit visible to replay.
    ///
    /// # Panics
    ///
    /// Panics if `timestamp` is zero.
    pub fn finish(&self, stor: &Storage, timestamp: u32) -> Result<(), StorageError> {
        assert!(timestamp != 0, "zero commit timestamp");
        stor.write_field(self.adr, 4, &timestamp.to_be_bytes())
    }
}
