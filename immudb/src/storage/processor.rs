//! Replay of commit segments.
//!
//! [`CommitProcessor`] decodes one segment of the data log and feeds its
//! entries to a [`CommitHandler`]. Recovery, rebuild, dump, check and
//! compaction are all handlers. [`process_log`] walks consecutive segments.

use std::fmt;

use crate::storage::address::Address;
use crate::storage::commit::{
    ADD_HEADER, CommitType, DataRecord, END, END_SIZE, HEAD_SIZE, MAX_TBLNUM, REMOVE,
    TRAILER_SIZE, UPDATE, checksum,
};
use crate::storage::io::{StorageError, get_u16, get_u32};
use crate::storage::mmap::Storage;

/// Errors while decoding the log.
#[derive(Debug)]
pub enum ProcessError {
    /// A segment is malformed.
    Corruption { adr: Address, msg: String },
    Storage(StorageError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corruption { adr, msg } => write!(f, "corrupt commit at {adr}: {msg}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Corruption { .. } => None,
            Self::Storage(e) => Some(e),
        }
    }
}

impl From<StorageError> for ProcessError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Receives the contents of a committed segment.
///
/// Every hook defaults to doing nothing. Hooks are only called for commits
/// with a non-zero timestamp and a valid checksum.
#[allow(unused_variables)]
pub trait CommitHandler {
    type Error: From<ProcessError>;

    fn on_timestamp(&mut self, commit: Address, timestamp: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_type(&mut self, kind: CommitType) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_add(&mut self, adr: Address, rec: DataRecord) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_update(
        &mut self,
        from_adr: Address,
        from: DataRecord,
        to_adr: Address,
        to: DataRecord,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_remove(&mut self, adr: Address, rec: DataRecord) -> Result<(), Self::Error> {
        Ok(())
    }

    fn on_after(&mut self, commit: Address, size: u32) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// What [`CommitProcessor::process`] found at its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Nothing there: end of the store or a zero size word.
    End,
    /// An incomplete segment at the tail of the store.
    Truncated,
    /// A complete segment with a zero timestamp. Nothing was reported.
    Aborted { size: u32 },
    Committed { size: u32 },
}

/// Decodes the segment at one address.
#[derive(Debug, Clone, Copy)]
pub struct CommitProcessor<'a> {
    stor: &'a Storage,
    adr: Address,
}

impl<'a> CommitProcessor<'a> {
    #[must_use]
    pub const fn new(stor: &'a Storage, adr: Address) -> Self {
        Self { stor, adr }
    }

    fn corrupt(&self, msg: impl Into<String>) -> ProcessError {
        ProcessError::Corruption {
            adr: self.adr,
            msg: msg.into(),
        }
    }

    pub fn process<H: CommitHandler>(&self, handler: &mut H) -> Result<Segment, H::Error> {
        let remaining = self.stor.size_from(self.adr);
        if remaining <= 0 {
            return Ok(Segment::End);
        }
        #[allow(clippy::cast_possible_wrap)] // HEAD_SIZE is 16
        let head = HEAD_SIZE as i64;
        if remaining < head {
            return Ok(Segment::Truncated);
        }
        let buf = self.stor.buffer(self.adr).map_err(ProcessError::from)?;
        let size = get_u32(buf, 0).ok_or_else(|| self.corrupt("missing size"))?;
        if size == 0 {
            return Ok(Segment::End);
        }
        if i64::from(size) > remaining {
            return Ok(Segment::Truncated);
        }
        let len = size as usize;
        if len < HEAD_SIZE + END_SIZE + TRAILER_SIZE || len % 8 != 0 {
            return Err(self.corrupt(format!("bad size {size}")).into());
        }
        let seg = buf
            .get(..len)
            .ok_or_else(|| self.corrupt(format!("size {size} crosses chunk boundary")))?;

        if !trailer_valid(seg, size) {
            // A damaged final segment is a torn write, anything earlier is not.
            if self.adr.offset() + u64::from(size) >= self.stor.end() {
                tracing::warn!(adr = %self.adr, size, "damaged commit at tail of log");
                return Ok(Segment::Truncated);
            }
            return Err(self.corrupt("checksum mismatch").into());
        }

        let timestamp = get_u32(seg, 4).ok_or_else(|| self.corrupt("missing timestamp"))?;
        if timestamp == 0 {
            return Ok(Segment::Aborted { size });
        }
        let kind =
            CommitType::from_tag(seg[8]).ok_or_else(|| self.corrupt("unknown commit type"))?;
        handler.on_timestamp(self.adr, timestamp)?;
        handler.on_type(kind)?;

        self.entries(seg, handler)?;
        handler.on_after(self.adr, size)?;
        Ok(Segment::Committed { size })
    }

    fn entries<H: CommitHandler>(&self, seg: &[u8], handler: &mut H) -> Result<(), H::Error> {
        let body_end = seg.len() - TRAILER_SIZE;
        let mut pos = HEAD_SIZE;
        let mut pending_from: Option<(Address, DataRecord)> = None;
        loop {
            if pos >= body_end {
                return Err(self.corrupt("missing END").into());
            }
            let tag = get_u16(seg, pos).ok_or_else(|| self.corrupt("truncated entry"))?;
            match tag {
                END => {
                    if pos + END_SIZE != body_end {
                        return Err(self.corrupt("END not at declared size").into());
                    }
                    if pending_from.is_some() {
                        return Err(self.corrupt("UPDATE without new record").into());
                    }
                    return Ok(());
                }
                REMOVE | UPDATE => {
                    if pending_from.is_some() {
                        return Err(self.corrupt("UPDATE without new record").into());
                    }
                    let raw = get_u32(seg, pos + 4).ok_or_else(|| self.corrupt("truncated entry"))?;
                    let adr = Address::from_raw(raw)
                        .ok_or_else(|| self.corrupt("entry with zero address"))?;
                    let rec = DataRecord::read(self.stor, adr).map_err(ProcessError::from)?;
                    if tag == REMOVE {
                        handler.on_remove(adr, rec)?;
                    } else {
                        pending_from = Some((adr, rec));
                    }
                    pos += 8;
                }
                1..=MAX_TBLNUM => {
                    let reclen =
                        get_u32(seg, pos + 4).ok_or_else(|| self.corrupt("truncated entry"))?;
                    let entry_end = (pos + ADD_HEADER)
                        .checked_add(reclen as usize)
                        .map(|n| n.next_multiple_of(8))
                        .filter(|&n| n + END_SIZE <= body_end)
                        .ok_or_else(|| self.corrupt("entry overruns segment"))?;
                    let adr = self.adr.advance(pos as u64);
                    let rec = DataRecord::decode(&seg[pos..entry_end], adr)
                        .map_err(|e| self.corrupt(e.to_string()))?;
                    match pending_from.take() {
                        Some((from_adr, from)) => handler.on_update(from_adr, from, adr, rec)?,
                        None => handler.on_add(adr, rec)?,
                    }
                    pos = entry_end;
                }
                _ => return Err(self.corrupt(format!("malformed tag {tag:#06x}")).into()),
            }
        }
    }
}

fn trailer_valid(seg: &[u8], size: u32) -> bool {
    let n = seg.len();
    get_u32(seg, n - 4) == Some(size) && get_u32(seg, n - 8) == Some(checksum(seg))
}

/// Outcome of [`process_log`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSummary {
    pub committed: usize,
    pub aborted: usize,
    /// The last committed segment.
    pub last_commit: Option<Address>,
    /// Offset just past the last complete segment.
    pub end: u64,
    /// True if the walk stopped at an incomplete segment before `until`.
    pub truncated: bool,
}

/// Offset of the first non-zero byte in `from..to`, which lie in one chunk.
fn first_nonzero(stor: &Storage, from: u64, to: u64) -> Result<Option<u64>, StorageError> {
    let buf = stor.buffer(Address::from_offset(from))?;
    let len = usize::try_from(to - from).map_or(buf.len(), |n| n.min(buf.len()));
    Ok(buf[..len]
        .iter()
        .position(|&b| b != 0)
        .map(|i| from + i as u64))
}

/// Process every segment from offset `from` up to offset `until`.
///
/// A zero size word inside a chunk starts the unused remainder left when an
/// allocation skipped to the next chunk. The rest of the chunk must be
/// zero; the walk then continues at the next chunk, or ends as truncated if
/// nothing follows.
pub fn process_log<H: CommitHandler>(
    stor: &Storage,
    from: u64,
    until: u64,
    handler: &mut H,
) -> Result<LogSummary, H::Error> {
    let until = until.min(stor.end());
    let chunk = stor.chunk_size();
    let mut summary = LogSummary {
        end: from,
        ..LogSummary::default()
    };
    let mut pos = from;
    while pos < until {
        let adr = Address::from_offset(pos);
        match CommitProcessor::new(stor, adr).process(handler)? {
            Segment::Committed { size } => {
                summary.committed += 1;
                summary.last_commit = Some(adr);
                pos += u64::from(size);
                summary.end = pos;
            }
            Segment::Aborted { size } => {
                tracing::debug!(%adr, size, "skipping aborted commit");
                summary.aborted += 1;
                pos += u64::from(size);
                summary.end = pos;
            }
            Segment::End => {
                let next = (pos / chunk + 1) * chunk;
                let gap = first_nonzero(stor, pos, next.min(until)).map_err(ProcessError::from)?;
                if let Some(at) = gap {
                    return Err(ProcessError::Corruption {
                        adr,
                        msg: format!("data at offset {at} after a zero size word"),
                    }
                    .into());
                }
                if next >= until {
                    summary.truncated = true;
                    break;
                }
                if pos % chunk == 0 {
                    return Err(ProcessError::Corruption {
                        adr,
                        msg: "empty chunk before the end of the log".to_string(),
                    }
                    .into());
                }
                pos = next;
            }
            Segment::Truncated => {
                summary.truncated = true;
                break;
            }
        }
    }
    Ok(summary)
}
