//! Generic record binary format.
//!
//! ```text
//! [mode u8][count u16][offset 0] .. [offset count][field count-1] .. [field 0]
//! ```
//!
//! `mode` selects the width of the offsets: `'c'` one byte, `'s'` two bytes,
//! `'l'` four bytes, picked as the smallest that can hold the total length.
//! `offset[0]` is the length of the whole record and field `i` occupies
//! `offset[i + 1]..offset[i]`, so fields are packed from the end backward
//! and field 0 is last. All integers are big-endian.

use std::cmp::Ordering;
use std::fmt;

use crate::storage::io::{get_u16, get_u32};

const HEADER: usize = 3;

/// Errors when decoding a record from bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Buffer ends before the record does.
    Truncated { needed: usize, available: usize },
    /// Unknown offset width marker.
    BadMode(u8),
    /// Offsets are not consistent with the header.
    BadOffsets,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "record truncated: need {needed} bytes, have {available}")
            }
            Self::BadMode(m) => write!(f, "bad record mode {m:#04x}"),
            Self::BadOffsets => write!(f, "inconsistent record offsets"),
        }
    }
}

impl std::error::Error for RecordError {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Width {
    Byte,
    Short,
    Long,
}

impl Width {
    const fn for_len(total: usize, count: usize) -> Self {
        let fixed = HEADER + total;
        if fixed + (count + 1) <= 0xFF {
            Self::Byte
        } else if fixed + 2 * (count + 1) <= 0xFFFF {
            Self::Short
        } else {
            Self::Long
        }
    }

    const fn from_mode(mode: u8) -> Option<Self> {
        match mode {
            b'c' => Some(Self::Byte),
            b's' => Some(Self::Short),
            b'l' => Some(Self::Long),
            _ => None,
        }
    }

    const fn mode(self) -> u8 {
        match self {
            Self::Byte => b'c',
            Self::Short => b's',
            Self::Long => b'l',
        }
    }

    const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Long => 4,
        }
    }

    fn read(self, buf: &[u8], at: usize) -> Option<usize> {
        match self {
            Self::Byte => buf.get(at).map(|&b| usize::from(b)),
            Self::Short => get_u16(buf, at).map(usize::from),
            Self::Long => get_u32(buf, at).and_then(|n| usize::try_from(n).ok()),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // width chosen to fit
    fn write(self, buf: &mut Vec<u8>, n: usize) {
        match self {
            Self::Byte => buf.push(n as u8),
            Self::Short => buf.extend_from_slice(&(n as u16).to_be_bytes()),
            Self::Long => buf.extend_from_slice(&(n as u32).to_be_bytes()),
        }
    }
}

/// An encoded record. Always holds a valid encoding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Record {
    buf: Vec<u8>,
}

impl Record {
    /// The record with no fields.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_fields(std::iter::empty::<&[u8]>())
    }

    /// Encode a record from its fields, field 0 first.
    ///
    /// # Panics
    ///
    /// Panics if the record would not fit in 4 GiB or has more than 65535
    /// fields.
    #[must_use]
    pub fn from_fields<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let fields: Vec<F> = fields.into_iter().collect();
        let count = fields.len();
        assert!(count <= usize::from(u16::MAX), "too many fields: {count}");
        let data_len: usize = fields.iter().map(|f| f.as_ref().len()).sum();
        let width = Width::for_len(data_len, count);
        let total = HEADER + width.size() * (count + 1) + data_len;
        assert!(u32::try_from(total).is_ok(), "record too large: {total}");

        let mut buf = Vec::with_capacity(total);
        buf.push(width.mode());
        #[allow(clippy::cast_possible_truncation)] // checked above
        buf.extend_from_slice(&(count as u16).to_be_bytes());
        let mut end = total;
        width.write(&mut buf, end);
        for field in &fields {
            end -= field.as_ref().len();
            width.write(&mut buf, end);
        }
        for field in fields.iter().rev() {
            buf.extend_from_slice(field.as_ref());
        }
        debug_assert_eq!(buf.len(), total);
        Self { buf }
    }

    /// Length of the record encoded at the start of `buf`.
    pub fn encoded_len(buf: &[u8]) -> Result<usize, RecordError> {
        let mode = *buf.first().ok_or(RecordError::Truncated {
            needed: HEADER,
            available: buf.len(),
        })?;
        let width = Width::from_mode(mode).ok_or(RecordError::BadMode(mode))?;
        width.read(buf, HEADER).ok_or(RecordError::Truncated {
            needed: HEADER + width.size(),
            available: buf.len(),
        })
    }

    /// Decode (and copy) the record at the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, RecordError> {
        let len = Self::encoded_len(buf)?;
        let bytes = buf.get(..len).ok_or(RecordError::Truncated {
            needed: len,
            available: buf.len(),
        })?;
        let record = Self {
            buf: bytes.to_vec(),
        };
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<(), RecordError> {
        let count = get_u16(&self.buf, 1).ok_or(RecordError::BadOffsets)?;
        let width = self.width();
        let header = HEADER + width.size() * (usize::from(count) + 1);
        if header > self.buf.len() {
            return Err(RecordError::BadOffsets);
        }
        let mut prev = self.buf.len();
        for i in 0..=usize::from(count) {
            let off = width
                .read(&self.buf, HEADER + i * width.size())
                .ok_or(RecordError::BadOffsets)?;
            if off > prev || off < header {
                return Err(RecordError::BadOffsets);
            }
            prev = off;
        }
        Ok(())
    }

    fn width(&self) -> Width {
        // A Record is only constructed with a valid mode.
        Width::from_mode(self.buf[0]).unwrap_or(Width::Long)
    }

    fn offset(&self, i: usize) -> usize {
        let width = self.width();
        width
            .read(&self.buf, HEADER + i * width.size())
            .unwrap_or(0)
    }

    /// Number of fields.
    #[must_use]
    pub fn count(&self) -> usize {
        get_u16(&self.buf, 1).map_or(0, usize::from)
    }

    /// Field `i`, or an empty slice past the last field.
    #[must_use]
    pub fn field(&self, i: usize) -> &[u8] {
        if i >= self.count() {
            return &[];
        }
        &self.buf[self.offset(i + 1)..self.offset(i)]
    }

    pub fn fields(&self) -> impl Iterator<Item = &[u8]> {
        (0..self.count()).map(|i| self.field(i))
    }

    /// Field `i` as a big-endian `u32`. Empty and absent fields are `None`.
    #[must_use]
    pub fn field_u32(&self, i: usize) -> Option<u32> {
        let f = self.field(i);
        if f.len() == 4 {
            get_u32(f, 0)
        } else {
            None
        }
    }

    /// A record of the first `n` fields.
    #[must_use]
    pub fn prefix(&self, n: usize) -> Self {
        Self::from_fields(self.fields().take(n))
    }

    /// The encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if the record has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::empty()
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fields().cmp(other.fields())
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, field) in self.fields().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "\"{}\"", field.escape_ascii())?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(fields: &[&str]) -> Record {
        Record::from_fields(fields.iter().map(|f| f.as_bytes()))
    }

    #[test]
    fn test_layout() {
        let r = rec(&["ab", "c"]);
        // mode, count, 3 one-byte offsets, then "c" then "ab"
        assert_eq!(r.as_bytes(), &[b'c', 0, 2, 9, 7, 6, b'c', b'a', b'b']);
        assert_eq!(r.field(0), b"ab");
        assert_eq!(r.field(1), b"c");
        assert_eq!(r.field(2), b"");
    }

    #[test]
    fn test_empty_record() {
        let r = Record::empty();
        assert_eq!(r.count(), 0);
        assert!(r.is_empty());
        assert_eq!(r.len(), 4);
        assert_eq!(Record::decode(r.as_bytes()).unwrap(), r);
    }

    #[test]
    fn test_width_selection() {
        let small = Record::from_fields([vec![1u8; 200]]);
        assert_eq!(small.as_bytes()[0], b'c');

        let medium = Record::from_fields([vec![1u8; 300]]);
        assert_eq!(medium.as_bytes()[0], b's');
        assert_eq!(medium.field(0).len(), 300);

        let large = Record::from_fields([vec![2u8; 70_000], vec![3u8; 5]]);
        assert_eq!(large.as_bytes()[0], b'l');
        assert_eq!(large.field(0).len(), 70_000);
        assert_eq!(large.field(1), &[3u8; 5]);
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let r = rec(&["key", "value"]);
        let mut buf = r.as_bytes().to_vec();
        buf.extend_from_slice(&[0xAA; 16]);
        assert_eq!(Record::encoded_len(&buf).unwrap(), r.len());
        assert_eq!(Record::decode(&buf).unwrap(), r);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Record::decode(&[]), Err(RecordError::Truncated {
            needed: 3,
            available: 0
        }));
        assert_eq!(Record::decode(&[b'x', 0, 0, 4]), Err(RecordError::BadMode(b'x')));
        assert!(matches!(
            Record::decode(&[b'c', 0, 1, 9, 2]),
            Err(RecordError::Truncated { .. })
        ));
        // offset[1] points into the header
        assert_eq!(
            Record::decode(&[b'c', 0, 1, 6, 1, 0]),
            Err(RecordError::BadOffsets)
        );
    }

    #[test]
    fn test_ordering_is_field_by_field() {
        assert!(rec(&["a"]) < rec(&["b"]));
        assert!(rec(&["a", "z"]) < rec(&["b"]));
        assert!(rec(&["a"]) < rec(&["a", ""]));
        assert!(rec(&["ab"]) > rec(&["a", "z"]));
        assert!(Record::empty() < rec(&[""]));
        assert_eq!(rec(&["x", "y"]).cmp(&rec(&["x", "y"])), Ordering::Equal);
    }

    #[test]
    fn test_field_u32_and_prefix() {
        let r = Record::from_fields([&b"k"[..], &7u32.to_be_bytes(), &[]]);
        assert_eq!(r.field_u32(1), Some(7));
        assert_eq!(r.field_u32(2), None);
        assert_eq!(r.field_u32(0), None);
        assert_eq!(r.prefix(1), rec(&["k"]));
    }
}
