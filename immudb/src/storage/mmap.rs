//! Chunked, append-only, memory-mapped store.
//!
//! A store is one file viewed as a sequence of fixed-size chunks. Each chunk
//! is mapped read-only the first time it is touched and stays mapped until
//! the store is dropped, so a `&[u8]` handed out by [`Storage::buffer`] is
//! valid for the lifetime of the `Storage`. Writes go through positioned file
//! writes into space previously returned by [`Storage::alloc`]; the shared
//! mapping observes them through the page cache.
//!
//! ## Logical end
//!
//! In read-write mode the file is extended to the end of every chunk that is
//! mapped or allocated into, so the physical length overstates the data. On
//! open the logical end is recovered by scanning backward over trailing zero
//! 8-byte words. Callers must therefore never rely on trailing zeros being
//! preserved: every persisted structure ends with a non-zero word.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use memmap2::{Mmap, MmapOptions};

use crate::storage::address::{ALIGN, Address, MAX_OFFSET, align};
use crate::storage::io::{StorageError, get_u32, get_u64};

/// One mebibyte.
pub const MB: u64 = 1024 * 1024;

/// Default chunk size (64 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * MB;

/// Smallest chunk size accepted by [`Storage::open_with`].
pub const MIN_CHUNK_SIZE: u64 = MB;

/// How a store file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, no allocation or writes.
    ReadOnly,
    /// Created if missing.
    ReadWrite,
}

/// Chunked memory-mapped store.
pub struct Storage {
    path: PathBuf,
    file: File,
    mode: OpenMode,
    chunk_size: u64,
    /// Logical end of the store. Only advanced while `alloc_lock` is held.
    end: AtomicU64,
    alloc_lock: Mutex<()>,
    /// Serializes mapping and file extension.
    map_lock: Mutex<()>,
    chunks: Vec<OnceLock<Mmap>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[allow(clippy::cast_possible_truncation)] // chunk sizes fit in usize on supported targets
const fn to_usize(n: u64) -> usize {
    n as usize
}

impl Storage {
    /// Open a store with the default chunk size.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self, StorageError> {
        Self::open_with(path, mode, DEFAULT_CHUNK_SIZE)
    }

    /// Open a store with an explicit chunk size.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is not a power of two between
    /// [`MIN_CHUNK_SIZE`] and 4 GiB.
    pub fn open_with(path: &Path, mode: OpenMode, chunk_size: u64) -> Result<Self, StorageError> {
        assert!(
            chunk_size.is_power_of_two()
                && (MIN_CHUNK_SIZE..=u64::from(u32::MAX) + 1).contains(&chunk_size),
            "invalid chunk size {chunk_size}"
        );

        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path),
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path),
        }
        .map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let chunk_count = to_usize((MAX_OFFSET + ALIGN).div_ceil(chunk_size));
        let chunks = std::iter::repeat_with(OnceLock::new)
            .take(chunk_count)
            .collect();

        let stor = Self {
            path: path.to_path_buf(),
            file,
            mode,
            chunk_size,
            end: AtomicU64::new(0),
            alloc_lock: Mutex::new(()),
            map_lock: Mutex::new(()),
            chunks,
        };

        let file_len = stor.file.metadata()?.len();
        let end = stor.scan_end(file_len)?;
        stor.end.store(end, Ordering::Release);

        tracing::debug!(
            path = %stor.path.display(),
            file_len,
            end,
            "opened store"
        );
        Ok(stor)
    }

    /// Recover the logical end by skipping trailing zero words.
    fn scan_end(&self, file_len: u64) -> Result<u64, StorageError> {
        if file_len == 0 {
            return Ok(0);
        }
        let mut chunk = (file_len - 1) / self.chunk_size;
        loop {
            let start = chunk * self.chunk_size;
            let map = self.chunk(chunk)?;
            let mut i = to_usize((file_len - start).min(self.chunk_size)).min(map.len());
            while i > 0 {
                let lo = (i - 1) & !(to_usize(ALIGN) - 1);
                if map[lo..i].iter().any(|&b| b != 0) {
                    break;
                }
                i = lo;
            }
            if i > 0 || chunk == 0 {
                return Ok(start + align(i as u64));
            }
            chunk -= 1;
        }
    }

    /// Get the mapping for chunk `index`, mapping it on first use.
    fn chunk(&self, index: u64) -> Result<&Mmap, StorageError> {
        let cell = self
            .chunks
            .get(to_usize(index))
            .ok_or(StorageError::OutOfBounds {
                offset: index * self.chunk_size,
                len: 0,
                end: self.end(),
            })?;
        if let Some(map) = cell.get() {
            return Ok(map);
        }

        let _guard = lock(&self.map_lock);
        if let Some(map) = cell.get() {
            return Ok(map);
        }
        let map = self.map_chunk(index)?;
        Ok(cell.get_or_init(|| map))
    }

    fn map_chunk(&self, index: u64) -> Result<Mmap, StorageError> {
        let start = index * self.chunk_size;
        let len = match self.mode {
            OpenMode::ReadWrite => {
                self.extend_to(start + self.chunk_size)?;
                self.chunk_size
            }
            OpenMode::ReadOnly => {
                let file_len = self.file.metadata()?.len();
                self.chunk_size.min(file_len.saturating_sub(start))
            }
        };
        if len == 0 {
            return Err(StorageError::OutOfBounds {
                offset: start,
                len: 0,
                end: self.end(),
            });
        }

        // SAFETY: Mmap::map is unsafe because the mapped file could be
        // truncated or modified by another process. This is sound because:
        // 1. Store files are owned by a single process.
        // 2. The file is never shrunk while the store is open.
        // 3. The mapping is read-only and lives as long as the Storage, so
        //    every slice handed out by buffer() stays valid.
        #[allow(unsafe_code)]
        let map = unsafe {
            MmapOptions::new()
                .offset(start)
                .len(to_usize(len))
                .map(&self.file)
        }
        .map_err(|source| StorageError::ChunkMap {
            chunk: index,
            source,
        })?;

        tracing::debug!(path = %self.path.display(), chunk = index, len, "mapped chunk");
        Ok(map)
    }

    /// Grow the file to at least `len` bytes (read-write mode only).
    fn extend_to(&self, len: u64) -> Result<(), StorageError> {
        if self.file.metadata()?.len() < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }

    /// Reserve `n` bytes, rounded up to [`ALIGN`].
    ///
    /// If the rest of the current chunk is too small the allocation starts
    /// at the next chunk boundary and the remainder is left as zeros.
    /// Fails with [`StorageError::TooLarge`] if `n` is not smaller than the
    /// chunk size.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn alloc(&self, n: u64) -> Result<Address, StorageError> {
        assert!(n > 0, "zero length allocation");
        if n >= self.chunk_size {
            tracing::warn!(n, chunk_size = self.chunk_size, "allocation exceeds chunk size");
            return Err(StorageError::TooLarge);
        }
        if self.mode == OpenMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        let n = align(n);

        let _guard = lock(&self.alloc_lock);
        let mut offset = self.end.load(Ordering::Acquire);
        let remaining = self.chunk_size - offset % self.chunk_size;
        if n > remaining {
            offset += remaining;
        }
        let new_end = offset + n;
        if new_end > MAX_OFFSET {
            return Err(StorageError::TooLarge);
        }
        if offset % self.chunk_size == 0 {
            let _map_guard = lock(&self.map_lock);
            self.extend_to((offset / self.chunk_size + 1) * self.chunk_size)?;
        }
        self.end.store(new_end, Ordering::Release);
        Ok(Address::from_offset(offset))
    }

    /// Write `bytes` at `adr`. The range must have been allocated.
    pub fn write(&self, adr: Address, bytes: &[u8]) -> Result<(), StorageError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        self.check_range(adr.offset(), bytes.len() as u64)?;
        self.write_at(adr.offset(), bytes)
    }

    /// Overwrite `bytes` at `at` bytes past `adr`. Used to patch a field of
    /// an already written allocation.
    pub fn write_field(&self, adr: Address, at: usize, bytes: &[u8]) -> Result<(), StorageError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        let offset = adr.offset() + at as u64;
        self.check_range(offset, bytes.len() as u64)?;
        self.write_at(offset, bytes)
    }

    #[cfg(unix)]
    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(bytes, offset)?;
        Ok(())
    }

    #[cfg(windows)]
    fn write_at(&self, mut offset: u64, mut bytes: &[u8]) -> Result<(), StorageError> {
        use std::os::windows::fs::FileExt;
        while !bytes.is_empty() {
            let n = self.file.seek_write(bytes, offset)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            bytes = &bytes[n..];
            offset += n as u64;
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), StorageError> {
        let end = self.end();
        let chunk_end = (offset / self.chunk_size + 1) * self.chunk_size;
        if offset + len > end || offset + len > chunk_end {
            return Err(StorageError::OutOfBounds { offset, len, end });
        }
        Ok(())
    }

    /// View from `adr` to the end of its chunk, limited to the logical end.
    pub fn buffer(&self, adr: Address) -> Result<&[u8], StorageError> {
        self.view(adr.offset())
    }

    fn view(&self, offset: u64) -> Result<&[u8], StorageError> {
        let end = self.end();
        if offset >= end {
            return Err(StorageError::OutOfBounds {
                offset,
                len: 0,
                end,
            });
        }
        let index = offset / self.chunk_size;
        let map = self.chunk(index)?;
        let start = to_usize(offset % self.chunk_size);
        let chunk_start = index * self.chunk_size;
        let limit = to_usize((end - chunk_start).min(self.chunk_size)).min(map.len());
        map.get(start..limit).ok_or(StorageError::OutOfBounds {
            offset,
            len: 0,
            end,
        })
    }

    /// Exactly `len` bytes at `adr`.
    pub fn slice(&self, adr: Address, len: usize) -> Result<&[u8], StorageError> {
        let buf = self.buffer(adr)?;
        buf.get(..len).ok_or(StorageError::OutOfBounds {
            offset: adr.offset(),
            len: len as u64,
            end: self.end(),
        })
    }

    /// Big-endian `u32` at `at` bytes past `adr`.
    pub fn read_u32(&self, adr: Address, at: usize) -> Result<u32, StorageError> {
        let buf = self.buffer(adr)?;
        get_u32(buf, at).ok_or(StorageError::OutOfBounds {
            offset: adr.offset() + at as u64,
            len: 4,
            end: self.end(),
        })
    }

    /// Big-endian `u64` at `at` bytes past `adr`.
    pub fn read_u64(&self, adr: Address, at: usize) -> Result<u64, StorageError> {
        let buf = self.buffer(adr)?;
        get_u64(buf, at).ok_or(StorageError::OutOfBounds {
            offset: adr.offset() + at as u64,
            len: 8,
            end: self.end(),
        })
    }

    /// Successive chunk views from `adr` to the logical end.
    #[must_use]
    pub fn iter(&self, adr: Address) -> ChunkIter<'_> {
        ChunkIter {
            stor: self,
            offset: adr.offset(),
        }
    }

    /// Bytes from `adr` to the logical end. Zero or negative means EOF.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // both values are below MAX_OFFSET
    pub fn size_from(&self, adr: Address) -> i64 {
        self.end() as i64 - adr.offset() as i64
    }

    /// Logical size of the store in bytes.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end() == 0
    }

    /// The address of the first byte, if anything has been allocated.
    #[must_use]
    pub fn first(&self) -> Option<Address> {
        (!self.is_empty()).then(|| Address::from_offset(0))
    }

    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Discard everything from `end` to the logical end.
    ///
    /// The discarded bytes are overwritten with zeros so that a later open
    /// recovers the same logical end.
    ///
    /// # Panics
    ///
    /// Panics if `end` is not aligned.
    pub fn truncate_tail(&self, end: u64) -> Result<(), StorageError> {
        const ZEROS: [u8; 64 * 1024] = [0; 64 * 1024];

        assert!(end % ALIGN == 0, "unaligned truncation point {end}");
        if self.mode == OpenMode::ReadOnly {
            return Err(StorageError::ReadOnly);
        }
        let _guard = lock(&self.alloc_lock);
        let current = self.end.load(Ordering::Acquire);
        if end >= current {
            return Ok(());
        }

        let mut offset = end;
        while offset < current {
            let n = (current - offset).min(ZEROS.len() as u64);
            self.write_at(offset, &ZEROS[..to_usize(n)])?;
            offset += n;
        }
        self.end.store(end, Ordering::Release);
        tracing::warn!(
            path = %self.path.display(),
            end,
            discarded = current - end,
            "truncated store tail"
        );
        Ok(())
    }

    /// Flush written data to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        if self.mode == OpenMode::ReadWrite {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("chunk_size", &self.chunk_size)
            .field("end", &self.end())
            .finish_non_exhaustive()
    }
}

/// Iterator over successive chunk views, see [`Storage::iter`].
pub struct ChunkIter<'a> {
    stor: &'a Storage,
    offset: u64,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<&'a [u8], StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.stor.end() {
            return None;
        }
        match self.stor.view(self.offset) {
            Ok(buf) => {
                self.offset += buf.len() as u64;
                Some(Ok(buf))
            }
            Err(e) => {
                self.offset = u64::MAX;
                Some(Err(e))
            }
        }
    }
}
