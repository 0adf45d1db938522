//! Memory-mapped data arena
//!
//! The data file is a flat array of pages with no header; every structural
//! fact about its contents lives in the index file.

use super::block::PAGE_SIZE;
use crate::error::{Error, Result};
use memmap2::{MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fixed-size byte region backed by the data file
///
/// Concurrent access is coordinated by the cache rather than by the arena:
/// the single writer only touches blocks it has just allocated and which no
/// index entry references yet, while readers only touch blocks reachable
/// from the index. Pages are handed back to the allocator exclusively while
/// no reader is active.
pub(crate) struct Arena {
    map: MmapRaw,
    // Keeps the mapping's file handle alive for the lifetime of the arena.
    _file: File,
    path: PathBuf,
}

impl Arena {
    /// Create (or truncate) the data file and preallocate `len` bytes
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        file.set_len(len as u64).map_err(|e| Error::io(path, e))?;
        debug!(path = ?path, len, "Created data arena");
        Self::map(file, path, len)
    }

    /// Map an existing data file, which must hold exactly `len` bytes
    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        let actual = file.metadata().map_err(|e| Error::io(path, e))?.len();
        if actual != len as u64 {
            return Err(Error::Corrupt(format!(
                "data file {} is {} bytes, index expects {}",
                path.display(),
                actual,
                len
            )));
        }
        Self::map(file, path, len)
    }

    fn map(file: File, path: &Path, len: usize) -> Result<Self> {
        debug_assert!(len > 0 && len % PAGE_SIZE == 0);
        // Truncation of the data file by another process is not guarded against.
        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|e| Error::io(path, e))?;
        Ok(Self {
            map,
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy `data` into the arena at `offset`
    ///
    /// # Safety
    ///
    /// The caller must hold the cache write lock and own the destination
    /// range exclusively: no index entry may reference it yet.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len(), "arena write out of bounds");
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len());
    }

    /// Borrow `len` bytes at `offset`
    ///
    /// # Safety
    ///
    /// The range must belong to an object that stays referenced (and thus
    /// unwritten) for the whole lifetime `'a`.
    pub unsafe fn slice<'a>(&'a self, offset: usize, len: usize) -> &'a [u8] {
        assert!(offset + len <= self.len(), "arena read out of bounds");
        std::slice::from_raw_parts(self.map.as_ptr().add(offset), len)
    }

    /// Flush dirty pages of the mapping to the data file
    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(|e| Error::io(&self.path, e))
    }
}
