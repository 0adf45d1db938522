//! Index file format and transacted writes
//!
//! # Format (little-endian)
//!
//! ```text
//! version:u8  max_items:i32  max_size:i64  generation:u8  item_count:i32
//! item_count × {
//!     hash:[u8; 20]  item:i64
//!     [multi-page only] link_count:i32  link_count × page:i32
//! }
//! ```
//!
//! Page links list every page of a multi-page object after its first page,
//! tail page last. The data file carries no header.
//!
//! # Transactions
//!
//! A save writes the complete index to `<index>.tr`, syncs it and renames
//! it over `<index>`. A crash leaves either the previous index or the new
//! one in place, never a mix.

use super::block::PAGE_SIZE;
use super::hash::{ContentHash, HASH_LEN};
use super::item::Item;
use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Newest index format this build reads and the one it writes
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + 4 + 8 + 1 + 4;

/// One persisted object
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SnapshotEntry {
    pub hash: ContentHash,
    pub item: Item,
    /// Pages after the first, tail last; empty for single-page objects
    pub chain: Vec<u32>,
}

/// Complete contents of an index file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub max_items: u32,
    pub max_size: u64,
    pub generation: u8,
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Vec<u8> {
        let links: usize = self.entries.iter().map(|e| e.chain.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + self.entries.len() * (HASH_LEN + 12) + links * 4);

        out.push(FORMAT_VERSION);
        out.extend_from_slice(&(self.max_items as i32).to_le_bytes());
        out.extend_from_slice(&(self.max_size as i64).to_le_bytes());
        out.push(self.generation);
        out.extend_from_slice(&(self.entries.len() as i32).to_le_bytes());

        for entry in &self.entries {
            out.extend_from_slice(entry.hash.as_bytes());
            out.extend_from_slice(&(entry.item.to_raw() as i64).to_le_bytes());
            if entry.item.is_multi_page() {
                out.extend_from_slice(&(entry.chain.len() as i32).to_le_bytes());
                for &page in &entry.chain {
                    out.extend_from_slice(&(page as i32).to_le_bytes());
                }
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);

        let version = reader.u8()?;
        if version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        if version == 0 {
            return Err(Error::Corrupt("index version 0".to_string()));
        }

        let max_items = reader.count("max_items")?;
        let max_size = reader.i64()?;
        if max_size <= 0 {
            return Err(Error::Corrupt(format!("invalid max_size {}", max_size)));
        }
        let generation = reader.u8()?;
        let count = reader.count("item_count")?;
        if count > max_items {
            return Err(Error::Corrupt(format!(
                "{} items exceed capacity {}",
                count, max_items
            )));
        }

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let hash = ContentHash::new(reader.array()?);
            let item = Item::from_raw(reader.i64()? as u64);
            if hash.is_zero() || !item.is_valid() {
                return Err(Error::Corrupt(format!("invalid entry {:?} {:?}", hash, item)));
            }
            if item.tail_size() as usize > PAGE_SIZE {
                return Err(Error::Corrupt(format!("{} has a tail larger than a page", item)));
            }
            let chain = if item.is_multi_page() {
                let links = reader.count("link_count")?;
                (0..links)
                    .map(|_| reader.count("page link"))
                    .collect::<Result<Vec<_>>>()?
            } else {
                Vec::new()
            };
            entries.push(SnapshotEntry { hash, item, chain });
        }

        if !reader.is_empty() {
            return Err(Error::Corrupt(format!(
                "{} trailing bytes after index",
                reader.remaining()
            )));
        }

        Ok(Self {
            max_items,
            max_size: max_size as u64,
            generation,
            entries,
        })
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            Error::Corrupt(format!("index truncated at offset {}", self.pos))
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Non-negative `i32` field
    fn count(&mut self, what: &str) -> Result<u32> {
        let value = i32::from_le_bytes(self.array()?);
        u32::try_from(value).map_err(|_| Error::Corrupt(format!("negative {}: {}", what, value)))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// `path` with `suffix` appended to its file name
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Location of the pending transaction for `index_path`
pub fn transaction_path(index_path: &Path) -> PathBuf {
    with_suffix(index_path, ".tr")
}

/// Atomically replace the index file with `bytes`
pub(crate) fn write_transacted(index_path: &Path, bytes: &[u8]) -> Result<()> {
    let tr_path = transaction_path(index_path);
    {
        let mut file: File = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tr_path)
            .map_err(|e| Error::io(&tr_path, e))?;
        file.write_all(bytes).map_err(|e| Error::io(&tr_path, e))?;
        file.sync_all().map_err(|e| Error::io(&tr_path, e))?;
    }
    std::fs::rename(&tr_path, index_path).map_err(|e| Error::io(index_path, e))?;

    debug!(path = ?index_path, bytes = bytes.len(), "Committed index transaction");
    Ok(())
}

/// Finish or discard a transaction interrupted by a crash
///
/// Returns `true` if a pending transaction was committed.
pub(crate) fn recover_transaction(index_path: &Path) -> Result<bool> {
    let tr_path = transaction_path(index_path);
    if !tr_path.exists() {
        return Ok(false);
    }

    if index_path.exists() {
        // The rename never happened, so the transaction file may be torn.
        warn!(path = ?tr_path, "Discarding incomplete index transaction");
        std::fs::remove_file(&tr_path).map_err(|e| Error::io(&tr_path, e))?;
        return Ok(false);
    }

    info!(path = ?tr_path, "Recovering interrupted index transaction");
    std::fs::rename(&tr_path, index_path).map_err(|e| Error::io(index_path, e))?;
    Ok(true)
}

/// Whether an index (or a recoverable transaction) exists at `index_path`
pub(crate) fn index_exists(index_path: &Path) -> bool {
    index_path.exists() || transaction_path(index_path).exists()
}

/// Recover any pending transaction and parse the index file
pub(crate) fn read_index(index_path: &Path) -> Result<Snapshot> {
    recover_transaction(index_path)?;
    if !index_path.exists() {
        return Err(Error::MissingIndex(index_path.to_path_buf()));
    }
    let bytes = std::fs::read(index_path).map_err(|e| Error::io(index_path, e))?;
    let snapshot = Snapshot::from_bytes(&bytes)?;
    debug!(
        path = ?index_path,
        items = snapshot.entries.len(),
        generation = snapshot.generation,
        "Read index"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gencache_persist_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample() -> Snapshot {
        Snapshot {
            max_items: 100,
            max_size: 1 << 20,
            generation: 7,
            entries: vec![
                SnapshotEntry {
                    hash: ContentHash::compute(b"small"),
                    item: Item::new(3, 7, 1, 5, false),
                    chain: Vec::new(),
                },
                SnapshotEntry {
                    hash: ContentHash::compute(b"large"),
                    item: Item::new(10, 6, 0, 4096, true),
                    chain: vec![11, 12, 4],
                },
            ],
        }
    }

    #[test]
    fn test_snapshot_layout() -> Result<()> {
        let snapshot = sample();
        let bytes = snapshot.to_bytes();
        // header + two entries + link count + three links
        assert_eq!(bytes.len(), HEADER_LEN + 2 * (HASH_LEN + 8) + 4 + 3 * 4);
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 100);
        assert_eq!(bytes[13], 7);

        assert_eq!(Snapshot::from_bytes(&bytes)?, snapshot);
        Ok(())
    }

    #[test]
    fn test_rejects_newer_version() {
        let mut bytes = sample().to_bytes();
        bytes[0] = FORMAT_VERSION + 1;
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(Error::UnsupportedVersion { found, .. }) if found == FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let bytes = sample().to_bytes();
        assert!(matches!(
            Snapshot::from_bytes(&bytes[..bytes.len() - 2]),
            Err(Error::Corrupt(_))
        ));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(Snapshot::from_bytes(&padded), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_rejects_oversized_tail() {
        let mut snapshot = sample();
        snapshot.entries[0].item = Item::new(3, 7, 0, 8000, false);
        assert!(matches!(
            Snapshot::from_bytes(&snapshot.to_bytes()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_transacted_write_and_read() -> Result<()> {
        let dir = temp_dir("write");
        let index = dir.join("cache.idx");

        write_transacted(&index, &sample().to_bytes())?;
        assert!(index.exists());
        assert!(!transaction_path(&index).exists());
        assert_eq!(read_index(&index)?, sample());

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_recovers_pending_transaction() -> Result<()> {
        let dir = temp_dir("recover");
        let index = dir.join("cache.idx");

        // Crash after writing the transaction but before the rename landed
        std::fs::write(transaction_path(&index), sample().to_bytes()).unwrap();
        assert!(index_exists(&index));
        assert_eq!(read_index(&index)?, sample());
        assert!(!transaction_path(&index).exists());

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_discards_torn_transaction() -> Result<()> {
        let dir = temp_dir("torn");
        let index = dir.join("cache.idx");
        write_transacted(&index, &sample().to_bytes())?;
        std::fs::write(transaction_path(&index), b"\x01\x02").unwrap();

        assert_eq!(read_index(&index)?, sample());
        assert!(!transaction_path(&index).exists());

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[test]
    fn test_missing_index() {
        let dir = temp_dir("missing");
        let index = dir.join("cache.idx");
        assert!(!index_exists(&index));
        assert!(matches!(read_index(&index), Err(Error::MissingIndex(_))));
        std::fs::remove_dir_all(dir).ok();
    }
}
