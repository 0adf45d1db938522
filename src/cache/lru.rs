//! Generational LRU cache over the arena
//!
//! Combines Arena + PageAllocator + HashIndex + index persistence.
//! This is the integration layer that provides the public API.
//!
//! # Locking
//!
//! - `add`, `trim` and the snapshot half of `save` run under one mutex.
//! - `View::get` never takes that mutex; opening and closing a view takes it
//!   briefly to maintain the reader count.
//! - `trim` refuses to run while any view is open.

use super::allocator::{block_offset, page_offset, PageAllocator, PageLinks};
use super::arena::Arena;
use super::block::{full_pages_for_len, BlockClass, PAGE_SIZE};
use super::hash::ContentHash;
use super::index::HashIndex;
use super::item::{Item, MAX_PAGES};
use super::persist::{self, Snapshot, SnapshotEntry};
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const NUM_GENERATIONS: usize = 256;

struct Inner {
    allocator: PageAllocator,
    readers: usize,
}

/// Fixed-capacity, disk-backed, content-addressed object cache
///
/// Objects are immutable once added and leave the cache only through
/// [`LruCache::trim`], which evicts whole generations, oldest first.
pub struct LruCache {
    index_path: PathBuf,
    data_path: PathBuf,
    max_items: usize,
    max_size: u64,
    arena: Arena,
    index: HashIndex,
    links: Arc<PageLinks>,
    generation: AtomicU8,
    /// Payload bytes attributed to each generation
    generation_bytes: Box<[AtomicI64]>,
    generation_limit: i64,
    inner: Mutex<Inner>,
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for LruCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("index_path", &self.index_path)
            .field("data_path", &self.data_path)
            .field("max_items", &self.max_items)
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub num_items: usize,
    pub max_items: usize,
    pub num_bytes: u64,
    pub num_bytes_with_block_slack: u64,
    pub num_bytes_with_page_slack: u64,
    pub num_free_pages: usize,
    pub max_size: u64,
    pub generation: u8,
}

/// Round `max_size` down to whole pages and check it is addressable
fn arena_len(max_size: u64) -> Result<usize> {
    let pages = max_size / PAGE_SIZE as u64;
    if pages == 0 {
        return Err(Error::InvalidArgument(format!(
            "max_size {} is smaller than one page ({} bytes)",
            max_size, PAGE_SIZE
        )));
    }
    if pages >= MAX_PAGES {
        return Err(Error::InvalidArgument(format!(
            "max_size {} exceeds {} pages",
            max_size, MAX_PAGES
        )));
    }
    usize::try_from(pages * PAGE_SIZE as u64)
        .map_err(|_| Error::InvalidArgument(format!("max_size {} is not addressable", max_size)))
}

fn check_max_items(max_items: usize) -> Result<()> {
    if max_items == 0 || max_items > i32::MAX as usize {
        return Err(Error::InvalidArgument(format!(
            "max_items must be in 1..={}, got {}",
            i32::MAX,
            max_items
        )));
    }
    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Stored length of an object from its item and page chain
fn object_len(item: Item, chain: &[u32]) -> u64 {
    chain.len() as u64 * PAGE_SIZE as u64 + item.tail_size() as u64
}

impl LruCache {
    /// Create an empty cache, truncating any existing index and data files
    ///
    /// `max_size` is rounded down to a whole number of pages.
    pub fn create_new<P: AsRef<Path>, Q: AsRef<Path>>(
        index_path: P,
        data_path: Q,
        max_items: usize,
        max_size: u64,
    ) -> Result<Self> {
        let index_path = index_path.as_ref();
        let data_path = data_path.as_ref();
        check_max_items(max_items)?;
        let len = arena_len(max_size)?;

        create_parent_dir(index_path)?;
        create_parent_dir(data_path)?;
        let tr_path = persist::transaction_path(index_path);
        if tr_path.exists() {
            std::fs::remove_file(&tr_path).map_err(|e| Error::io(&tr_path, e))?;
        }

        let arena = Arena::create(data_path, len)?;
        let num_pages = (len / PAGE_SIZE) as u32;
        let links = Arc::new(PageLinks::new(num_pages));
        let allocator = PageAllocator::new(num_pages, Arc::clone(&links));

        let cache = Self::assemble(
            index_path,
            arena,
            links,
            allocator,
            HashIndex::new(max_items),
            0,
        );
        cache.save()?;

        info!(
            index = ?index_path,
            data = ?data_path,
            max_items,
            max_size = len,
            "Created cache"
        );
        Ok(cache)
    }

    /// Open an existing cache, completing an interrupted save if one is pending
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(index_path: P, data_path: Q) -> Result<Self> {
        let index_path = index_path.as_ref();
        let data_path = data_path.as_ref();

        let snapshot = persist::read_index(index_path)?;
        let len = arena_len(snapshot.max_size)?;
        if len as u64 != snapshot.max_size {
            return Err(Error::Corrupt(format!(
                "max_size {} is not a whole number of pages",
                snapshot.max_size
            )));
        }
        let max_items = snapshot.max_items as usize;
        check_max_items(max_items).map_err(|e| Error::Corrupt(e.to_string()))?;

        let arena = Arena::open(data_path, len)?;
        let num_pages = (len / PAGE_SIZE) as u32;
        let links = Arc::new(PageLinks::new(num_pages));
        let allocator = PageAllocator::restore(
            num_pages,
            Arc::clone(&links),
            snapshot
                .entries
                .iter()
                .map(|entry| (entry.item, entry.chain.as_slice())),
        )?;

        let index = HashIndex::new(max_items);
        for entry in &snapshot.entries {
            if !index.insert(&entry.hash, entry.item) {
                return Err(Error::Corrupt(format!("duplicate entry for {}", entry.hash)));
            }
        }

        let cache = Self::assemble(index_path, arena, links, allocator, index, snapshot.generation);
        for entry in &snapshot.entries {
            cache.generation_bytes[entry.item.generation() as usize]
                .fetch_add(object_len(entry.item, &entry.chain) as i64, Ordering::Relaxed);
        }
        cache.publish_gauges(&cache.inner.lock());

        info!(
            index = ?index_path,
            data = ?data_path,
            items = snapshot.entries.len(),
            generation = snapshot.generation,
            "Opened cache"
        );
        Ok(cache)
    }

    /// Open the cache, migrating it if its capacity differs from the requested one
    ///
    /// A missing cache is created. A cache with different `max_items` or
    /// `max_size` is copied object by object into a freshly created cache,
    /// most recent generations first, which then replaces the original files.
    /// Copied objects keep their generations, so recency survives the move.
    pub fn open_and_modify<P: AsRef<Path>, Q: AsRef<Path>>(
        index_path: P,
        data_path: Q,
        max_items: usize,
        max_size: u64,
    ) -> Result<Self> {
        let index_path = index_path.as_ref();
        let data_path = data_path.as_ref();
        check_max_items(max_items)?;
        let len = arena_len(max_size)? as u64;

        if !persist::index_exists(index_path) {
            return Self::create_new(index_path, data_path, max_items, max_size);
        }

        let existing = Self::open(index_path, data_path)?;
        if existing.max_items == max_items && existing.max_size == len {
            return Ok(existing);
        }

        info!(
            from_items = existing.max_items,
            from_size = existing.max_size,
            to_items = max_items,
            to_size = len,
            "Resizing cache"
        );

        let new_index = persist::with_suffix(index_path, ".new");
        let new_data = persist::with_suffix(data_path, ".new");
        let (copied, total) = {
            let resized = Self::create_new(&new_index, &new_data, max_items, max_size)?;

            let current = existing.generation();
            let mut entries = existing.index.entries();
            entries.sort_by_key(|(_, item)| current.wrapping_sub(item.generation()));

            // Newest first so the most recent objects win when capacity shrinks
            let view = existing.lock_view();
            let mut copied = Vec::with_capacity(entries.len());
            for (hash, item) in &entries {
                if let Some(data) = view.get(hash) {
                    if resized.add(hash, &data) {
                        copied.push((*hash, item.generation()));
                    }
                }
            }
            drop(view);
            resized.adopt_generations(current, &copied);
            resized.save()?;
            let copied = copied.len();
            (copied, entries.len())
        };
        drop(existing);

        replace_file(index_path, &new_index)?;
        replace_file(data_path, &new_data)?;

        info!(copied, dropped = total - copied, "Resize complete");
        Self::open(index_path, data_path)
    }

    fn assemble(
        index_path: &Path,
        arena: Arena,
        links: Arc<PageLinks>,
        allocator: PageAllocator,
        index: HashIndex,
        generation: u8,
    ) -> Self {
        let max_size = arena.len() as u64;
        Self {
            index_path: index_path.to_path_buf(),
            data_path: arena.path().to_path_buf(),
            max_items: index.capacity(),
            max_size,
            arena,
            index,
            links,
            generation: AtomicU8::new(generation),
            generation_bytes: (0..NUM_GENERATIONS).map(|_| AtomicI64::new(0)).collect(),
            generation_limit: (max_size / NUM_GENERATIONS as u64) as i64,
            inner: Mutex::new(Inner {
                allocator,
                readers: 0,
            }),
            save_lock: Mutex::new(()),
        }
    }

    /// Move copied objects back onto the generations they had in their source cache
    fn adopt_generations(&self, generation: u8, entries: &[(ContentHash, u8)]) {
        let inner = self.inner.lock();
        for (hash, source_generation) in entries {
            if let Some((slot, item)) = self.index.find(hash) {
                self.index
                    .compare_exchange(slot, item, item.with_generation(*source_generation));
            }
        }

        for tally in self.generation_bytes.iter() {
            tally.store(0, Ordering::Relaxed);
        }
        for (_, item) in self.index.entries() {
            let len = object_len(item, &inner.allocator.chain(item));
            self.generation_bytes[item.generation() as usize].fetch_add(len as i64, Ordering::Relaxed);
        }
        self.generation.store(generation, Ordering::Relaxed);
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Current generation
    pub fn generation(&self) -> u8 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.index.find(hash).is_some()
    }

    /// Store `data` under `hash`
    ///
    /// Best-effort: returns `false` and changes nothing if the hash is
    /// already present, the index is full, or the arena lacks space.
    pub fn add(&self, hash: &ContentHash, data: &[u8]) -> bool {
        if hash.is_zero() {
            return false;
        }

        let mut inner = self.inner.lock();
        if self.index.is_full() || self.index.find(hash).is_some() || !inner.allocator.can_fit(data.len()) {
            metrics::ADD_REJECTED.inc();
            debug!(%hash, len = data.len(), "Add skipped");
            return false;
        }

        let full_pages = full_pages_for_len(data.len());
        let (body, tail) = data.split_at(full_pages * PAGE_SIZE);

        let Some(block) = inner.allocator.alloc_block(tail.len()) else {
            metrics::ADD_REJECTED.inc();
            return false;
        };
        let Some(first) = inner.allocator.alloc_pages(full_pages, block.page) else {
            inner
                .allocator
                .release(Item::new(block.page, 0, block.index, tail.len() as u16, false));
            metrics::ADD_REJECTED.inc();
            return false;
        };

        // SAFETY: the block and pages were just allocated under the lock and
        // are not referenced by the index until the insert below.
        unsafe {
            self.arena.write(block.offset(), tail);
            let mut page = first;
            for chunk in body.chunks_exact(PAGE_SIZE) {
                self.arena.write(page_offset(page), chunk);
                if let Some(next) = self.links.next(page) {
                    page = next;
                }
            }
        }

        let generation = self.generation();
        let item = Item::new(first, generation, block.index, tail.len() as u16, full_pages > 0);
        let inserted = self.index.insert(hash, item);
        debug_assert!(inserted, "index rejected {} after capacity check", hash);

        self.account(generation, data.len() as i64);
        metrics::ADDS.inc();
        self.publish_gauges(&inner);
        debug!(%hash, len = data.len(), %item, "Added object");
        true
    }

    /// Open a read lease; [`LruCache::trim`] fails while any lease is open
    pub fn lock_view(&self) -> View<'_> {
        self.inner.lock().readers += 1;
        View { cache: self }
    }

    /// Start a new generation
    ///
    /// Everything added or read afterwards is considered more recent than
    /// anything before.
    pub fn next_generation(&self) {
        let previous = self.generation.fetch_add(1, Ordering::Relaxed);
        debug!(generation = previous.wrapping_add(1), "Advanced generation");
    }

    fn account(&self, generation: u8, bytes: i64) {
        let total = self.generation_bytes[generation as usize].fetch_add(bytes, Ordering::Relaxed) + bytes;
        if total > self.generation_limit {
            // Two threads may both see the overflow; only one advances.
            let _ = self.generation.compare_exchange(
                generation,
                generation.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }

    fn read_object(&self, item: Item) -> Cow<'_, [u8]> {
        let tail_size = item.tail_size() as usize;
        let class = BlockClass::for_len(tail_size);

        // SAFETY: callers hold a View, so no trim can release these pages,
        // and published objects are never written again.
        unsafe {
            if !item.is_multi_page() {
                let offset = block_offset(item.page(), item.tail_index(), class);
                return Cow::Borrowed(self.arena.slice(offset, tail_size));
            }

            let mut data = Vec::new();
            let mut page = item.page();
            while let Some(next) = self.links.next(page) {
                data.extend_from_slice(self.arena.slice(page_offset(page), PAGE_SIZE));
                page = next;
            }
            let offset = block_offset(page, item.tail_index(), class);
            data.extend_from_slice(self.arena.slice(offset, tail_size));
            Cow::Owned(data)
        }
    }

    /// Move an object to the current generation without taking the lock
    fn touch(&self, hash: &ContentHash, mut slot: usize, mut item: Item, len: usize) {
        let current = self.generation();
        loop {
            if item.generation() == current {
                return;
            }
            if self.index.compare_exchange(slot, item, item.with_generation(current)) {
                self.generation_bytes[item.generation() as usize].fetch_sub(len as i64, Ordering::Relaxed);
                self.account(current, len as i64);
                return;
            }
            // The entry moved or was refreshed by another reader
            match self.index.find(hash) {
                Some((new_slot, new_item)) => {
                    slot = new_slot;
                    item = new_item;
                }
                None => return,
            }
        }
    }

    /// Evict the oldest generations until at most `target_size` bytes remain
    ///
    /// Returns `Ok(false)` without changing anything if a [`View`] is open.
    /// The pruned index is persisted before any page is released.
    #[instrument(skip(self))]
    pub fn trim(&self, target_size: u64) -> Result<bool> {
        let _save = self.save_lock.lock();
        let mut inner = self.inner.lock();
        if inner.readers > 0 {
            metrics::TRIM_REFUSED.inc();
            warn!(readers = inner.readers, "Trim refused while views are open");
            return Ok(false);
        }

        let current = self.generation();
        let mut kept_bytes = 0u64;
        let mut window = 0usize;
        while window < NUM_GENERATIONS {
            let generation = current.wrapping_sub(window as u8);
            let bytes = self.generation_bytes[generation as usize].load(Ordering::Relaxed).max(0) as u64;
            if kept_bytes + bytes > target_size {
                break;
            }
            kept_bytes += bytes;
            window += 1;
        }

        let removed = self
            .index
            .retain(|_, item| (current.wrapping_sub(item.generation()) as usize) < window);
        for age in window..NUM_GENERATIONS {
            self.generation_bytes[current.wrapping_sub(age as u8) as usize].store(0, Ordering::Relaxed);
        }

        let snapshot = self.snapshot(&inner);
        self.arena.flush()?;
        if let Err(e) = persist::write_transacted(&self.index_path, &snapshot.to_bytes()) {
            // The on-disk index still references the evicted objects, so their
            // pages stay allocated until the cache is reopened.
            warn!(error = %e, evicted = removed.len(), "Trim could not persist index");
            return Err(e);
        }

        for (_, item) in &removed {
            inner.allocator.release(*item);
        }

        metrics::EVICTIONS.inc_by(removed.len() as u64);
        self.publish_gauges(&inner);
        info!(
            evicted = removed.len(),
            kept_generations = window,
            num_bytes = inner.allocator.num_bytes(),
            "Trim complete"
        );
        Ok(true)
    }

    /// Persist the index
    ///
    /// The snapshot is taken under the cache lock; the file write happens
    /// after it is released, so adds and reads proceed during the write.
    pub fn save(&self) -> Result<()> {
        let _save = self.save_lock.lock();
        let bytes = {
            let inner = self.inner.lock();
            self.snapshot(&inner).to_bytes()
        };
        self.arena.flush()?;
        persist::write_transacted(&self.index_path, &bytes)
    }

    /// [`LruCache::save`] on the blocking thread pool
    pub async fn save_async(self: &Arc<Self>) -> Result<()> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.save())
            .await
            .map_err(|e| Error::Internal(format!("save task failed: {}", e)))?
    }

    /// [`LruCache::trim`] on the blocking thread pool
    pub async fn trim_async(self: &Arc<Self>, target_size: u64) -> Result<bool> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.trim(target_size))
            .await
            .map_err(|e| Error::Internal(format!("trim task failed: {}", e)))?
    }

    fn snapshot(&self, inner: &Inner) -> Snapshot {
        let entries = self
            .index
            .entries()
            .into_iter()
            .map(|(hash, item)| SnapshotEntry {
                hash,
                item,
                chain: inner.allocator.chain(item),
            })
            .collect();
        Snapshot {
            max_items: self.max_items as u32,
            max_size: self.max_size,
            generation: self.generation(),
            entries,
        }
    }

    /// Hashes of every stored object
    pub fn hashes(&self) -> Vec<ContentHash> {
        let _inner = self.inner.lock();
        self.index.entries().into_iter().map(|(hash, _)| hash).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            num_items: self.index.len(),
            max_items: self.max_items,
            num_bytes: inner.allocator.num_bytes(),
            num_bytes_with_block_slack: inner.allocator.num_bytes_with_block_slack(),
            num_bytes_with_page_slack: inner.allocator.num_bytes_with_page_slack(),
            num_free_pages: inner.allocator.num_free_pages(),
            max_size: self.max_size,
            generation: self.generation(),
        }
    }

    fn publish_gauges(&self, inner: &Inner) {
        metrics::BYTES.set(inner.allocator.num_bytes() as i64);
        metrics::ITEMS.set(self.index.len() as i64);
    }
}

/// Swap `replacement` into place at `live` via `<live>.old`
fn replace_file(live: &Path, replacement: &Path) -> Result<()> {
    let old = persist::with_suffix(live, ".old");
    std::fs::rename(live, &old).map_err(|e| Error::io(live, e))?;
    std::fs::rename(replacement, live).map_err(|e| Error::io(replacement, e))?;
    std::fs::remove_file(&old).map_err(|e| Error::io(&old, e))?;
    Ok(())
}

/// Read lease on a cache
///
/// Slices returned by [`View::get`] borrow the mapped arena and cannot
/// outlive the view.
#[derive(Debug)]
pub struct View<'a> {
    cache: &'a LruCache,
}

impl<'a> View<'a> {
    /// Look up an object and mark it as recently used
    ///
    /// Single-page objects are returned without copying; larger objects are
    /// assembled into an owned buffer.
    pub fn get(&self, hash: &ContentHash) -> Option<Cow<'_, [u8]>> {
        let Some((slot, item)) = self.cache.index.find(hash) else {
            metrics::MISSES.inc();
            return None;
        };
        let data = self.cache.read_object(item);
        self.cache.touch(hash, slot, item, data.len());
        metrics::HITS.inc();
        Some(data)
    }
}

impl Drop for View<'_> {
    fn drop(&mut self) {
        self.cache.inner.lock().readers -= 1;
    }
}
