//! Open-addressed hash index with Robin Hood displacement
//!
//! # Concurrency
//!
//! ```text
//! writer (cache lock held)         readers (no lock)
//!   seq += 1  (odd)                  s = seq      (retry while odd)
//!   shift / store slots              probe slots
//!   seq += 1  (even)                 retry if seq != s
//! ```
//!
//! Item words can additionally be updated in place by readers through
//! [`HashIndex::compare_exchange`], which never moves an entry and therefore
//! does not touch the sequence counter.

use super::hash::{ContentHash, HASH_LEN};
use super::item::Item;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const HASH_WORDS: usize = HASH_LEN / 4;

/// 2^64 / golden ratio
const FIBONACCI_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

struct Slot {
    hash: [AtomicU32; HASH_WORDS],
    item: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            hash: Default::default(),
            item: AtomicU64::new(0),
        }
    }

    fn load_hash(&self) -> ContentHash {
        let mut bytes = [0u8; HASH_LEN];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(&self.hash) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        ContentHash::new(bytes)
    }

    fn store_hash(&self, hash: &ContentHash) {
        for (chunk, word) in hash.as_bytes().chunks_exact(4).zip(&self.hash) {
            let mut le = [0u8; 4];
            le.copy_from_slice(chunk);
            word.store(u32::from_le_bytes(le), Ordering::Relaxed);
        }
    }

    fn load_item(&self) -> Item {
        Item::from_raw(self.item.load(Ordering::Acquire))
    }

    fn clear(&self) {
        self.store_hash(&ContentHash::ZERO);
        self.item.store(0, Ordering::Relaxed);
    }
}

/// Maps content hashes to [`Item`] descriptors
///
/// Mutating methods (`insert`, `retain`) must only be called by the holder
/// of the cache write lock; lookups and `compare_exchange` may run from any
/// number of threads concurrently with that writer.
pub(crate) struct HashIndex {
    slots: Box<[Slot]>,
    shift: u32,
    mask: usize,
    capacity: usize,
    len: AtomicUsize,
    seq: AtomicU64,
}

impl HashIndex {
    /// Create an empty index able to hold `capacity` entries
    ///
    /// The table is provisioned with roughly 1.4x as many slots, rounded up
    /// to a power of two.
    pub fn new(capacity: usize) -> Self {
        let num_slots = (capacity.saturating_mul(7) / 5).max(2).next_power_of_two();
        let slots: Box<[Slot]> = (0..num_slots).map(|_| Slot::new()).collect();
        Self {
            slots,
            shift: 64 - num_slots.trailing_zeros(),
            mask: num_slots - 1,
            capacity,
            len: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[cfg(test)]
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn target(&self, hash: &ContentHash) -> usize {
        (hash.low_u64().wrapping_mul(FIBONACCI_MULTIPLIER) >> self.shift) as usize
    }

    /// Distance of the entry stored at `index` from its own target slot
    fn probe_len(&self, index: usize, hash: &ContentHash) -> usize {
        index.wrapping_sub(self.target(hash)) & self.mask
    }

    /// Look up `hash`, returning its slot and the item stored there
    pub fn find(&self, hash: &ContentHash) -> Option<(usize, Item)> {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let found = self.probe(hash);
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == seq {
                return found;
            }
        }
    }

    fn probe(&self, hash: &ContentHash) -> Option<(usize, Item)> {
        let mut index = self.target(hash);
        for distance in 0..self.slots.len() {
            let slot = &self.slots[index];
            let slot_hash = slot.load_hash();
            if slot_hash.is_zero() {
                return None;
            }
            if slot_hash == *hash {
                return Some((index, slot.load_item()));
            }
            // An entry closer to home than we are means the key would have
            // displaced it had it been inserted.
            if self.probe_len(index, &slot_hash) < distance {
                return None;
            }
            index = (index + 1) & self.mask;
        }
        None
    }

    /// Insert a new entry
    ///
    /// Returns `false` without modifying anything if the index is at
    /// capacity, the hash is the reserved zero hash, or it is already present.
    pub fn insert(&self, hash: &ContentHash, item: Item) -> bool {
        if hash.is_zero() || self.is_full() || self.probe(hash).is_some() {
            return false;
        }
        self.begin_write();
        self.place(*hash, item);
        self.len.fetch_add(1, Ordering::Relaxed);
        self.end_write();
        true
    }

    fn place(&self, mut hash: ContentHash, mut item: Item) {
        let mut index = self.target(&hash);
        let mut distance = 0;
        loop {
            let slot = &self.slots[index];
            let slot_hash = slot.load_hash();
            if slot_hash.is_zero() {
                slot.item.store(item.to_raw(), Ordering::Relaxed);
                slot.store_hash(&hash);
                return;
            }

            let existing = self.probe_len(index, &slot_hash);
            if existing < distance {
                // Swap rather than load+store so a concurrent generation
                // refresh of the evicted entry travels with it.
                let evicted = Item::from_raw(slot.item.swap(item.to_raw(), Ordering::AcqRel));
                slot.store_hash(&hash);
                hash = slot_hash;
                item = evicted;
                distance = existing;
            }

            index = (index + 1) & self.mask;
            distance += 1;
        }
    }

    /// Atomically replace the item in `slot` if it still equals `current`
    pub fn compare_exchange(&self, slot: usize, current: Item, new: Item) -> bool {
        self.slots[slot]
            .item
            .compare_exchange(
                current.to_raw(),
                new.to_raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Rebuild the table keeping only entries accepted by `keep`
    ///
    /// Returns the entries that were dropped.
    pub fn retain<F>(&self, mut keep: F) -> Vec<(ContentHash, Item)>
    where
        F: FnMut(&ContentHash, Item) -> bool,
    {
        let entries = self.entries();
        self.begin_write();
        for slot in self.slots.iter() {
            slot.clear();
        }
        let mut removed = Vec::new();
        let mut kept = 0;
        for (hash, item) in entries {
            if keep(&hash, item) {
                self.place(hash, item);
                kept += 1;
            } else {
                removed.push((hash, item));
            }
        }
        self.len.store(kept, Ordering::Relaxed);
        self.end_write();
        removed
    }

    /// Snapshot of every live entry, in slot order
    pub fn entries(&self) -> Vec<(ContentHash, Item)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let hash = slot.load_hash();
                (!hash.is_zero()).then(|| (hash, slot.load_item()))
            })
            .collect()
    }

    fn begin_write(&self) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    fn end_write(&self) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u32) -> ContentHash {
        ContentHash::compute(&n.to_le_bytes())
    }

    fn item(n: u32) -> Item {
        Item::new(n, 0, 0, 1, false)
    }

    #[test]
    fn test_sizing() {
        let index = HashIndex::new(100);
        assert_eq!(index.num_slots(), 256);
        assert_eq!(index.capacity(), 100);
        assert_eq!(HashIndex::new(0).num_slots(), 2);
    }

    #[test]
    fn test_insert_find() {
        let index = HashIndex::new(64);
        for n in 0..64 {
            assert!(index.insert(&hash(n), item(n)));
        }
        assert_eq!(index.len(), 64);
        for n in 0..64 {
            let (_, found) = index.find(&hash(n)).expect("present");
            assert_eq!(found, item(n));
        }
        assert!(index.find(&hash(1000)).is_none());
    }

    #[test]
    fn test_duplicate_and_capacity() {
        let index = HashIndex::new(2);
        assert!(index.insert(&hash(1), item(1)));
        assert!(!index.insert(&hash(1), item(99)));
        assert_eq!(index.find(&hash(1)).unwrap().1, item(1));

        assert!(index.insert(&hash(2), item(2)));
        assert!(!index.insert(&hash(3), item(3)));
        assert_eq!(index.len(), 2);

        assert!(!index.insert(&ContentHash::ZERO, item(4)));
    }

    #[test]
    fn test_robin_hood_invariant() {
        // Fill to capacity so probe chains overlap heavily
        let index = HashIndex::new(1000);
        for n in 0..1000 {
            assert!(index.insert(&hash(n), item(n)));
        }
        // Along any run of occupied slots, probe length grows by at most one per step
        for i in 0..index.num_slots() {
            let next = (i + 1) & index.mask;
            let a = index.slots[i].load_hash();
            let b = index.slots[next].load_hash();
            if !a.is_zero() && !b.is_zero() {
                assert!(index.probe_len(next, &b) <= index.probe_len(i, &a) + 1);
            }
            if a.is_zero() && !b.is_zero() {
                assert_eq!(index.probe_len(next, &b), 0);
            }
        }
    }

    #[test]
    fn test_compare_exchange() {
        let index = HashIndex::new(8);
        index.insert(&hash(5), item(5));
        let (slot, current) = index.find(&hash(5)).unwrap();

        let refreshed = current.with_generation(3);
        assert!(index.compare_exchange(slot, current, refreshed));
        // Stale expectation fails
        assert!(!index.compare_exchange(slot, current, current.with_generation(4)));
        assert_eq!(index.find(&hash(5)).unwrap().1.generation(), 3);
    }

    #[test]
    fn test_retain() {
        let index = HashIndex::new(32);
        for n in 0..32 {
            index.insert(&hash(n), item(n));
        }
        let removed = index.retain(|_, item| item.page() % 2 == 0);
        assert_eq!(removed.len(), 16);
        assert_eq!(index.len(), 16);
        for n in 0..32 {
            assert_eq!(index.find(&hash(n)).is_some(), n % 2 == 0);
        }
        assert_eq!(index.entries().len(), 16);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_entries() {
        let index = HashIndex::new(4000);
        for n in 0..1000 {
            index.insert(&hash(n), item(n));
        }

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for round in 0..20 {
                        for n in 0..1000 {
                            let (_, found) = index.find(&hash(n)).expect("never lost");
                            assert_eq!(found.page(), n, "round {}", round);
                        }
                    }
                });
            }
            scope.spawn(|| {
                for n in 1000..4000 {
                    assert!(index.insert(&hash(n), item(n)));
                }
            });
        });

        assert_eq!(index.len(), 4000);
    }
}
