//! Generational LRU object cache
//!
//! Stores immutable blobs keyed by their content hash in a fixed-size,
//! memory-mapped data file. Recency is tracked in coarse generations
//! rather than per access, and eviction drops whole generations.
//!
//! # Architecture
//!
//! ```text
//! LruCache
//!   ├─→ HashIndex      hash → Item (page, generation, tail block)
//!   ├─→ PageAllocator  free pages + partial pages per BlockClass
//!   │     ├─→ BlockClass(64B)   → partial: [3, 9]
//!   │     ├─→ BlockClass(1KB)   → partial: [12]
//!   │     └─→ BlockClass(4KB)   → partial: []
//!   └─→ Arena (mmap)   [page 0][page 1][page 2] ...
//!
//! Object of 9000 bytes:
//!   page 12 ─→ page 40 ─→ tail block 2 of page 7 (808B in a 1KB block)
//!
//! Index file (transacted via <index>.tr)
//!   └─→ header + (hash, item, page links) per object
//! ```
//!
//! Every object occupies zero or more full pages followed by exactly one
//! tail block; many small tails share a page.

pub mod allocator;
pub mod arena;
pub mod block;
pub mod hash;
pub mod index;
pub mod item;
pub mod lru;
pub mod persist;
pub mod production_tests;
pub mod store;

pub use block::{BlockClass, NUM_BLOCK_CLASSES, PAGE_SIZE};
pub use hash::{ContentHash, HASH_LEN};
pub use item::Item;
pub use lru::{CacheStats, LruCache, View};
pub use persist::{transaction_path, FORMAT_VERSION};
pub use store::{CacheStore, ContentStore};
