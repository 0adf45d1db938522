//! Page and block allocator over the arena
//!
//! Every page is in exactly one of three states:
//!
//! ```text
//! free        → linked into the global free list
//! small       → dedicated to one BlockClass; linked into that class's
//!               list while at least one block is free
//! chain       → one full page of a multi-page object, linked to the
//!               next page of the object (the last one points at the tail page)
//! ```
//!
//! All links are page indices; `NIL` terminates a list.

use super::block::{full_pages_for_len, tail_len, BlockClass, NUM_BLOCK_CLASSES, PAGE_SIZE};
use super::item::Item;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

const NIL: u32 = u32::MAX;

/// Chain links of multi-page objects, readable without the cache lock
///
/// Entries are written before the owning item is published in the hash
/// index and cleared only while no reader is active.
pub(crate) struct PageLinks(Box<[AtomicU32]>);

impl PageLinks {
    pub fn new(num_pages: u32) -> Self {
        Self((0..num_pages).map(|_| AtomicU32::new(NIL)).collect())
    }

    /// Next page of the object `page` belongs to, if it is a chain page
    pub fn next(&self, page: u32) -> Option<u32> {
        match self.0[page as usize].load(Ordering::Relaxed) {
            NIL => None,
            next => Some(next),
        }
    }

    fn set(&self, page: u32, next: Option<u32>) {
        self.0[page as usize].store(next.unwrap_or(NIL), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct Page {
    class: Option<BlockClass>,
    /// One bit per block, set when the block is free
    free_blocks: u64,
    /// For chain pages: full pages left in the chain, this one included
    chain_len: u32,
    next: u32,
    prev: u32,
    /// Linked into its class's partially-free list
    listed: bool,
}

impl Page {
    const FREE: Page = Page {
        class: None,
        free_blocks: 0,
        chain_len: 0,
        next: NIL,
        prev: NIL,
        listed: false,
    };

    fn is_free(&self) -> bool {
        self.class.is_none() && self.chain_len == 0
    }
}

/// A claimed tail block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRef {
    pub page: u32,
    pub index: u8,
    pub class: BlockClass,
}

impl BlockRef {
    /// Byte offset of the block within the arena
    pub fn offset(&self) -> usize {
        block_offset(self.page, self.index, self.class)
    }
}

pub(crate) fn page_offset(page: u32) -> usize {
    page as usize * PAGE_SIZE
}

pub(crate) fn block_offset(page: u32, index: u8, class: BlockClass) -> usize {
    page_offset(page) + ((index as usize) << class.shift())
}

/// Allocator state; owned by the cache and mutated only under its lock
pub(crate) struct PageAllocator {
    pages: Vec<Page>,
    links: Arc<PageLinks>,
    free_head: u32,
    class_heads: [u32; NUM_BLOCK_CLASSES],
    num_free_pages: usize,
    num_bytes: u64,
    num_bytes_with_block_slack: u64,
}

impl PageAllocator {
    /// Allocator with every page free
    pub fn new(num_pages: u32, links: Arc<PageLinks>) -> Self {
        let mut allocator = Self {
            pages: vec![Page::FREE; num_pages as usize],
            links,
            free_head: NIL,
            class_heads: [NIL; NUM_BLOCK_CLASSES],
            num_free_pages: 0,
            num_bytes: 0,
            num_bytes_with_block_slack: 0,
        };
        allocator.rebuild_free_lists();
        allocator
    }

    /// Rebuild page state from persisted objects
    ///
    /// `objects` pairs each item with the pages following its first page
    /// (tail page last); single-page items have no pages listed. Any page
    /// not claimed by an object is free.
    pub fn restore<'a, I>(num_pages: u32, links: Arc<PageLinks>, objects: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Item, &'a [u32])>,
    {
        let mut allocator = Self {
            pages: vec![Page::FREE; num_pages as usize],
            links,
            free_head: NIL,
            class_heads: [NIL; NUM_BLOCK_CLASSES],
            num_free_pages: 0,
            num_bytes: 0,
            num_bytes_with_block_slack: 0,
        };
        for (item, chain) in objects {
            allocator.claim(item, chain)?;
        }
        allocator.rebuild_free_lists();
        debug!(
            pages = num_pages,
            free_pages = allocator.num_free_pages,
            bytes = allocator.num_bytes,
            "Restored allocator state"
        );
        Ok(allocator)
    }

    fn claim(&mut self, item: Item, chain: &[u32]) -> Result<()> {
        let num_pages = self.pages.len();
        let check = |page: u32| -> Result<()> {
            if (page as usize) < num_pages {
                Ok(())
            } else {
                Err(Error::Corrupt(format!(
                    "page {} out of range ({} pages)",
                    page, num_pages
                )))
            }
        };

        let tail_page = if item.is_multi_page() {
            let (&tail, rest) = chain.split_last().ok_or_else(|| {
                Error::Corrupt(format!("multi-page {} has no page links", item))
            })?;
            let full: Vec<u32> = std::iter::once(item.page()).chain(rest.iter().copied()).collect();
            let count = full.len() as u32;
            for (i, &page) in full.iter().enumerate() {
                check(page)?;
                if !self.pages[page as usize].is_free() {
                    return Err(Error::Corrupt(format!("page {} claimed twice", page)));
                }
                let next = full.get(i + 1).copied().unwrap_or(tail);
                let state = &mut self.pages[page as usize];
                state.chain_len = count - i as u32;
                state.next = next;
                self.links.set(page, Some(next));
            }
            self.num_bytes += full.len() as u64 * PAGE_SIZE as u64;
            self.num_bytes_with_block_slack += full.len() as u64 * PAGE_SIZE as u64;
            tail
        } else {
            if !chain.is_empty() {
                return Err(Error::Corrupt(format!(
                    "single-page {} has {} page links",
                    item,
                    chain.len()
                )));
            }
            item.page()
        };

        check(tail_page)?;
        let class = BlockClass::for_len(item.tail_size() as usize);
        if item.tail_index() as usize >= class.blocks_per_page() {
            return Err(Error::Corrupt(format!(
                "{} addresses block beyond a {} page",
                item, class
            )));
        }
        let page = &mut self.pages[tail_page as usize];
        match page.class {
            None if page.chain_len == 0 => {
                page.class = Some(class);
                page.free_blocks = class.empty_mask();
            }
            Some(existing) if existing == class => {}
            _ => {
                return Err(Error::Corrupt(format!(
                    "tail page {} of {} is already used differently",
                    tail_page, item
                )))
            }
        }
        let bit = 1u64 << item.tail_index();
        if page.free_blocks & bit == 0 {
            return Err(Error::Corrupt(format!("block of {} claimed twice", item)));
        }
        page.free_blocks &= !bit;
        self.num_bytes += item.tail_size() as u64;
        self.num_bytes_with_block_slack += class.block_size() as u64;
        Ok(())
    }

    /// Thread free pages and partially-free class pages into their lists
    ///
    /// Pages are visited in reverse so the lowest index ends up at the head.
    fn rebuild_free_lists(&mut self) {
        self.free_head = NIL;
        self.class_heads = [NIL; NUM_BLOCK_CLASSES];
        self.num_free_pages = 0;
        for page in (0..self.pages.len() as u32).rev() {
            let state = self.pages[page as usize];
            if state.is_free() {
                self.push_free(page);
            } else if let Some(class) = state.class {
                self.pages[page as usize].listed = false;
                if state.free_blocks != 0 {
                    self.push_class(page, class);
                }
            }
        }
    }

    pub fn num_free_pages(&self) -> usize {
        self.num_free_pages
    }

    /// Exact payload bytes of all live objects
    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// Payload rounded up to whole blocks and pages
    pub fn num_bytes_with_block_slack(&self) -> u64 {
        self.num_bytes_with_block_slack
    }

    /// Bytes of every page that is not free
    pub fn num_bytes_with_page_slack(&self) -> u64 {
        (self.pages.len() - self.num_free_pages) as u64 * PAGE_SIZE as u64
    }

    /// Whether an object of `len` bytes can be stored without running out of pages
    pub fn can_fit(&self, len: usize) -> bool {
        let class = BlockClass::for_len(tail_len(len));
        let tail_pages = usize::from(self.class_heads[class.index()] == NIL);
        full_pages_for_len(len) + tail_pages <= self.num_free_pages
    }

    /// Claim a tail block able to hold `len` bytes (`len` ≤ one page)
    pub fn alloc_block(&mut self, len: usize) -> Option<BlockRef> {
        let class = BlockClass::for_len(len);
        let mut page = self.class_heads[class.index()];
        if page == NIL {
            page = self.pop_free()?;
            let state = &mut self.pages[page as usize];
            state.class = Some(class);
            state.free_blocks = class.empty_mask();
            self.push_class(page, class);
        }

        let state = &mut self.pages[page as usize];
        let index = state.free_blocks.trailing_zeros() as u8;
        state.free_blocks &= !(1u64 << index);
        if state.free_blocks == 0 {
            self.unlink_class(page, class);
        }

        self.num_bytes += len as u64;
        self.num_bytes_with_block_slack += class.block_size() as u64;
        Some(BlockRef { page, index, class })
    }

    /// Claim `count` whole pages chained in front of `tail_page`
    ///
    /// Returns the first page of the chain, or `tail_page` itself when
    /// `count` is zero. Fails without side effects if too few pages are free.
    pub fn alloc_pages(&mut self, count: usize, tail_page: u32) -> Option<u32> {
        if count > self.num_free_pages {
            return None;
        }
        let mut next = tail_page;
        for i in 0..count {
            let page = self.pop_free()?;
            let state = &mut self.pages[page as usize];
            state.chain_len = i as u32 + 1;
            state.next = next;
            self.links.set(page, Some(next));
            next = page;
        }
        self.num_bytes += count as u64 * PAGE_SIZE as u64;
        self.num_bytes_with_block_slack += count as u64 * PAGE_SIZE as u64;
        Some(next)
    }

    /// Pages after the first page of `item`, tail page last
    pub fn chain(&self, item: Item) -> Vec<u32> {
        let mut pages = Vec::new();
        if item.is_multi_page() {
            let mut page = item.page();
            let count = self.pages[page as usize].chain_len;
            for _ in 0..count {
                page = self.pages[page as usize].next;
                pages.push(page);
            }
        }
        pages
    }

    /// Return every page and block of `item` to the free lists
    ///
    /// Must only run while no reader can observe the item.
    pub fn release(&mut self, item: Item) {
        let mut page = item.page();
        if item.is_multi_page() {
            let count = self.pages[page as usize].chain_len;
            for _ in 0..count {
                let next = self.pages[page as usize].next;
                self.pages[page as usize] = Page::FREE;
                self.links.set(page, None);
                self.push_free(page);
                self.num_bytes -= PAGE_SIZE as u64;
                self.num_bytes_with_block_slack -= PAGE_SIZE as u64;
                page = next;
            }
        }

        let state = self.pages[page as usize];
        let Some(class) = state.class else {
            debug_assert!(false, "tail page {} of {} has no block class", page, item);
            return;
        };
        let bit = 1u64 << item.tail_index();
        debug_assert!(state.free_blocks & bit == 0, "double release of {}", item);

        let free_blocks = state.free_blocks | bit;
        self.pages[page as usize].free_blocks = free_blocks;
        self.num_bytes -= item.tail_size() as u64;
        self.num_bytes_with_block_slack -= class.block_size() as u64;

        if free_blocks == class.empty_mask() {
            if state.listed {
                self.unlink_class(page, class);
            }
            self.pages[page as usize] = Page::FREE;
            self.push_free(page);
        } else if !state.listed {
            self.push_class(page, class);
        }
    }

    fn push_free(&mut self, page: u32) {
        self.pages[page as usize].next = self.free_head;
        self.free_head = page;
        self.num_free_pages += 1;
    }

    fn pop_free(&mut self) -> Option<u32> {
        let page = self.free_head;
        if page == NIL {
            return None;
        }
        self.free_head = self.pages[page as usize].next;
        self.pages[page as usize].next = NIL;
        self.num_free_pages -= 1;
        Some(page)
    }

    fn push_class(&mut self, page: u32, class: BlockClass) {
        let head = self.class_heads[class.index()];
        {
            let state = &mut self.pages[page as usize];
            state.prev = NIL;
            state.next = head;
            state.listed = true;
        }
        if head != NIL {
            self.pages[head as usize].prev = page;
        }
        self.class_heads[class.index()] = page;
    }

    fn unlink_class(&mut self, page: u32, class: BlockClass) {
        let Page { next, prev, .. } = self.pages[page as usize];
        if prev == NIL {
            self.class_heads[class.index()] = next;
        } else {
            self.pages[prev as usize].next = next;
        }
        if next != NIL {
            self.pages[next as usize].prev = prev;
        }
        let state = &mut self.pages[page as usize];
        state.next = NIL;
        state.prev = NIL;
        state.listed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(num_pages: u32) -> PageAllocator {
        PageAllocator::new(num_pages, Arc::new(PageLinks::new(num_pages)))
    }

    fn item_for(block: BlockRef, first: u32, len: usize, multi: bool) -> Item {
        Item::new(first, 0, block.index, len as u16, multi)
    }

    #[test]
    fn test_blocks_share_a_page() {
        let mut alloc = allocator(4);
        let a = alloc.alloc_block(3).unwrap();
        let b = alloc.alloc_block(3).unwrap();
        assert_eq!(a.page, b.page);
        assert_eq!((a.index, b.index), (0, 1));
        assert_eq!(b.offset(), a.offset() + 64);

        assert_eq!(alloc.num_bytes(), 6);
        assert_eq!(alloc.num_bytes_with_block_slack(), 128);
        assert_eq!(alloc.num_bytes_with_page_slack(), PAGE_SIZE as u64);
        assert_eq!(alloc.num_free_pages(), 3);
    }

    #[test]
    fn test_full_page_moves_to_next() {
        let mut alloc = allocator(4);
        let mut pages = Vec::new();
        for i in 1..=5u64 {
            let block = alloc.alloc_block(1000).unwrap();
            pages.push(block.page);
            assert_eq!(alloc.num_bytes_with_block_slack(), 1024 * i);
        }
        assert_eq!(&pages[..4], &[pages[0]; 4]);
        assert_ne!(pages[4], pages[0]);
        assert_eq!(alloc.num_bytes_with_page_slack(), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_classes_use_separate_pages() {
        let mut alloc = allocator(4);
        let small = alloc.alloc_block(10).unwrap();
        let large = alloc.alloc_block(3000).unwrap();
        assert_ne!(small.page, large.page);
        assert_eq!(large.class.block_size(), 4096);
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = allocator(2);
        assert!(alloc.alloc_block(4096).is_some());
        assert!(alloc.alloc_block(4096).is_some());
        assert!(!alloc.can_fit(4096));
        assert!(alloc.alloc_block(4096).is_none());
        assert_eq!(alloc.num_free_pages(), 0);
    }

    #[test]
    fn test_alloc_pages_chain() {
        let mut alloc = allocator(8);
        let tail = alloc.alloc_block(100).unwrap();
        let first = alloc.alloc_pages(3, tail.page).unwrap();

        let item = item_for(tail, first, 100, true);
        let chain = alloc.chain(item);
        assert_eq!(chain.len(), 3);
        assert_eq!(*chain.last().unwrap(), tail.page);

        // Reader-visible links walk the same chain
        let mut page = first;
        let mut walked = Vec::new();
        while let Some(next) = alloc.links.next(page) {
            walked.push(next);
            page = next;
        }
        assert_eq!(walked, chain);

        assert_eq!(alloc.num_bytes(), 3 * 4096 + 100);
        assert_eq!(alloc.num_free_pages(), 4);
        assert!(alloc.alloc_pages(5, tail.page).is_none());
        assert_eq!(alloc.num_free_pages(), 4);
    }

    #[test]
    fn test_release_restores_everything() {
        let mut alloc = allocator(8);
        let tail = alloc.alloc_block(100).unwrap();
        let first = alloc.alloc_pages(2, tail.page).unwrap();
        let item = item_for(tail, first, 100, true);

        alloc.release(item);
        assert_eq!(alloc.num_bytes(), 0);
        assert_eq!(alloc.num_bytes_with_block_slack(), 0);
        assert_eq!(alloc.num_free_pages(), 8);
        assert!(alloc.links.next(first).is_none());
    }

    #[test]
    fn test_release_partial_page_relists() {
        let mut alloc = allocator(4);
        // Fill one 1024-byte page completely
        let blocks: Vec<_> = (0..4).map(|_| alloc.alloc_block(1000).unwrap()).collect();
        assert_eq!(alloc.class_heads[blocks[0].class.index()], NIL);

        alloc.release(item_for(blocks[2], blocks[2].page, 1000, false));
        assert_eq!(alloc.class_heads[blocks[0].class.index()], blocks[0].page);

        // The freed slot is reused first
        let again = alloc.alloc_block(900).unwrap();
        assert_eq!((again.page, again.index), (blocks[2].page, 2));
    }

    #[test]
    fn test_restore_matches_live_state() -> Result<()> {
        let mut alloc = allocator(16);
        let mut objects = Vec::new();
        for len in [3usize, 3000, 70, 4096] {
            let block = alloc.alloc_block(len).unwrap();
            objects.push((item_for(block, block.page, len, false), Vec::new()));
        }
        let tail = alloc.alloc_block(5).unwrap();
        let first = alloc.alloc_pages(2, tail.page).unwrap();
        let multi = item_for(tail, first, 5, true);
        objects.push((multi, alloc.chain(multi)));

        let restored = PageAllocator::restore(
            16,
            Arc::new(PageLinks::new(16)),
            objects.iter().map(|(item, chain)| (*item, chain.as_slice())),
        )?;
        assert_eq!(restored.num_bytes(), alloc.num_bytes());
        assert_eq!(
            restored.num_bytes_with_block_slack(),
            alloc.num_bytes_with_block_slack()
        );
        assert_eq!(restored.num_free_pages(), alloc.num_free_pages());
        assert_eq!(restored.chain(multi), alloc.chain(multi));
        Ok(())
    }

    #[test]
    fn test_restore_rejects_double_claim() {
        let item = Item::new(0, 0, 0, 10, false);
        let result = PageAllocator::restore(
            2,
            Arc::new(PageLinks::new(2)),
            [(item, &[][..]), (item, &[][..])],
        );
        assert!(matches!(result, Err(Error::Corrupt(_))));

        let out_of_range = Item::new(5, 0, 0, 10, false);
        let result = PageAllocator::restore(
            2,
            Arc::new(PageLinks::new(2)),
            [(out_of_range, &[][..])],
        );
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }
}
