//! Page geometry and power-of-two block classes

use std::fmt;

/// Size of one arena page in bytes
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

/// Smallest block handed out by the allocator
pub const MIN_BLOCK_SIZE: usize = 64;

const MIN_BLOCK_SHIFT: u32 = 6;

/// Number of distinct block classes (64, 128, ..., 4096)
pub const NUM_BLOCK_CLASSES: usize = (PAGE_SHIFT - MIN_BLOCK_SHIFT + 1) as usize;

/// A power-of-two block size class
///
/// Every page servicing small allocations is dedicated to exactly one class.
/// A page of the smallest class holds 64 blocks, which is also the width of
/// the per-page free bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockClass(u8);

impl BlockClass {
    /// Smallest class able to hold `len` bytes
    ///
    /// Zero-length tails still occupy a block of the smallest class.
    pub fn for_len(len: usize) -> Self {
        debug_assert!(len <= PAGE_SIZE, "tail of {} bytes exceeds a page", len);
        let size = len.max(MIN_BLOCK_SIZE).next_power_of_two();
        Self(size.trailing_zeros() as u8)
    }

    /// Class from its dense index (0 = 64 bytes)
    #[cfg(test)]
    pub fn from_index(index: usize) -> Option<Self> {
        (index < NUM_BLOCK_CLASSES).then(|| Self(index as u8 + MIN_BLOCK_SHIFT as u8))
    }

    /// Dense index of this class, suitable for per-class tables
    pub fn index(self) -> usize {
        (self.0 as u32 - MIN_BLOCK_SHIFT) as usize
    }

    /// log2 of the block size
    pub fn shift(self) -> u32 {
        self.0 as u32
    }

    /// Block size in bytes
    pub fn block_size(self) -> usize {
        1 << self.0
    }

    /// Number of blocks of this class that fit in one page
    pub fn blocks_per_page(self) -> usize {
        PAGE_SIZE >> self.0
    }

    /// Free bitmap of a page where every block of this class is free
    pub fn empty_mask(self) -> u64 {
        let blocks = self.blocks_per_page();
        if blocks >= 64 {
            u64::MAX
        } else {
            (1u64 << blocks) - 1
        }
    }
}

impl fmt::Display for BlockClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.block_size())
    }
}

/// Number of whole pages stored ahead of the tail block for an object of `len` bytes
///
/// The final `1..=4096` bytes (or zero bytes for an empty object) always live
/// in a tail block, so an exact multiple of the page size keeps a full tail.
pub fn full_pages_for_len(len: usize) -> usize {
    len.saturating_sub(1) / PAGE_SIZE
}

/// Bytes stored in the tail block of an object of `len` bytes
pub fn tail_len(len: usize) -> usize {
    len - full_pages_for_len(len) * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for_len() {
        assert_eq!(BlockClass::for_len(0).block_size(), 64);
        assert_eq!(BlockClass::for_len(3).block_size(), 64);
        assert_eq!(BlockClass::for_len(64).block_size(), 64);
        assert_eq!(BlockClass::for_len(65).block_size(), 128);
        assert_eq!(BlockClass::for_len(1000).block_size(), 1024);
        assert_eq!(BlockClass::for_len(4095).block_size(), 4096);
        assert_eq!(BlockClass::for_len(4096).block_size(), 4096);
    }

    #[test]
    fn test_class_index_roundtrip() {
        for index in 0..NUM_BLOCK_CLASSES {
            let class = BlockClass::from_index(index).unwrap();
            assert_eq!(class.index(), index);
        }
        assert!(BlockClass::from_index(NUM_BLOCK_CLASSES).is_none());
        assert_eq!(BlockClass::from_index(0).unwrap().block_size(), MIN_BLOCK_SIZE);
        assert_eq!(
            BlockClass::from_index(NUM_BLOCK_CLASSES - 1).unwrap().block_size(),
            PAGE_SIZE
        );
    }

    #[test]
    fn test_empty_mask() {
        assert_eq!(BlockClass::for_len(64).empty_mask(), u64::MAX);
        assert_eq!(BlockClass::for_len(128).empty_mask(), u32::MAX as u64);
        assert_eq!(BlockClass::for_len(1024).empty_mask(), 0b1111);
        assert_eq!(BlockClass::for_len(4096).empty_mask(), 0b1);
    }

    #[test]
    fn test_tail_split() {
        assert_eq!((full_pages_for_len(0), tail_len(0)), (0, 0));
        assert_eq!((full_pages_for_len(63), tail_len(63)), (0, 63));
        assert_eq!((full_pages_for_len(4096), tail_len(4096)), (0, 4096));
        assert_eq!((full_pages_for_len(4097), tail_len(4097)), (1, 1));
        assert_eq!((full_pages_for_len(8192), tail_len(8192)), (1, 4096));
        assert_eq!((full_pages_for_len(8193), tail_len(8193)), (2, 1));
    }
}
