//! Packed 64-bit object descriptor

use std::fmt;

const PAGE_BITS: u32 = 35;
const GENERATION_SHIFT: u32 = PAGE_BITS;
const TAIL_INDEX_SHIFT: u32 = GENERATION_SHIFT + 8;
const TAIL_SIZE_SHIFT: u32 = TAIL_INDEX_SHIFT + 6;
const MULTI_PAGE_BIT: u64 = 1 << 62;
const VALID_BIT: u64 = 1 << 63;

const PAGE_MASK: u64 = (1 << PAGE_BITS) - 1;
const TAIL_INDEX_MASK: u64 = (1 << 6) - 1;
const TAIL_SIZE_MASK: u64 = (1 << 13) - 1;

/// Upper bound on the number of pages an arena may hold
///
/// Page indices are `u32` in memory; `u32::MAX` is reserved as a list terminator.
pub const MAX_PAGES: u64 = u32::MAX as u64;

/// Location and metadata of one stored object
///
/// Layout, least significant bit first:
///
/// ```text
/// [0..35)  first page index
/// [35..43) generation
/// [43..49) tail block index within its page
/// [49..62) tail size in bytes
///  62      spans full pages before the tail
///  63      valid
/// ```
///
/// The whole descriptor is one machine word so that the hash index can
/// swap it atomically.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Item(u64);

impl Item {
    /// The all-zero, invalid descriptor
    pub const EMPTY: Item = Item(0);

    /// Build a valid descriptor
    pub fn new(page: u32, generation: u8, tail_index: u8, tail_size: u16, multi_page: bool) -> Self {
        debug_assert!((tail_index as u64) <= TAIL_INDEX_MASK);
        debug_assert!((tail_size as u64) <= TAIL_SIZE_MASK);
        let mut raw = VALID_BIT
            | (page as u64 & PAGE_MASK)
            | ((generation as u64) << GENERATION_SHIFT)
            | ((tail_index as u64 & TAIL_INDEX_MASK) << TAIL_INDEX_SHIFT)
            | ((tail_size as u64 & TAIL_SIZE_MASK) << TAIL_SIZE_SHIFT);
        if multi_page {
            raw |= MULTI_PAGE_BIT;
        }
        Self(raw)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 & VALID_BIT != 0
    }

    /// First page of the object: the head of the full-page chain, or the tail page
    pub fn page(self) -> u32 {
        (self.0 & PAGE_MASK) as u32
    }

    pub fn generation(self) -> u8 {
        (self.0 >> GENERATION_SHIFT) as u8
    }

    /// Block index of the tail within the tail page
    pub fn tail_index(self) -> u8 {
        ((self.0 >> TAIL_INDEX_SHIFT) & TAIL_INDEX_MASK) as u8
    }

    /// Number of bytes stored in the tail block
    pub fn tail_size(self) -> u16 {
        ((self.0 >> TAIL_SIZE_SHIFT) & TAIL_SIZE_MASK) as u16
    }

    /// Whether whole pages precede the tail block
    pub fn is_multi_page(self) -> bool {
        self.0 & MULTI_PAGE_BIT != 0
    }

    /// Same location, attributed to another generation
    pub fn with_generation(self, generation: u8) -> Self {
        let cleared = self.0 & !(0xFFu64 << GENERATION_SHIFT);
        Self(cleared | ((generation as u64) << GENERATION_SHIFT))
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("Item(empty)");
        }
        f.debug_struct("Item")
            .field("page", &self.page())
            .field("generation", &self.generation())
            .field("tail_index", &self.tail_index())
            .field("tail_size", &self.tail_size())
            .field("multi_page", &self.is_multi_page())
            .finish()
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Item(page={}, gen={}, tail={}@{})",
            self.page(),
            self.generation(),
            self.tail_size(),
            self.tail_index()
        )
    }
}
