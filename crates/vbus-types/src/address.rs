use core::fmt;

use serde::{Deserialize, Serialize};

/// A contiguous range `[offset, offset + length)` of words in a bus address space.
///
/// Each word is `word_size` bits wide. Blocks are immutable values: when a device's window moves,
/// it gets a new block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressBlock {
    pub offset: u64,
    pub length: u64,
    pub word_size: u32,
}

impl AddressBlock {
    pub const fn new(offset: u64, length: u64, word_size: u32) -> Self {
        Self {
            offset,
            length,
            word_size,
        }
    }

    /// Returns a block of `count` words starting at this block's offset.
    pub const fn take(&self, count: u64) -> Self {
        Self {
            offset: self.offset,
            length: count,
            word_size: self.word_size,
        }
    }

    /// Returns a block of `count` words starting at `min_offset`, or at this block's offset if that
    /// is higher.
    pub fn take_from(&self, min_offset: u64, count: u64) -> Self {
        Self {
            offset: self.offset.max(min_offset),
            length: count,
            word_size: self.word_size,
        }
    }

    pub const fn with_word_size(self, word_size: u32) -> Self {
        Self { word_size, ..self }
    }

    /// Exclusive end address. Saturates at `u64::MAX`.
    pub const fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Total size of the block in bits.
    pub const fn bit_size(&self) -> u128 {
        self.length as u128 * self.word_size as u128
    }

    pub const fn contains(&self, address: u64) -> bool {
        address >= self.offset && address < self.end()
    }

    pub const fn overlaps(&self, other: &AddressBlock) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.offset < other.end()
            && other.offset < self.end()
    }

    /// Returns `true` if the block lies entirely inside `[0, limit)` without overflowing.
    pub fn fits_within(&self, limit: u64) -> bool {
        self.offset
            .checked_add(self.length)
            .is_some_and(|end| end <= limit)
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[0x{:x}..0x{:x}) x{}b",
            self.offset,
            self.end(),
            self.word_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_keeps_offset_and_word_size() {
        let block = AddressBlock::new(0x100, 0x40, 16);
        let sub = block.take(8);
        assert_eq!(sub, AddressBlock::new(0x100, 8, 16));
        assert_eq!(sub.bit_size(), 128);
    }

    #[test]
    fn take_from_only_moves_offset_upward() {
        let block = AddressBlock::new(0x100, 0x40, 32);
        assert_eq!(block.take_from(0x180, 4).offset, 0x180);
        assert_eq!(block.take_from(0x10, 4).offset, 0x100);
    }

    #[test]
    fn overlap_is_half_open() {
        let a = AddressBlock::new(0, 0x10, 32);
        let b = AddressBlock::new(0x10, 0x10, 32);
        let c = AddressBlock::new(0x0F, 2, 32);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(!a.overlaps(&AddressBlock::new(4, 0, 32)));
    }

    #[test]
    fn fits_within_rejects_overflowing_blocks() {
        assert!(AddressBlock::new(0xF0, 0x10, 8).fits_within(0x100));
        assert!(!AddressBlock::new(0xF1, 0x10, 8).fits_within(0x100));
        assert!(!AddressBlock::new(u64::MAX, 2, 8).fits_within(u64::MAX));
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn take_preserves_offset_and_length(
                offset in any::<u64>(),
                length in any::<u64>(),
                word_size in 1u32..=64,
                count in any::<u64>(),
            ) {
                let block = AddressBlock::new(offset, length, word_size);
                let sub = block.take(count);
                prop_assert_eq!(sub.length, count);
                prop_assert_eq!(sub.offset, block.offset);
                prop_assert_eq!(sub.word_size, block.word_size);
            }
        }
    }
}
