//! Chunk arithmetic for bulk transfers.
//!
//! The bus needs every transfer except the last fragment of a chunk to be a
//! whole number of blocks. A transfer of `len` bytes is therefore cut into
//! chunks of at most `max_chunk` bytes, and each chunk into a block-aligned
//! part plus a remainder.

use scan_core::{Result, ScanError};

/// One chunk, split at its last block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSplit {
    /// Block-aligned leading part.
    pub bulk: usize,
    /// Trailing bytes shorter than one block.
    pub remainder: usize,
}

impl ChunkSplit {
    /// Bytes covered.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bulk + self.remainder
    }

    /// True when nothing is transferred.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `len` bytes at the last multiple of `block`.
#[must_use]
pub const fn split_chunk(len: usize, block: usize) -> ChunkSplit {
    let remainder = len % block;
    ChunkSplit {
        bulk: len - remainder,
        remainder,
    }
}

/// Sequence of chunk splits covering `total` bytes.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    remaining: usize,
    max_chunk: usize,
    block: usize,
}

impl ChunkPlan {
    /// Plan `total` bytes in chunks of at most `max_chunk`.
    pub fn new(total: usize, max_chunk: usize, block: usize) -> Result<Self> {
        if total == 0 {
            return Err(ScanError::invalid("transfer_size", "zero-sized transfer"));
        }
        if block == 0 || max_chunk < block {
            return Err(ScanError::invalid(
                "max_chunk",
                format!("chunk {max_chunk} smaller than block {block}"),
            ));
        }
        Ok(Self {
            remaining: total,
            max_chunk,
            block,
        })
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkSplit;

    fn next(&mut self) -> Option<ChunkSplit> {
        if self.remaining == 0 {
            return None;
        }
        let len = self.remaining.min(self.max_chunk);
        self.remaining -= len;
        Some(split_chunk(len, self.block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_chunk() {
        assert_eq!(split_chunk(1000, 512), ChunkSplit { bulk: 512, remainder: 488 });
        assert_eq!(split_chunk(1024, 512), ChunkSplit { bulk: 1024, remainder: 0 });
        assert_eq!(split_chunk(100, 512), ChunkSplit { bulk: 0, remainder: 100 });
    }

    #[test]
    fn test_plan_respects_max_chunk() {
        let chunks: Vec<_> = ChunkPlan::new(0xeff0 * 2 + 10, 0xeff0, 512).unwrap().collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 0xeff0);
        assert_eq!(chunks[0].bulk % 512, 0);
        assert_eq!(chunks[2], ChunkSplit { bulk: 0, remainder: 10 });
    }

    #[test]
    fn test_zero_sized_transfer_rejected() {
        assert!(matches!(
            ChunkPlan::new(0, 4096, 512),
            Err(ScanError::InvalidParameter { name: "transfer_size", .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_plan_covers_total(
            total in 1usize..500_000,
            blocks in 1usize..128,
            extra in 0usize..512,
        ) {
            let max_chunk = blocks * 512 + extra;
            let plan: Vec<_> = ChunkPlan::new(total, max_chunk, 512).unwrap().collect();
            prop_assert_eq!(plan.iter().map(ChunkSplit::len).sum::<usize>(), total);
            for split in &plan {
                prop_assert_eq!(split.bulk % 512, 0);
                prop_assert!(split.remainder < 512);
                prop_assert!(split.len() <= max_chunk);
            }
        }
    }
}
