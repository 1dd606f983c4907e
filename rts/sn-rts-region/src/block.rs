//! Bump-allocated byte blocks.
//!
//! Raw struct payloads are not individually boxed. Each region owns a chain
//! of fixed-size blocks and carves payloads out of the newest block by
//! bumping a cursor. A request that does not fit starts a new block; a
//! request larger than the block size gets a dedicated block of its own.
//! Nothing is ever freed individually; the chain is dropped with the region.

use sn_rts_alloc::{align_up, AllocError, AllocResult};

/// Default block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Location of a payload inside a [`BlockChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlobRef {
    block: u32,
    offset: u32,
    len: u32,
}

impl BlobRef {
    /// Payload length in bytes.
    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len as usize
    }
}

/// A single fixed-capacity block.
///
/// # Invariants
///
/// - `cursor <= data.len()`
/// - every handed-out range lies below `cursor`
#[derive(Debug)]
struct Block {
    data: Box<[u8]>,
    cursor: usize,
}

impl Block {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            cursor: 0,
        }
    }

    fn try_alloc(&mut self, size: usize, align: usize) -> Option<usize> {
        let start = align_up(self.cursor, align);
        let end = start.checked_add(size)?;
        if end > self.data.len() {
            return None;
        }
        self.cursor = end;
        Some(start)
    }
}

/// A growable chain of bump blocks.
#[derive(Debug)]
pub(crate) struct BlockChain {
    blocks: Vec<Block>,
    block_size: usize,
}

impl BlockChain {
    pub(crate) const fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            block_size,
        }
    }

    /// Copy `bytes` into the chain at an offset aligned to `align`.
    pub(crate) fn alloc(&mut self, bytes: &[u8], align: usize) -> AllocResult<BlobRef> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidLayout(format!(
                "alignment {align} is not a power of two"
            )));
        }
        let len = u32::try_from(bytes.len()).map_err(|_| AllocError::OutOfMemory {
            requested: bytes.len(),
        })?;

        let reused = self
            .blocks
            .last_mut()
            .and_then(|block| block.try_alloc(bytes.len(), align));

        let offset = match reused {
            Some(offset) => offset,
            None => {
                let capacity = self.block_size.max(align_up(bytes.len(), align));
                let mut block = Block::with_capacity(capacity);
                let offset = block
                    .try_alloc(bytes.len(), align)
                    .ok_or(AllocError::BlockExhausted {
                        current: 0,
                        capacity,
                    })?;
                self.blocks.push(block);
                offset
            }
        };

        let block = self.blocks.len() - 1;
        self.blocks[block].data[offset..offset + bytes.len()].copy_from_slice(bytes);

        Ok(BlobRef {
            block: u32::try_from(block).map_err(|_| AllocError::OutOfMemory {
                requested: bytes.len(),
            })?,
            offset: u32::try_from(offset).map_err(|_| AllocError::OutOfMemory {
                requested: bytes.len(),
            })?,
            len,
        })
    }

    pub(crate) fn get(&self, blob: BlobRef) -> &[u8] {
        let start = blob.offset as usize;
        &self.blocks[blob.block as usize].data[start..start + blob.len()]
    }

    /// Total bytes reserved by all blocks.
    pub(crate) fn reserved(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_within_one_block() {
        let mut chain = BlockChain::new(128);
        let a = chain.alloc(&[1, 2, 3], 1).unwrap();
        let b = chain.alloc(&[4, 5, 6, 7], 8).unwrap();

        assert_eq!(chain.block_count(), 1);
        assert_eq!(chain.get(a), &[1, 2, 3]);
        assert_eq!(chain.get(b), &[4, 5, 6, 7]);
        assert_eq!(b.offset, 8);
        assert!(sn_rts_alloc::is_aligned(b.offset as usize, 8));
    }

    #[test]
    fn test_new_block_when_full() {
        let mut chain = BlockChain::new(16);
        chain.alloc(&[0; 12], 1).unwrap();
        let b = chain.alloc(&[9; 8], 1).unwrap();

        assert_eq!(chain.block_count(), 2);
        assert_eq!(chain.get(b), &[9; 8]);
    }

    #[test]
    fn test_oversized_gets_dedicated_block() {
        let mut chain = BlockChain::new(16);
        let big = chain.alloc(&[7; 100], 8).unwrap();

        assert_eq!(chain.get(big).len(), 100);
        assert!(chain.reserved() >= 100);
    }

    #[test]
    fn test_invalid_alignment() {
        let mut chain = BlockChain::new(16);
        assert!(matches!(
            chain.alloc(&[1], 3),
            Err(AllocError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_clear() {
        let mut chain = BlockChain::new(16);
        chain.alloc(&[1, 2], 1).unwrap();
        chain.clear();
        assert_eq!(chain.block_count(), 0);
        assert_eq!(chain.reserved(), 0);
    }
}
