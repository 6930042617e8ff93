//! Bounded sliding-window index of live blocks.
//!
//! Blocks hash to bucket `id & hash_mask`; each bucket chain is kept in
//! ascending sequence order. The occupied id span `[range_lo, range_hi]` is
//! tracked incrementally and bounded by `range_max`. Removing an extremum
//! reseeks the new one with a circular bucket scan: each step probes for the
//! exact id `removed ± offset` (which hashes to exactly that bucket) while
//! remembering, from every chain walked, the nearest live id as a fallback.
//! With the table sized to at least the expected span, a reseek costs on the
//! order of the id gap, not the buffer population.

use norm_core::BlockId;
use tracing::warn;

use crate::block::Block;
use crate::config::BlockBufferConfig;
use crate::error::{BufferError, InsertError};

/// Bounded associative store mapping block id to live block.
#[derive(Debug)]
pub struct BlockBuffer {
    table: Vec<Vec<Block>>,
    hash_mask: u32,
    range_max: u32,
    range: u32,
    range_lo: BlockId,
    range_hi: BlockId,
}

impl BlockBuffer {
    /// Create a buffer bounding the occupied id span to `range_max`, with a
    /// hash table of `table_size` buckets (rounded up to a power of two).
    ///
    /// # Errors
    ///
    /// Returns `BufferError::InvalidConfig` when either parameter is zero.
    pub fn new(range_max: u32, table_size: u32) -> Result<Self, BufferError> {
        if range_max == 0 || table_size == 0 {
            return Err(BufferError::InvalidConfig {
                range_max,
                table_size,
            });
        }
        let table_size = table_size.next_power_of_two();
        Ok(Self {
            table: (0..table_size).map(|_| Vec::new()).collect(),
            hash_mask: table_size - 1,
            range_max,
            range: 0,
            range_lo: BlockId::new(0),
            range_hi: BlockId::new(0),
        })
    }

    /// # Errors
    ///
    /// Returns `BufferError::InvalidConfig` when either parameter is zero.
    pub fn from_config(config: &BlockBufferConfig) -> Result<Self, BufferError> {
        Self::new(config.range_max, config.table_size)
    }

    fn bucket(&self, id: BlockId) -> usize {
        (id.raw() & self.hash_mask) as usize
    }

    fn in_range(&self, id: BlockId) -> bool {
        self.range > 0 && !id.precedes(self.range_lo) && !id.follows(self.range_hi)
    }

    /// Look up a live block.
    #[must_use]
    pub fn find(&self, id: BlockId) -> Option<&Block> {
        if !self.in_range(id) {
            return None;
        }
        self.table[self.bucket(id)]
            .iter()
            .find(|block| block.id() == id)
    }

    /// Look up a live block for mutation.
    pub fn find_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        if !self.in_range(id) {
            return None;
        }
        let bucket = self.bucket(id);
        self.table[bucket]
            .iter_mut()
            .find(|block| block.id() == id)
    }

    /// Whether inserting `id` would keep the occupied span within bounds.
    #[must_use]
    pub fn can_insert(&self, id: BlockId) -> bool {
        if self.range == 0 {
            return true;
        }
        if id.precedes(self.range_lo) {
            self.range_lo.span_from(id) + self.range <= self.range_max
        } else if id.follows(self.range_hi) {
            id.span_from(self.range_hi) + self.range <= self.range_max
        } else {
            true
        }
    }

    /// Insert a block under its id.
    ///
    /// # Errors
    ///
    /// Returns the block back inside `InsertError::RangeExceeded` when the
    /// new span would exceed `range_max`, or `InsertError::Duplicate` when
    /// the id is already resident.
    pub fn insert(&mut self, block: Block) -> Result<(), InsertError> {
        let id = block.id();
        if self.range == 0 {
            self.range_lo = id;
            self.range_hi = id;
            self.range = 1;
        } else if id.precedes(self.range_lo) {
            let new_range = self.range_lo.span_from(id) + self.range;
            if new_range > self.range_max {
                return Err(InsertError::RangeExceeded {
                    id,
                    span: new_range,
                    max: self.range_max,
                    block,
                });
            }
            self.range_lo = id;
            self.range = new_range;
        } else if id.follows(self.range_hi) {
            let new_range = id.span_from(self.range_hi) + self.range;
            if new_range > self.range_max {
                return Err(InsertError::RangeExceeded {
                    id,
                    span: new_range,
                    max: self.range_max,
                    block,
                });
            }
            self.range_hi = id;
            self.range = new_range;
        }
        let bucket_index = self.bucket(id);
        let chain = &mut self.table[bucket_index];
        let position = chain
            .iter()
            .position(|entry| !entry.id().precedes(id))
            .unwrap_or(chain.len());
        if chain.get(position).is_some_and(|entry| entry.id() == id) {
            return Err(InsertError::Duplicate { id, block });
        }
        chain.insert(position, block);
        Ok(())
    }

    /// Remove and return the block under `id`, repairing the span extrema.
    pub fn remove(&mut self, id: BlockId) -> Option<Block> {
        if !self.in_range(id) {
            return None;
        }
        let bucket_index = self.bucket(id);
        let position = self.table[bucket_index]
            .iter()
            .position(|entry| entry.id() == id)?;
        let block = self.table[bucket_index].remove(position);
        if self.range > 1 {
            if id == self.range_lo {
                self.range_lo = self.reseek_lo(id, bucket_index);
                self.range = self.range_hi.span_from(self.range_lo) + 1;
            } else if id == self.range_hi {
                self.range_hi = self.reseek_hi(id, bucket_index);
                self.range = self.range_hi.span_from(self.range_lo) + 1;
            }
        } else {
            self.range = 0;
        }
        Some(block)
    }

    /// Find the new `range_lo` after removing it: circular ascending bucket
    /// scan probing for `removed + offset` at each step, with the smallest
    /// live id above `removed` tracked as a fallback (initially `range_hi`).
    fn reseek_lo(&self, removed: BlockId, start_bucket: usize) -> BlockId {
        let start = start_bucket as u32;
        let endex = if self.range <= self.hash_mask {
            start.wrapping_add(self.range - 1) & self.hash_mask
        } else {
            start
        };
        let mut fallback = self.range_hi;
        let mut i = start;
        let mut offset: u32 = 0;
        loop {
            i = (i + 1) & self.hash_mask;
            offset += 1;
            let target = removed.offset(offset);
            for entry in &self.table[i as usize] {
                if entry.id() == target {
                    return target;
                }
                if entry.id().follows(removed) && entry.id().precedes(fallback) {
                    fallback = entry.id();
                }
            }
            if i == endex {
                break;
            }
        }
        fallback
    }

    /// Mirror of [`BlockBuffer::reseek_lo`] for `range_hi`, scanning
    /// descending with fallback initially `range_lo`.
    fn reseek_hi(&self, removed: BlockId, start_bucket: usize) -> BlockId {
        let start = start_bucket as u32;
        let endex = if self.range <= self.hash_mask {
            start.wrapping_sub(self.range - 1) & self.hash_mask
        } else {
            start
        };
        let mut fallback = self.range_lo;
        let mut i = start;
        let mut offset: u32 = 0;
        loop {
            i = i.wrapping_sub(1) & self.hash_mask;
            offset += 1;
            let target = removed.offset_back(offset);
            for entry in &self.table[i as usize] {
                if entry.id() == target {
                    return target;
                }
                if entry.id().precedes(removed) && entry.id().follows(fallback) {
                    fallback = entry.id();
                }
            }
            if i == endex {
                break;
            }
        }
        fallback
    }

    /// Occupied id span (`range_hi − range_lo + 1`), 0 when empty.
    #[must_use]
    pub const fn range(&self) -> u32 {
        self.range
    }

    /// Smallest live id, `None` when empty.
    #[must_use]
    pub fn range_lo(&self) -> Option<BlockId> {
        (self.range > 0).then_some(self.range_lo)
    }

    /// Largest live id, `None` when empty.
    #[must_use]
    pub fn range_hi(&self) -> Option<BlockId> {
        (self.range > 0).then_some(self.range_hi)
    }

    #[must_use]
    pub const fn range_max(&self) -> u32 {
        self.range_max
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.range == 0
    }

    /// Number of live blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.iter().map(Vec::len).sum()
    }

    /// Remove every block, returning them for pool return.
    pub fn drain(&mut self) -> Vec<Block> {
        self.range = 0;
        self.table.iter_mut().flat_map(std::mem::take).collect()
    }

    /// Ascending-id iterator over live blocks.
    #[must_use]
    pub fn iter(&self) -> Blocks<'_> {
        Blocks {
            buffer: self,
            index: BlockId::new(0),
            reset: true,
        }
    }
}

impl<'a> IntoIterator for &'a BlockBuffer {
    type Item = &'a Block;
    type IntoIter = Blocks<'a>;

    fn into_iter(self) -> Blocks<'a> {
        self.iter()
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        if self.range != 0 {
            // Teardown should drain() and return blocks to their pool first.
            warn!(range = self.range, "block buffer dropped with blocks still resident");
        }
    }
}

/// Ascending-id iterator over a [`BlockBuffer`].
///
/// Advancing reuses the extremum-reseek scan: from the last yielded id, probe
/// buckets upward for the exact next id while tracking the nearest live id as
/// a fallback.
#[derive(Debug)]
pub struct Blocks<'a> {
    buffer: &'a BlockBuffer,
    index: BlockId,
    reset: bool,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<&'a Block> {
        let buffer = self.buffer;
        if self.reset {
            if buffer.range == 0 {
                return None;
            }
            self.reset = false;
            self.index = buffer.range_lo;
            return buffer.find(buffer.range_lo);
        }
        if buffer.range == 0
            || self.index.precedes(buffer.range_lo)
            || !self.index.precedes(buffer.range_hi)
        {
            return None;
        }
        let start = self.index.raw() & buffer.hash_mask;
        let endex = if buffer.range_hi.span_from(self.index) <= buffer.hash_mask {
            buffer.range_hi.raw() & buffer.hash_mask
        } else {
            start
        };
        let mut fallback = buffer.range_hi;
        let mut i = start;
        let mut offset: u32 = 0;
        loop {
            i = (i + 1) & buffer.hash_mask;
            offset += 1;
            let target = self.index.offset(offset);
            for entry in &buffer.table[i as usize] {
                if entry.id() == target {
                    self.index = target;
                    return Some(entry);
                }
                if entry.id().follows(self.index) && entry.id().precedes(fallback) {
                    fallback = entry.id();
                }
            }
            if i == endex {
                break;
            }
        }
        self.index = fallback;
        buffer.find(fallback)
    }
}
