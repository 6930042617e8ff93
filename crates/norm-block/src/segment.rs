//! Bounded free-list allocator for fixed-size payload buffers.

use std::fmt;

use serde::Serialize;

use crate::config::SegmentPoolConfig;
use crate::error::PoolError;

/// A payload buffer checked out of a [`SegmentPool`].
///
/// Contents are opaque to the block engine; the FEC codec and message
/// framing read and write through the byte accessors.
pub struct Segment {
    data: Box<[u8]>,
}

impl Segment {
    fn with_len(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the first `count` bytes, clamped to the buffer length.
    pub fn zero_prefix(&mut self, count: usize) {
        let n = count.min(self.data.len());
        self.data[..n].fill(0);
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment").field("len", &self.data.len()).finish()
    }
}

/// Point-in-time segment pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentPoolStats {
    /// Preallocated segment count.
    pub total: usize,
    /// Segments currently checked out.
    pub in_use: usize,
    /// High-water mark of `in_use`.
    pub peak_usage: usize,
    /// Distinct exhaustion episodes.
    pub overruns: u64,
}

/// LIFO free list of uniformly sized payload buffers.
///
/// LIFO reuse keeps recently touched buffers hot in cache and makes
/// exhaustion deterministic under load.
#[derive(Debug)]
pub struct SegmentPool {
    seg_size: usize,
    seg_total: usize,
    free: Vec<Segment>,
    peak_usage: usize,
    overruns: u64,
    overrun_flag: bool,
}

impl SegmentPool {
    /// Preallocate `count` buffers of at least `size` bytes each.
    ///
    /// `size` is rounded up to a multiple of the machine pointer size.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for a zero count or size.
    pub fn new(count: usize, size: usize) -> Result<Self, PoolError> {
        if count == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "segment count must be nonzero",
            });
        }
        if size == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "segment size must be nonzero",
            });
        }
        let align = std::mem::size_of::<usize>();
        let seg_size = size.div_ceil(align) * align;
        let free = (0..count).map(|_| Segment::with_len(seg_size)).collect();
        Ok(Self {
            seg_size,
            seg_total: count,
            free,
            peak_usage: 0,
            overruns: 0,
            overrun_flag: false,
        })
    }

    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for a zero count or size.
    pub fn from_config(config: &SegmentPoolConfig) -> Result<Self, PoolError> {
        Self::new(config.count, config.size)
    }

    /// Check a segment out of the pool.
    ///
    /// Returns `None` when the pool is exhausted; the first failure of an
    /// exhaustion episode is counted and logged, later failures in the same
    /// episode are silent.
    pub fn get(&mut self) -> Option<Segment> {
        match self.free.pop() {
            Some(segment) => {
                self.overrun_flag = false;
                let usage = self.seg_total - self.free.len();
                if usage > self.peak_usage {
                    self.peak_usage = usage;
                }
                Some(segment)
            }
            None => {
                if !self.overrun_flag {
                    tracing::warn!(
                        total = self.seg_total,
                        "segment pool exhausted, operating with constrained buffering"
                    );
                    self.overruns += 1;
                    self.overrun_flag = true;
                }
                None
            }
        }
    }

    /// Return a segment to the pool.
    ///
    /// The segment must have been checked out of this pool and not already
    /// returned.
    pub fn put(&mut self, segment: Segment) {
        debug_assert_eq!(
            segment.len(),
            self.seg_size,
            "segment returned to the wrong pool"
        );
        debug_assert!(self.free.len() < self.seg_total, "segment double-returned");
        self.free.push(segment);
    }

    /// Actual per-segment buffer size after alignment rounding.
    #[must_use]
    pub const fn segment_size(&self) -> usize {
        self.seg_size
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.seg_total
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.seg_total - self.free.len()
    }

    #[must_use]
    pub const fn peak_usage(&self) -> usize {
        self.peak_usage
    }

    #[must_use]
    pub const fn overruns(&self) -> u64 {
        self.overruns
    }

    #[must_use]
    pub fn stats(&self) -> SegmentPoolStats {
        SegmentPoolStats {
            total: self.seg_total,
            in_use: self.in_use(),
            peak_usage: self.peak_usage,
            overruns: self.overruns,
        }
    }
}

impl Drop for SegmentPool {
    fn drop(&mut self) {
        // Every checked-out segment must come home before the pool dies.
        let outstanding = self.in_use();
        if outstanding != 0 {
            tracing::error!(outstanding, "segment pool dropped with segments still checked out");
        }
    }
}
