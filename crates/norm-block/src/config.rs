//! Pool and buffer sizing configuration.

use serde::{Deserialize, Serialize};

/// Segment pool sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPoolConfig {
    /// Number of preallocated segment buffers.
    ///
    /// Default: 256
    pub count: usize,

    /// Usable bytes per segment, rounded up for pointer alignment.
    ///
    /// Default: 1024
    pub size: usize,
}

impl Default for SegmentPoolConfig {
    fn default() -> Self {
        Self {
            count: 256,
            size: 1024,
        }
    }
}

/// Block pool sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPoolConfig {
    /// Number of preconstructed blocks.
    ///
    /// Default: 32
    pub num_blocks: u32,

    /// Symbols per block (`num_data + num_parity`).
    ///
    /// Default: 64
    pub total_size: u16,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            num_blocks: 32,
            total_size: 64,
        }
    }
}

/// Block buffer sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBufferConfig {
    /// Maximum occupied block-id span.
    ///
    /// Default: 16
    pub range_max: u32,

    /// Hash table size; rounded up to a power of two.
    ///
    /// Sizing the table to at least `range_max` keeps extremum reseeks
    /// proportional to the id gap rather than the table.
    ///
    /// Default: 16
    pub table_size: u32,
}

impl Default for BlockBufferConfig {
    fn default() -> Self {
        Self {
            range_max: 16,
            table_size: 16,
        }
    }
}
