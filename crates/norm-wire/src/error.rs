//! Error types for repair-request encoding and decoding.

use thiserror::Error;

/// Wire assembly and parse errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("message payload full (need {needed} bytes, capacity {capacity})")]
    ExceedsCapacity { needed: usize, capacity: usize },

    #[error("buffer too short (len {len}, need at least {min})")]
    TooShort { len: usize, min: usize },

    #[error("unknown repair request form {value}")]
    InvalidForm { value: u8 },

    #[error("request length mismatch (claimed {claimed} bytes, {available} available)")]
    LengthMismatch { claimed: usize, available: usize },

    #[error("ranges request carries an odd item count")]
    DanglingRangeItem,
}
