//! Repair-request wire forms and message assembly for the NORM
//! transmission-block engine.
//!
//! A NACK or repair advertisement carries a sequence of *repair requests*,
//! each a run-compressed list of missing symbols. This crate defines the
//! request wire form (ITEMS / RANGES), the builder protocol the block engine
//! drives (`attach` → `append` → `pack`), and the decode path a receiver of
//! such messages uses.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod nack;
mod repair;

pub use error::*;
pub use nack::*;
pub use repair::*;

/// Length of the stream payload header carried in data messages
/// (payload length u16, message start u16, stream offset u32).
///
/// Senders size parity-buffer clears to `segment_size` plus this header.
pub const STREAM_PAYLOAD_HEADER_LEN: usize = 8;
