//! Core primitives for the NORM transmission-block engine.
//!
//! Provides the identifier types shared across the endpoint (wrap-capable
//! block and object sequence numbers, in-block symbol indices) and the
//! fixed-size bit mask backing the per-block pending and repair state.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bitmask;
mod ids;

pub use bitmask::*;
pub use ids::*;
