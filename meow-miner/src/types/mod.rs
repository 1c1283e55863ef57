//! Core types for meow-miner.
//!
//! This module provides a unified location for the value types used
//! throughout the client: 256-bit hashes, hashrates, and the
//! boundary/difficulty conversions the pool protocols need.

mod difficulty;
mod hash256;
mod hashrate;

pub use difficulty::{boundary_from_difficulty, format_hashes, hashes_to_target};
pub use hash256::Hash256;
pub use hashrate::HashRate;
