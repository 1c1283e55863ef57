//! MeowPoW pool-client core.
//!
//! Mediates between compute workers searching a nonce space and the pools
//! that hand out work: the [`pool::PoolManager`] keeps one protocol client
//! alive across failovers, the [`farm::Farm`] keeps the workers supplied
//! with fresh work, and solutions flow back up to whichever pool is
//! currently elected.

pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod farm;
pub mod meowpow;
pub mod pool;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod work;
