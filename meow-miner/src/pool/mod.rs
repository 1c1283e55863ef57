//! Pool connectivity.
//!
//! Protocol clients for stratum, HTTP getwork, and the local simulator,
//! plus the [`PoolManager`] that owns connection selection, failover,
//! reconnection, primary-pool reaffinity, and hashrate reporting.

mod client;
mod getwork;
mod manager;
mod simulate;
mod stratum;

#[cfg(test)]
pub(crate) mod testpool;

pub use client::{ClientEvent, PoolClient};
pub use getwork::GetworkClient;
pub use manager::{ManagerError, PoolManager, PoolSettings};
pub use simulate::SimulateClient;
pub use stratum::StratumClient;
