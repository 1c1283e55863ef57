//! Configuration from environment variables.
//!
//! Everything has a sensible default; only `MEOW_POOLS` is required to do
//! real mining (the daemon falls back to a local simulation when it is
//! absent).

use std::time::Duration;

use crate::endpoint::{EndpointError, PoolEndpoint};
use crate::farm::FarmSettings;
use crate::pool::PoolSettings;

/// Daemon configuration parsed from environment variables.
///
/// # Environment Variables
///
/// - `MEOW_POOLS`: comma-separated connection strings, primary first
/// - `MEOW_BACKEND_THREADS`: number of compute workers (default: 1)
/// - `MEOW_SHUFFLE`: re-randomize start nonces on every connection
/// - `MEOW_GETWORK_POLL_MS`: getwork polling cadence (default: 1000)
/// - `MEOW_NO_WORK_TIMEOUT`: seconds without a new job before
///   reconnecting (default: 100000)
/// - `MEOW_NO_RESPONSE_TIMEOUT`: seconds to wait for a reply (default: 2)
/// - `MEOW_FAILOVER_TIMEOUT_MIN`: minutes before returning to the primary
///   pool, 0 = never (default: 0)
/// - `MEOW_REPORT_HASHRATE`: submit hashrate to the pool
/// - `MEOW_HR_INTERVAL`: seconds between hashrate submissions (default: 60)
/// - `MEOW_HR_ID`: hashrate identifier (default: random)
/// - `MEOW_MAX_RETRIES`: connection attempts per endpoint (default: 9000)
/// - `MEOW_BENCHMARK_BLOCK`, `MEOW_BENCHMARK_DIFF`: simulation parameters
#[derive(Debug, Clone)]
pub struct Settings {
    pub pools: Vec<String>,
    pub pool: PoolSettings,
    pub farm: FarmSettings,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = PoolSettings::default();

        let pools = std::env::var("MEOW_POOLS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let pool = PoolSettings {
            get_work_poll_interval: env_parse("MEOW_GETWORK_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.get_work_poll_interval),
            no_work_timeout: env_parse("MEOW_NO_WORK_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.no_work_timeout),
            no_response_timeout: env_parse("MEOW_NO_RESPONSE_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.no_response_timeout),
            pool_failover_timeout: env_parse("MEOW_FAILOVER_TIMEOUT_MIN")
                .map(|minutes: u64| Duration::from_secs(minutes * 60))
                .unwrap_or(defaults.pool_failover_timeout),
            report_hashrate: env_flag("MEOW_REPORT_HASHRATE"),
            hash_rate_interval: env_parse("MEOW_HR_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.hash_rate_interval),
            hash_rate_id: std::env::var("MEOW_HR_ID").unwrap_or(defaults.hash_rate_id),
            connection_max_retries: env_parse("MEOW_MAX_RETRIES")
                .unwrap_or(defaults.connection_max_retries),
            benchmark_block: env_parse("MEOW_BENCHMARK_BLOCK").unwrap_or(defaults.benchmark_block),
            benchmark_diff: env_parse("MEOW_BENCHMARK_DIFF").unwrap_or(defaults.benchmark_diff),
        };

        let farm = FarmSettings {
            miner_count: env_parse("MEOW_BACKEND_THREADS").unwrap_or(1),
            segment_width: None,
            shuffle_on_connect: env_flag("MEOW_SHUFFLE"),
        };

        Self { pools, pool, farm }
    }

    /// Parse the configured pool list.
    pub fn endpoints(&self) -> Result<Vec<PoolEndpoint>, EndpointError> {
        self.pools.iter().map(|s| PoolEndpoint::parse(s)).collect()
    }
}
