//! MeowPoW round arithmetic.
//!
//! Only the pieces the dispatcher has to know: epoch and period boundaries,
//! and the epoch seed derivation pools use in place of an explicit epoch
//! number. The memory-hard loop itself lives behind
//! [`ComputeBackend`](crate::farm::ComputeBackend).

use tiny_keccak::{Hasher, Keccak};

use crate::types::Hash256;

/// Blocks per DAG epoch.
///
/// With a 5 minute block time this grows the DAG on the same wall-clock
/// cadence as the 30000-block ethash schedule it descends from.
pub const EPOCH_LENGTH: u64 = 7500;

/// Blocks per kernel period: how often the random-math sequence of the
/// compiled kernel changes.
pub const PERIOD_LENGTH: u64 = 3;

/// Upper bound for the seed-to-epoch search.
const MAX_EPOCH: u32 = 32768;

/// Epoch containing `block`.
pub fn epoch_from_block(block: u64) -> u32 {
    (block / EPOCH_LENGTH) as u32
}

/// Period seed for `block`; selects the compiled kernel.
pub fn period_seed_from_block(block: u64) -> u64 {
    block / PERIOD_LENGTH
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut out = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut out);
    out
}

/// Epoch seed hash: keccak-256 iterated `epoch` times over the zero hash.
pub fn seed_from_epoch(epoch: u32) -> Hash256 {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = keccak256(&seed);
    }
    Hash256::from_bytes(seed)
}

/// Recover the epoch number from a seed hash.
///
/// Pools on the NiceHash stratum dialect send only the seed; the search is
/// bounded and cheap because consecutive jobs almost always share an epoch.
pub fn epoch_from_seed(seed: Hash256) -> Option<u32> {
    let mut candidate = [0u8; 32];
    for epoch in 0..MAX_EPOCH {
        if Hash256::from_bytes(candidate) == seed {
            return Some(epoch);
        }
        candidate = keccak256(&candidate);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_from_block() {
        assert_eq!(epoch_from_block(0), 0);
        assert_eq!(epoch_from_block(7499), 0);
        assert_eq!(epoch_from_block(7500), 1);
        assert_eq!(epoch_from_block(7500 * 11), 11);
    }

    #[test]
    fn test_period_seed_from_block() {
        assert_eq!(period_seed_from_block(0), 0);
        assert_eq!(period_seed_from_block(2), 0);
        assert_eq!(period_seed_from_block(3), 1);
        assert_eq!(period_seed_from_block(7500), 2500);
    }

    #[test]
    fn test_seed_epoch_roundtrip() {
        assert_eq!(seed_from_epoch(0), Hash256::ZERO);
        for epoch in [0u32, 1, 2, 17, 100] {
            let seed = seed_from_epoch(epoch);
            assert_eq!(epoch_from_seed(seed), Some(epoch));
        }
    }

    #[test]
    fn test_unknown_seed_not_found() {
        let bogus = Hash256::from_bytes([0xab; 32]);
        assert_eq!(epoch_from_seed(bogus), None);
    }

    #[test]
    fn test_seeds_are_distinct() {
        assert_ne!(seed_from_epoch(1), seed_from_epoch(2));
    }
}
