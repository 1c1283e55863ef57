//! Boundary / difficulty conversions.
//!
//! A boundary is a 256-bit target: a candidate hash is a valid solution iff
//! it is numerically below the boundary. Difficulty is the expected number
//! of hashes per solution, `2^256 / boundary`. Pools speak both dialects:
//! getwork and MeowPoW stratum notifications carry boundaries, NiceHash-style
//! `mining.set_difficulty` carries share difficulty.

use crate::types::Hash256;
use crate::u256::U256;

/// Fixed-point scale used when dividing by a fractional difficulty.
///
/// 2^16 keeps three-ish decimal digits of the difficulty while staying exact
/// in integer arithmetic.
const DIFF_SCALE: u64 = 1 << 16;

/// Boundary for a given share difficulty.
///
/// `difficulty <= 1` (including the degenerate 0) maps to the widest
/// boundary, difficulty-1 work.
pub fn boundary_from_difficulty(difficulty: f64) -> Hash256 {
    if !(difficulty > 1.0) {
        return Hash256::from_bytes([0xff; 32]);
    }
    let scaled = (difficulty * DIFF_SCALE as f64) as u64;
    Hash256::from((U256::MAX / scaled) * DIFF_SCALE)
}

/// Expected hashes to find a solution below `boundary`.
///
/// This is the number the manager logs as "difficulty" when work changes.
/// Returns 0.0 for the zero boundary (no valid work).
pub fn hashes_to_target(boundary: Hash256) -> f64 {
    if boundary.is_zero() {
        return 0.0;
    }
    2f64.powi(256) / U256::from(boundary).to_f64_lossy()
}

/// Human-readable difficulty with SI suffix, e.g. `4.29 Gh`.
pub fn format_hashes(hashes: f64) -> String {
    let suffixes = ["h", "Kh", "Mh", "Gh", "Th", "Ph"];
    let mut value = hashes;
    let mut magnitude = 0;
    while value >= 1000.0 && magnitude < suffixes.len() - 1 {
        value /= 1000.0;
        magnitude += 1;
    }
    format!("{:.2} {}", value, suffixes[magnitude])
}
