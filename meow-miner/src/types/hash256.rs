//! 256-bit hash value type.
//!
//! Headers, seeds, mix hashes and boundaries are all 256-bit big-endian
//! values. The zero hash doubles as the "not present" sentinel for work
//! packages, so `is_zero` is part of the contract, not just a convenience.

use std::fmt;
use std::str::FromStr;

use crate::u256::U256;

/// A 256-bit hash, stored big-endian.
///
/// Ordering is numeric: a hash compares below a boundary iff the value it
/// encodes is smaller, which is exactly the proof-of-work validity test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// The zero hash ("not present" sentinel).
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from a hex string, with or without a `0x` prefix.
    ///
    /// Shorter strings are accepted and right-aligned (leading zeros
    /// implied), matching how pools abbreviate targets.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() > 64 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut padded = String::with_capacity(64);
        for _ in 0..(64 - s.len()) {
            padded.push('0');
        }
        padded.push_str(s);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&padded, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Format as a `0x`-prefixed lowercase hex string.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Short display form for logs: first four bytes.
    pub fn abridged(&self) -> String {
        format!("{}…", hex::encode(&self.0[..4]))
    }

    /// The most significant 64 bits.
    ///
    /// Compute backends compare candidate hashes against this prefix of the
    /// boundary; `u64::MAX` here means difficulty-1 work.
    pub fn upper_u64(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(prefix)
    }

    /// A uniformly random hash.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl From<Hash256> for U256 {
    fn from(h: Hash256) -> Self {
        U256::from_be_bytes(h.0)
    }
}

impl From<U256> for Hash256 {
    fn from(u: U256) -> Self {
        Self(u.to_be_bytes())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
