//! Hashrate measurement.

use std::fmt;
use std::iter::Sum;

/// Hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HashRate(pub u64);

impl HashRate {
    pub fn from_megahashes(mh: f64) -> Self {
        Self((mh * 1_000_000.0) as u64)
    }

    pub fn from_gigahashes(gh: f64) -> Self {
        Self((gh * 1_000_000_000.0) as u64)
    }

    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl From<HashRate> for u64 {
    fn from(rate: HashRate) -> Self {
        rate.0
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0 as f64
    }
}

impl Sum for HashRate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|r| r.0).sum())
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0 as f64;
        let (scaled, suffix) = if value >= 1e12 {
            (value / 1e12, "Th")
        } else if value >= 1e9 {
            (value / 1e9, "Gh")
        } else if value >= 1e6 {
            (value / 1e6, "Mh")
        } else if value >= 1e3 {
            (value / 1e3, "Kh")
        } else {
            (value, "h")
        };
        write!(f, "{:.2} {}", scaled, suffix)
    }
}
