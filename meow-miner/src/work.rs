//! Work packages and solutions.
//!
//! A [`WorkPackage`] is the immutable description of one mining job as
//! handed out by a pool; a [`Solution`] is a nonce that met the boundary,
//! carrying a snapshot of the job it solves so that in-flight submissions
//! survive later work changes.

use std::time::Instant;

use crate::types::Hash256;

/// One mining job.
///
/// A package is "present" iff `header` is non-zero; an empty package means
/// "pause until new work arrives".
#[derive(Debug, Clone)]
pub struct WorkPackage {
    /// Job identifier as issued by the pool. Not necessarily a hash.
    pub job: String,
    /// Header hash to mine on.
    pub header: Hash256,
    /// Epoch seed hash.
    pub seed: Hash256,
    /// Share boundary (lower is harder).
    pub boundary: Hash256,
    /// Network-level floor boundary; zero when the pool did not send one.
    pub block_boundary: Hash256,
    /// DAG epoch, when known. Derived from `block` otherwise.
    pub epoch: Option<u32>,
    /// Block height this job builds on.
    pub block: Option<u64>,
    /// Base nonce for the search; pools prepend their extranonce here.
    pub start_nonce: u64,
    /// Number of nonce bytes owned by the pool-provided extranonce.
    pub ex_size_bytes: u16,
    /// Algorithm tag.
    pub algo: String,
}

impl Default for WorkPackage {
    fn default() -> Self {
        Self {
            job: String::new(),
            header: Hash256::ZERO,
            seed: Hash256::ZERO,
            boundary: Hash256::ZERO,
            block_boundary: Hash256::ZERO,
            epoch: None,
            block: None,
            start_nonce: 0,
            ex_size_bytes: 0,
            algo: "meowpow".to_string(),
        }
    }
}

impl WorkPackage {
    /// Whether this package describes actual work.
    pub fn is_present(&self) -> bool {
        !self.header.is_zero()
    }

    /// Effective search boundary.
    ///
    /// When the pool also sent a network floor, the easier (numerically
    /// larger) of the two wins: shares below the share boundary but above
    /// the chain's demand are worthless to everyone.
    pub fn get_boundary(&self) -> Hash256 {
        if self.block_boundary.is_zero() {
            self.boundary
        } else {
            self.boundary.max(self.block_boundary)
        }
    }
}

/// A found solution.
#[derive(Debug, Clone)]
pub struct Solution {
    /// The winning nonce.
    pub nonce: u64,
    /// Mix hash for cheap pool-side verification.
    pub mix_hash: Hash256,
    /// Snapshot of the job this solution answers.
    pub work: WorkPackage,
    /// When the solution was found.
    pub tstamp: Instant,
    /// Index of the miner that found it.
    pub miner_index: usize,
}

/// How a submitted (or dropped) solution was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolutionAccounting {
    Accepted,
    AcceptedStale,
    Rejected,
    Wasted,
    Failed,
}

/// Per-miner (and farm-wide) solution counters.
#[derive(Debug, Clone, Default)]
pub struct SolutionAccount {
    pub accepted: u32,
    pub accepted_stale: u32,
    pub rejected: u32,
    pub wasted: u32,
    pub failed: u32,
    pub last: Option<Instant>,
}

impl SolutionAccount {
    pub fn record(&mut self, what: SolutionAccounting) {
        match what {
            SolutionAccounting::Accepted => self.accepted += 1,
            SolutionAccounting::AcceptedStale => {
                self.accepted += 1;
                self.accepted_stale += 1;
            }
            SolutionAccounting::Rejected => self.rejected += 1,
            SolutionAccounting::Wasted => self.wasted += 1,
            SolutionAccounting::Failed => self.failed += 1,
        }
        self.last = Some(Instant::now());
    }

    /// Compact display form: `A12:W1:R2:F1`, omitting zero counters after
    /// the accepted count.
    pub fn summary(&self) -> String {
        let mut out = format!("A{}", self.accepted);
        if self.wasted > 0 {
            out.push_str(&format!(":W{}", self.wasted));
        }
        if self.rejected > 0 {
            out.push_str(&format!(":R{}", self.rejected));
        }
        if self.failed > 0 {
            out.push_str(&format!(":F{}", self.failed));
        }
        out
    }
}
