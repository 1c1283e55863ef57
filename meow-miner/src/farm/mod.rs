//! Work distribution across miners.
//!
//! The [`Farm`] owns the miner set, fans fresh work out with per-miner
//! start-nonce segments, aggregates hashrate and solution accounting, and
//! funnels found solutions into a single channel for the pool manager.
//! It is an explicitly-passed cloneable handle; tests run several isolated
//! farms side by side.

mod backend;
mod miner;

pub use backend::{
    BackendError, BackendFactory, BackendProbe, ComputeBackend, FoundNonce, KernelCompiler,
    KernelSlot, SearchBatch, SyntheticBackend,
};
pub use miner::{Miner, PauseReason};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::tracing::prelude::*;
use crate::types::HashRate;
use crate::work::{Solution, SolutionAccount, SolutionAccounting, WorkPackage};

/// Farm configuration.
#[derive(Debug, Clone)]
pub struct FarmSettings {
    /// Number of miners to spawn.
    pub miner_count: usize,
    /// Low bits of nonce space owned by each miner; `None` derives
    /// `log2(miner_count) + 8`.
    pub segment_width: Option<u32>,
    /// Re-randomize the nonce scrambler on every pool connection.
    pub shuffle_on_connect: bool,
}

impl Default for FarmSettings {
    fn default() -> Self {
        Self {
            miner_count: 1,
            segment_width: None,
            shuffle_on_connect: false,
        }
    }
}

struct FarmInner {
    settings: FarmSettings,
    factory: BackendFactory,
    miners: Mutex<Vec<Arc<Miner>>>,
    solution_tx: Mutex<Option<mpsc::UnboundedSender<Solution>>>,
    accounting: Mutex<Accounting>,
    current: Mutex<WorkPackage>,
    nonce_scrambler: AtomicU64,
    segment_width: u32,
    mining: AtomicBool,
    paused: AtomicBool,
}

#[derive(Default)]
struct Accounting {
    farm: SolutionAccount,
    miners: Vec<SolutionAccount>,
}

/// Cloneable handle to one farm.
#[derive(Clone)]
pub struct Farm {
    inner: Arc<FarmInner>,
}

impl Farm {
    pub fn new(settings: FarmSettings, factory: BackendFactory) -> Self {
        let miner_count = settings.miner_count.max(1);
        let segment_width = settings
            .segment_width
            .unwrap_or_else(|| (miner_count as f64).log2().ceil() as u32 + 8);
        let accounting = Accounting {
            farm: SolutionAccount::default(),
            miners: vec![SolutionAccount::default(); miner_count],
        };
        Self {
            inner: Arc::new(FarmInner {
                settings,
                factory,
                miners: Mutex::new(Vec::new()),
                solution_tx: Mutex::new(None),
                accounting: Mutex::new(accounting),
                current: Mutex::new(WorkPackage::default()),
                nonce_scrambler: AtomicU64::new(rand::random()),
                segment_width,
                mining: AtomicBool::new(false),
                paused: AtomicBool::new(false),
            }),
        }
    }

    /// Install the channel found solutions are forwarded into. Must be set
    /// before `start`; solutions found without a sink are dropped.
    pub fn set_solution_sink(&self, tx: mpsc::UnboundedSender<Solution>) {
        *self.inner.solution_tx.lock().unwrap() = Some(tx);
    }

    /// Spin up the miner threads. No-op while already mining.
    pub fn start(&self) {
        if self.inner.mining.swap(true, Ordering::AcqRel) {
            return;
        }
        let tx = self.inner.solution_tx.lock().unwrap().clone().unwrap_or_else(|| {
            warn!("No solution sink installed, found solutions will be dropped");
            let (tx, _rx) = mpsc::unbounded_channel();
            tx
        });

        let count = self.inner.settings.miner_count.max(1);
        let mut miners = self.inner.miners.lock().unwrap();
        for index in 0..count {
            let backend = (self.inner.factory)(index);
            miners.push(Arc::new(Miner::spawn(index, backend, tx.clone())));
        }
        info!(miners = count, "Farm started");
    }

    /// Stop and join all miners. No-op when not mining.
    pub fn stop(&self) {
        if !self.inner.mining.swap(false, Ordering::AcqRel) {
            return;
        }
        let miners = std::mem::take(&mut *self.inner.miners.lock().unwrap());
        for miner in &miners {
            miner.stop();
        }
        self.inner.paused.store(false, Ordering::Release);
        info!("Farm stopped");
    }

    pub fn is_mining(&self) -> bool {
        self.inner.mining.load(Ordering::Acquire)
    }

    /// Suspend all miners (used while no pool connection is available).
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            for miner in self.inner.miners.lock().unwrap().iter() {
                miner.pause(PauseReason::FarmPaused);
            }
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            for miner in self.inner.miners.lock().unwrap().iter() {
                miner.resume(PauseReason::FarmPaused);
            }
        }
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Distribute a work package across the miners.
    ///
    /// Each miner gets the package with its own start nonce: the
    /// pool-provided base when the pool reserved extranonce bytes, else the
    /// base mixed with the farm's scrambler salt, offset by the miner's
    /// segment.
    pub fn set_work(&self, wp: WorkPackage) {
        *self.inner.current.lock().unwrap() = wp.clone();

        let base = if wp.ex_size_bytes > 0 {
            wp.start_nonce
        } else {
            wp.start_nonce ^ self.inner.nonce_scrambler.load(Ordering::Relaxed)
        };

        for miner in self.inner.miners.lock().unwrap().iter() {
            let mut per_miner = wp.clone();
            per_miner.start_nonce =
                base.wrapping_add((miner.index() as u64) << self.inner.segment_width);
            miner.set_work(per_miner);
        }
    }

    /// Re-randomize the nonce scrambler.
    pub fn shuffle(&self) {
        self.inner
            .nonce_scrambler
            .store(rand::random(), Ordering::Relaxed);
    }

    /// Whether connection-time shuffling is configured.
    pub fn shuffle_on_connect(&self) -> bool {
        self.inner.settings.shuffle_on_connect
    }

    pub fn nonce_scrambler(&self) -> u64 {
        self.inner.nonce_scrambler.load(Ordering::Relaxed)
    }

    pub fn segment_width(&self) -> u32 {
        self.inner.segment_width
    }

    /// Aggregate hashrate over all miners.
    pub fn hashrate(&self) -> HashRate {
        self.inner
            .miners
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.hashrate())
            .sum()
    }

    /// Forward a solution into the sink (miners normally hold a sender of
    /// their own; this is for external backends and tests).
    pub fn submit_proof(&self, solution: Solution) {
        if let Some(tx) = self.inner.solution_tx.lock().unwrap().as_ref() {
            let _ = tx.send(solution);
        }
    }

    /// Record the outcome of a submitted (or dropped) solution.
    pub fn account_solution(&self, miner_index: usize, what: SolutionAccounting) {
        let mut acct = self.inner.accounting.lock().unwrap();
        acct.farm.record(what);
        if let Some(miner) = acct.miners.get_mut(miner_index) {
            miner.record(what);
        }
    }

    /// Farm-wide solution counters.
    pub fn solutions(&self) -> SolutionAccount {
        self.inner.accounting.lock().unwrap().farm.clone()
    }

    /// Per-miner solution counters.
    pub fn miner_solutions(&self, miner_index: usize) -> Option<SolutionAccount> {
        self.inner
            .accounting
            .lock()
            .unwrap()
            .miners
            .get(miner_index)
            .cloned()
    }

    /// One-line progress summary: solutions, speed, per-miner speeds.
    pub fn telemetry(&self) -> String {
        let solutions = self.solutions().summary();
        let rate = self.hashrate();
        let miners = self.inner.miners.lock().unwrap();
        let per_miner = miners
            .iter()
            .map(|m| {
                let tag = if m.paused() { "!" } else { "" };
                format!("m{}{} {}", m.index(), tag, m.hashrate())
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} {} - {}", solutions, rate, per_miner)
    }

    /// Access to the miner handles (pause flags, per-miner state).
    pub fn miners(&self) -> Vec<Arc<Miner>> {
        self.inner.miners.lock().unwrap().clone()
    }
}
