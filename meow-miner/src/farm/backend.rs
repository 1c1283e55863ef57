//! Compute backend abstraction.
//!
//! The farm drives search hardware through this trait without knowing
//! anything about devices, DAG layout, or kernel generation. A backend owns
//! one device; the owning miner thread calls it sequentially, so
//! implementations need no locking around search state.
//!
//! Period kernels are handled through a separate [`KernelCompiler`] handle:
//! compilation targets one of two slots while the search runs against the
//! other, so the miner can build the next period's kernel on a background
//! thread without stalling the device.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::types::Hash256;
use crate::work::WorkPackage;

/// Kernel slot index (0 or 1). Miners alternate the two slots on period
/// boundaries.
pub type KernelSlot = usize;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device out of memory: {0}")]
    InsufficientMemory(String),
    #[error("epoch initialization failed: {0}")]
    InitFailed(String),
    #[error("kernel compilation failed: {0}")]
    CompileFailed(String),
    #[error("search failed: {0}")]
    SearchFailed(String),
    #[error("fatal device error: {0}")]
    Fatal(String),
}

/// A nonce that met the boundary, as reported by a backend.
#[derive(Debug, Clone)]
pub struct FoundNonce {
    pub nonce: u64,
    pub mix_hash: Hash256,
}

/// Result of one search batch.
#[derive(Debug, Default)]
pub struct SearchBatch {
    pub found: Vec<FoundNonce>,
    /// Nonces actually evaluated; the miner advances its cursor by this.
    pub searched: u64,
}

/// Builds period kernels into slots.
///
/// Handed out once per backend and shared with the miner's compile thread.
/// Compilation and search never target the same slot concurrently; the
/// miner's exec/comp indices guarantee it.
pub trait KernelCompiler: Send + Sync {
    fn compile(&self, period_seed: u64, slot: KernelSlot) -> Result<(), BackendError>;
}

/// One search device.
pub trait ComputeBackend: Send {
    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// One-time device initialization.
    fn init_device(&mut self) -> Result<(), BackendError>;

    /// Generate the DAG for `epoch`. May take seconds.
    fn init_epoch(&mut self, epoch: u32) -> Result<(), BackendError>;

    /// The period-kernel compiler for this device. Called once at miner
    /// startup.
    fn compiler(&self) -> Arc<dyn KernelCompiler>;

    /// Search `[start_nonce, start_nonce + batch)` for solutions to `work`
    /// using the kernel in `slot`, comparing against `work.get_boundary()`.
    fn search(
        &mut self,
        slot: KernelSlot,
        work: &WorkPackage,
        start_nonce: u64,
    ) -> Result<SearchBatch, BackendError>;
}

/// Factory closure the farm uses to build one backend per miner.
pub type BackendFactory = Box<dyn Fn(usize) -> Box<dyn ComputeBackend> + Send + Sync>;

/// Record of calls made into a [`SyntheticBackend`], for tests and
/// benchmark reporting.
#[derive(Debug, Default)]
pub struct BackendProbe {
    epochs_initialized: Mutex<Vec<u32>>,
    periods_compiled: Mutex<Vec<(u64, KernelSlot)>>,
    searches: Mutex<u64>,
}

impl BackendProbe {
    pub fn epochs(&self) -> Vec<u32> {
        self.epochs_initialized.lock().unwrap().clone()
    }

    pub fn compiles(&self) -> Vec<(u64, KernelSlot)> {
        self.periods_compiled.lock().unwrap().clone()
    }

    pub fn search_count(&self) -> u64 {
        *self.searches.lock().unwrap()
    }
}

/// Deterministic software backend.
///
/// Stands in for real devices in benchmarks and tests: "finds" a solution
/// every `solution_interval` nonces without doing any real hashing. The mix
/// hash is a function of header and nonce so submissions are stable and
/// distinguishable.
pub struct SyntheticBackend {
    index: usize,
    batch: u64,
    solution_interval: u64,
    batch_delay: Duration,
    fail_epochs: Vec<u32>,
    probe: Arc<BackendProbe>,
    slots: Arc<Mutex<[Option<u64>; 2]>>,
}

impl SyntheticBackend {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            batch: 4096,
            solution_interval: 0,
            batch_delay: Duration::from_millis(2),
            fail_epochs: Vec::new(),
            probe: Arc::new(BackendProbe::default()),
            slots: Arc::new(Mutex::new([None, None])),
        }
    }

    /// Emit one solution per `interval` nonces searched. Zero disables.
    pub fn with_solution_interval(mut self, interval: u64) -> Self {
        self.solution_interval = interval;
        self
    }

    pub fn with_batch(mut self, batch: u64, delay: Duration) -> Self {
        self.batch = batch;
        self.batch_delay = delay;
        self
    }

    /// Make `init_epoch` fail with `InsufficientMemory` for these epochs.
    pub fn with_failing_epochs(mut self, epochs: Vec<u32>) -> Self {
        self.fail_epochs = epochs;
        self
    }

    pub fn probe(&self) -> Arc<BackendProbe> {
        Arc::clone(&self.probe)
    }

    fn mix_for(header: Hash256, nonce: u64) -> Hash256 {
        let mut bytes = *header.as_bytes();
        for (i, b) in nonce.to_be_bytes().iter().enumerate() {
            bytes[24 + i] ^= b;
        }
        Hash256::from_bytes(bytes)
    }
}

struct SyntheticCompiler {
    probe: Arc<BackendProbe>,
    slots: Arc<Mutex<[Option<u64>; 2]>>,
}

impl KernelCompiler for SyntheticCompiler {
    fn compile(&self, period_seed: u64, slot: KernelSlot) -> Result<(), BackendError> {
        self.slots.lock().unwrap()[slot] = Some(period_seed);
        self.probe
            .periods_compiled
            .lock()
            .unwrap()
            .push((period_seed, slot));
        Ok(())
    }
}

impl ComputeBackend for SyntheticBackend {
    fn name(&self) -> String {
        format!("synthetic{}", self.index)
    }

    fn init_device(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn init_epoch(&mut self, epoch: u32) -> Result<(), BackendError> {
        if self.fail_epochs.contains(&epoch) {
            return Err(BackendError::InsufficientMemory(format!(
                "synthetic DAG for epoch {} refused",
                epoch
            )));
        }
        self.probe.epochs_initialized.lock().unwrap().push(epoch);
        Ok(())
    }

    fn compiler(&self) -> Arc<dyn KernelCompiler> {
        Arc::new(SyntheticCompiler {
            probe: Arc::clone(&self.probe),
            slots: Arc::clone(&self.slots),
        })
    }

    fn search(
        &mut self,
        slot: KernelSlot,
        work: &WorkPackage,
        start_nonce: u64,
    ) -> Result<SearchBatch, BackendError> {
        if self.slots.lock().unwrap()[slot].is_none() {
            return Err(BackendError::SearchFailed(format!(
                "slot {} has no compiled kernel",
                slot
            )));
        }
        if !self.batch_delay.is_zero() {
            std::thread::sleep(self.batch_delay);
        }
        *self.probe.searches.lock().unwrap() += 1;

        let mut found = Vec::new();
        if self.solution_interval > 0 {
            let interval = self.solution_interval;
            let mut nonce =
                start_nonce.wrapping_add((interval - (start_nonce % interval)) % interval);
            while nonce.wrapping_sub(start_nonce) < self.batch {
                found.push(FoundNonce {
                    nonce,
                    mix_hash: Self::mix_for(work.header, nonce),
                });
                nonce = nonce.wrapping_add(interval);
            }
        }

        Ok(SearchBatch {
            found,
            searched: self.batch,
        })
    }
}
