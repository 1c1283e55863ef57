//! Miner worker threads.
//!
//! Each miner owns one [`ComputeBackend`] and runs a dedicated
//! `std::thread`: park on a condition variable until kicked, regenerate the
//! DAG on epoch changes, swap period kernels, then batch through the nonce
//! space until the work changes. Solutions are pushed straight into the
//! farm's solution channel; the async side never blocks on a miner.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::farm::backend::{BackendError, ComputeBackend, KernelCompiler, KernelSlot};
use crate::meowpow;
use crate::tracing::prelude::*;
use crate::types::HashRate;
use crate::work::{Solution, WorkPackage};

/// Reasons a miner can be paused. A miner may carry several at once; it
/// mines only when none are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    OverHeating,
    ApiRequest,
    FarmPaused,
    InsufficientMemory,
    InitEpochError,
}

impl PauseReason {
    fn bit(self) -> u8 {
        match self {
            PauseReason::OverHeating => 1 << 0,
            PauseReason::ApiRequest => 1 << 1,
            PauseReason::FarmPaused => 1 << 2,
            PauseReason::InsufficientMemory => 1 << 3,
            PauseReason::InitEpochError => 1 << 4,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            PauseReason::OverHeating => "overheating",
            PauseReason::ApiRequest => "api request",
            PauseReason::FarmPaused => "farm paused",
            PauseReason::InsufficientMemory => "insufficient memory",
            PauseReason::InitEpochError => "epoch init error",
        }
    }

    const ALL: [PauseReason; 5] = [
        PauseReason::OverHeating,
        PauseReason::ApiRequest,
        PauseReason::FarmPaused,
        PauseReason::InsufficientMemory,
        PauseReason::InitEpochError,
    ];
}

/// State shared between the miner handle and its worker thread.
struct MinerShared {
    index: usize,
    name: String,
    work: Mutex<WorkPackage>,
    signal: Condvar,
    new_work: AtomicBool,
    should_stop: AtomicBool,
    pause_bits: AtomicU8,
    hashrate: AtomicU64,
    solution_tx: mpsc::UnboundedSender<Solution>,
}

/// Handle to one miner worker.
pub struct Miner {
    shared: Arc<MinerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    /// Spawn a worker thread over `backend`.
    pub fn spawn(
        index: usize,
        mut backend: Box<dyn ComputeBackend>,
        solution_tx: mpsc::UnboundedSender<Solution>,
    ) -> Self {
        let name = backend.name();
        let shared = Arc::new(MinerShared {
            index,
            name: name.clone(),
            work: Mutex::new(WorkPackage::default()),
            signal: Condvar::new(),
            new_work: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            pause_bits: AtomicU8::new(0),
            hashrate: AtomicU64::new(0),
            solution_tx,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("miner-{}", index))
            .spawn(move || work_loop(worker_shared, backend.as_mut()))
            .expect("failed to spawn miner thread");

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Assign new work and wake the worker.
    pub fn set_work(&self, wp: WorkPackage) {
        *self.shared.work.lock().unwrap() = wp;
        self.kick();
    }

    /// Wake the worker to re-read its current work.
    pub fn kick(&self) {
        self.shared.new_work.store(true, Ordering::Release);
        self.shared.signal.notify_one();
    }

    pub fn pause(&self, reason: PauseReason) {
        self.shared.pause_bits.fetch_or(reason.bit(), Ordering::AcqRel);
        self.kick();
    }

    pub fn resume(&self, reason: PauseReason) {
        self.shared
            .pause_bits
            .fetch_and(!reason.bit(), Ordering::AcqRel);
        self.kick();
    }

    /// Whether this miner is paused for any reason.
    pub fn paused(&self) -> bool {
        self.shared.pause_bits.load(Ordering::Acquire) != 0
    }

    /// Whether the specific reason is currently set.
    pub fn pause_test(&self, reason: PauseReason) -> bool {
        self.shared.pause_bits.load(Ordering::Acquire) & reason.bit() != 0
    }

    /// Human-readable list of active pause reasons.
    pub fn paused_string(&self) -> String {
        let bits = self.shared.pause_bits.load(Ordering::Acquire);
        PauseReason::ALL
            .iter()
            .filter(|r| bits & r.bit() != 0)
            .map(|r| r.describe())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn hashrate(&self) -> HashRate {
        HashRate(self.shared.hashrate.load(Ordering::Relaxed))
    }

    /// Stop the worker and join its thread.
    pub fn stop(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
        self.kick();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Two-slot kernel management for async period compilation.
///
/// `exec_idx` always points at the slot the search runs on; `comp_idx` at
/// the slot the background thread compiles into. The indices swap on every
/// period boundary, so compilation never touches the running kernel.
struct KernelSlots {
    exec_idx: KernelSlot,
    comp_idx: KernelSlot,
    old_period: Option<u64>,
    next_period: Option<u64>,
    compile_thread: Option<JoinHandle<Result<(), BackendError>>>,
    compiler: Arc<dyn KernelCompiler>,
}

impl KernelSlots {
    fn new(compiler: Arc<dyn KernelCompiler>) -> Self {
        Self {
            exec_idx: 1,
            comp_idx: 0,
            old_period: None,
            next_period: None,
            compile_thread: None,
            compiler,
        }
    }

    fn spawn_compile(&mut self, period_seed: u64) {
        let compiler = Arc::clone(&self.compiler);
        let slot = self.comp_idx;
        self.comp_idx ^= 1;
        self.next_period = Some(period_seed);
        self.compile_thread = Some(std::thread::spawn(move || compiler.compile(period_seed, slot)));
    }

    fn join_compile(&mut self) -> Result<(), BackendError> {
        match self.compile_thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(BackendError::CompileFailed("compile thread panicked".into()))),
            None => Ok(()),
        }
    }

    /// Make the kernel for `period_seed` current. Returns false when
    /// compilation failed and the job cannot be searched.
    fn advance_to(&mut self, period_seed: u64, miner: &str) -> bool {
        if self.next_period.is_none() {
            self.spawn_compile(period_seed);
        }

        if self.old_period == Some(period_seed) {
            return true;
        }

        if let Err(e) = self.join_compile() {
            warn!(miner = %miner, error = %e, "Period kernel compilation failed");
            return false;
        }

        if self.next_period != Some(period_seed) {
            // The observed period skipped a value; recompile synchronously.
            warn!(
                miner = %miner,
                period = period_seed,
                expected = ?self.next_period,
                "Period sequence skipped, forcing synchronous recompile"
            );
            self.spawn_compile(period_seed);
            if let Err(e) = self.join_compile() {
                warn!(miner = %miner, error = %e, "Forced kernel recompile failed");
                return false;
            }
        }

        self.old_period = Some(period_seed);
        // spawn_compile toggles comp_idx after claiming a slot, so the slot
        // holding this period's kernel is the one comp_idx toggled away from.
        self.exec_idx = self.comp_idx ^ 1;
        debug!(miner = %miner, period = period_seed, "Launching period kernel");

        // Precompile the next period in the background.
        self.spawn_compile(period_seed + 1);
        true
    }
}

fn paused(shared: &MinerShared) -> bool {
    shared.pause_bits.load(Ordering::Acquire) != 0
}

fn should_stop(shared: &MinerShared) -> bool {
    shared.should_stop.load(Ordering::Acquire)
}

/// The worker loop. Runs until `should_stop`.
fn work_loop(shared: Arc<MinerShared>, backend: &mut dyn ComputeBackend) {
    let miner = shared.name.clone();

    if let Err(e) = backend.init_device() {
        match e {
            BackendError::Fatal(msg) => {
                error!(miner = %miner, error = %msg, "Fatal device error, terminating");
                std::process::exit(2);
            }
            e => {
                error!(miner = %miner, error = %e, "Device initialization failed");
                return;
            }
        }
    }

    let mut kernels = KernelSlots::new(backend.compiler());
    let mut current_epoch: Option<u32> = None;
    let mut hashes: u64 = 0;
    let mut hash_window = Instant::now();

    while !should_stop(&shared) {
        // Wait for a kick.
        if shared
            .new_work
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let guard = shared.work.lock().unwrap();
            let _unused = shared
                .signal
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap();
            continue;
        }

        if paused(&shared) {
            continue;
        }

        let w = shared.work.lock().unwrap().clone();
        if !w.is_present() {
            continue;
        }
        let block = match w.block {
            Some(block) => block,
            None => continue,
        };
        let epoch = w.epoch.unwrap_or_else(|| meowpow::epoch_from_block(block));

        // DAG regeneration on epoch change.
        if current_epoch != Some(epoch) {
            info!(miner = %miner, epoch, "Generating DAG");
            match backend.init_epoch(epoch) {
                Ok(()) => {
                    current_epoch = Some(epoch);
                    shared
                        .pause_bits
                        .fetch_and(!PauseReason::InitEpochError.bit(), Ordering::AcqRel);
                }
                Err(BackendError::InsufficientMemory(msg)) => {
                    error!(miner = %miner, epoch, error = %msg, "Not enough device memory for DAG");
                    shared
                        .pause_bits
                        .fetch_or(PauseReason::InsufficientMemory.bit(), Ordering::AcqRel);
                    continue;
                }
                Err(BackendError::Fatal(msg)) => {
                    error!(miner = %miner, error = %msg, "Fatal device error, terminating");
                    std::process::exit(2);
                }
                Err(e) => {
                    error!(miner = %miner, epoch, error = %e, "Epoch initialization failed");
                    shared
                        .pause_bits
                        .fetch_or(PauseReason::InitEpochError.bit(), Ordering::AcqRel);
                    continue;
                }
            }
            // Work may have changed while the DAG was building; the flag is
            // still set, so the next iteration picks the fresh package up.
            if shared.new_work.load(Ordering::Acquire) {
                continue;
            }
        }

        if !kernels.advance_to(meowpow::period_seed_from_block(block), &miner) {
            continue;
        }

        if w.get_boundary().upper_u64() == u64::MAX {
            // Difficulty-1 work: every hash qualifies, nothing to search.
            debug!(miner = %miner, job = %w.job, "Skipping difficulty-1 job");
            continue;
        }

        // Search until the work changes.
        let mut nonce = w.start_nonce;
        loop {
            if should_stop(&shared) || shared.new_work.load(Ordering::Acquire) || paused(&shared) {
                break;
            }

            match backend.search(kernels.exec_idx, &w, nonce) {
                Ok(batch) => {
                    for f in &batch.found {
                        debug!(
                            miner = %miner,
                            job = %w.job,
                            nonce = format!("{:#018x}", f.nonce),
                            "Solution found"
                        );
                        let _ = shared.solution_tx.send(Solution {
                            nonce: f.nonce,
                            mix_hash: f.mix_hash,
                            work: w.clone(),
                            tstamp: Instant::now(),
                            miner_index: shared.index,
                        });
                    }
                    nonce = nonce.wrapping_add(batch.searched);
                    hashes += batch.searched;
                }
                Err(BackendError::Fatal(msg)) => {
                    error!(miner = %miner, error = %msg, "Fatal device error, terminating");
                    std::process::exit(2);
                }
                Err(e) => {
                    warn!(miner = %miner, error = %e, "Search failed, waiting for new work");
                    break;
                }
            }

            let elapsed = hash_window.elapsed();
            if elapsed >= Duration::from_secs(1) {
                let rate = (hashes as f64 / elapsed.as_secs_f64()) as u64;
                shared.hashrate.store(rate, Ordering::Relaxed);
                hashes = 0;
                hash_window = Instant::now();
            }
        }
    }

    trace!(miner = %miner, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::backend::SyntheticBackend;
    use crate::meowpow::{EPOCH_LENGTH, PERIOD_LENGTH};
    use crate::types::Hash256;

    fn test_work(block: u64) -> WorkPackage {
        WorkPackage {
            job: format!("job-{}", block),
            header: Hash256::from_hex("0x1111").unwrap(),
            boundary: Hash256::from_hex(
                "0x00ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            )
            .unwrap(),
            epoch: Some(meowpow::epoch_from_block(block)),
            block: Some(block),
            ..WorkPackage::default()
        }
    }

    fn wait_for<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_miner_finds_solutions() {
        let backend = SyntheticBackend::new(0)
            .with_solution_interval(500)
            .with_batch(1024, Duration::from_millis(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(0, Box::new(backend), tx);

        miner.set_work(test_work(30));

        let sol = wait_for(|| rx.try_recv().is_ok(), Duration::from_secs(5));
        assert!(sol, "miner should have produced a solution");
        miner.stop();
    }

    #[test]
    fn test_solution_carries_work_snapshot() {
        let backend = SyntheticBackend::new(0)
            .with_solution_interval(100)
            .with_batch(1024, Duration::from_millis(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(3, Box::new(backend), tx);

        miner.set_work(test_work(60));

        let mut got = None;
        assert!(wait_for(
            || {
                if let Ok(sol) = rx.try_recv() {
                    got = Some(sol);
                    true
                } else {
                    false
                }
            },
            Duration::from_secs(5)
        ));
        let sol = got.unwrap();
        assert_eq!(sol.miner_index, 3);
        assert_eq!(sol.work.job, "job-60");
        assert_eq!(sol.work.block, Some(60));
    }

    #[test]
    fn test_epoch_change_regenerates_dag() {
        let backend = SyntheticBackend::new(0).with_batch(256, Duration::from_millis(1));
        let probe = backend.probe();
        let (tx, _rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(0, Box::new(backend), tx);

        miner.set_work(test_work(10));
        assert!(wait_for(
            || probe.epochs() == vec![0],
            Duration::from_secs(5)
        ));

        miner.set_work(test_work(EPOCH_LENGTH * 11));
        assert!(wait_for(
            || probe.epochs() == vec![0, 11],
            Duration::from_secs(5)
        ));
        miner.stop();
    }

    #[test]
    fn test_insufficient_memory_sets_sticky_pause() {
        let backend = SyntheticBackend::new(0)
            .with_failing_epochs(vec![11])
            .with_batch(256, Duration::from_millis(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(0, Box::new(backend), tx);

        miner.set_work(test_work(EPOCH_LENGTH * 11));
        assert!(wait_for(
            || miner.pause_test(PauseReason::InsufficientMemory),
            Duration::from_secs(5)
        ));
        assert!(miner.paused());
        assert_eq!(miner.paused_string(), "insufficient memory");
        miner.stop();
    }

    #[test]
    fn test_period_kernels_alternate_slots() {
        let backend = SyntheticBackend::new(0).with_batch(256, Duration::from_millis(1));
        let probe = backend.probe();
        let (tx, _rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(0, Box::new(backend), tx);

        // Block 0 is period 0; the miner compiles period 0 then precompiles 1.
        miner.set_work(test_work(0));
        assert!(wait_for(
            || probe.compiles().len() >= 2,
            Duration::from_secs(5)
        ));

        // Next period boundary: the precompiled kernel is promoted and
        // period 2 compilation starts.
        miner.set_work(test_work(PERIOD_LENGTH));
        assert!(wait_for(
            || probe.compiles().len() >= 3,
            Duration::from_secs(5)
        ));

        let compiles = probe.compiles();
        assert_eq!(compiles[0].0, 0);
        assert_eq!(compiles[1].0, 1);
        assert_eq!(compiles[2].0, 2);
        // Consecutive compilations target alternating slots.
        assert_ne!(compiles[0].1, compiles[1].1);
        assert_ne!(compiles[1].1, compiles[2].1);
        miner.stop();
    }

    #[test]
    fn test_skipped_period_forces_recompile() {
        let backend = SyntheticBackend::new(0).with_batch(256, Duration::from_millis(1));
        let probe = backend.probe();
        let (tx, _rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(0, Box::new(backend), tx);

        miner.set_work(test_work(0));
        assert!(wait_for(
            || probe.compiles().len() >= 2,
            Duration::from_secs(5)
        ));

        // Jump several periods ahead; the precompiled period 1 kernel is
        // useless and a synchronous recompile of period 10 must happen.
        miner.set_work(test_work(PERIOD_LENGTH * 10));
        assert!(wait_for(
            || probe.compiles().iter().any(|(p, _)| *p == 10),
            Duration::from_secs(5)
        ));
        assert!(wait_for(
            || probe.compiles().iter().any(|(p, _)| *p == 11),
            Duration::from_secs(5)
        ));
        miner.stop();
    }

    #[test]
    fn test_difficulty_one_job_not_searched() {
        let backend = SyntheticBackend::new(0).with_batch(256, Duration::ZERO);
        let probe = backend.probe();
        let (tx, _rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(0, Box::new(backend), tx);

        let mut w = test_work(10);
        w.boundary = Hash256::from_bytes([0xff; 32]);
        miner.set_work(w);

        // The DAG still gets built, but no searches run.
        assert!(wait_for(
            || probe.epochs() == vec![0],
            Duration::from_secs(5)
        ));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(probe.search_count(), 0);
        miner.stop();
    }

    #[test]
    fn test_pause_resume_bits() {
        let backend = SyntheticBackend::new(0).with_batch(256, Duration::from_millis(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let miner = Miner::spawn(0, Box::new(backend), tx);

        assert!(!miner.paused());
        miner.pause(PauseReason::FarmPaused);
        miner.pause(PauseReason::OverHeating);
        assert!(miner.paused());
        assert!(miner.pause_test(PauseReason::FarmPaused));
        assert_eq!(miner.paused_string(), "overheating, farm paused");

        miner.resume(PauseReason::FarmPaused);
        assert!(miner.paused());
        miner.resume(PauseReason::OverHeating);
        assert!(!miner.paused());
        miner.stop();
    }
}
