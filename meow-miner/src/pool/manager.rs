//! Pool connection lifecycle.
//!
//! The manager owns the ordered connection list and exactly one live
//! protocol client. All mutable session state (`current` work, attempt
//! counting, the client binding, both timers) is confined to one spawned
//! task — the strand — which consumes client events, farm solutions, and
//! handle commands from channels. Handle methods only touch atomics and
//! the mutex-guarded connection list, so they can be called from anywhere.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{EndpointError, HostNameType, PoolEndpoint, ProtocolFamily};
use crate::farm::Farm;
use crate::meowpow;
use crate::pool::client::{ClientEvent, PoolClient};
use crate::pool::getwork::GetworkClient;
use crate::pool::simulate::SimulateClient;
use crate::pool::stratum::StratumClient;
use crate::tracing::prelude::*;
use crate::types::{format_hashes, hashes_to_target, Hash256};
use crate::work::{Solution, SolutionAccounting, WorkPackage};

/// Manager configuration. All durations are real durations; the
/// environment layer converts from the documented units.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Cadence of `eth_getWork` polling.
    pub get_work_poll_interval: Duration,
    /// Disconnect when no new job arrives within this window.
    pub no_work_timeout: Duration,
    /// Disconnect when a request awaits its reply longer than this.
    pub no_response_timeout: Duration,
    /// Return to the primary pool after this long on a failover; zero
    /// stays on the failover forever.
    pub pool_failover_timeout: Duration,
    /// Periodically report hashrate to the pool.
    pub report_hashrate: bool,
    /// Interval between hashrate submissions.
    pub hash_rate_interval: Duration,
    /// Identifier sent with hashrate submissions.
    pub hash_rate_id: String,
    /// Connection attempts per endpoint before rotating to the next.
    pub connection_max_retries: u32,
    /// Block number used by the simulator.
    pub benchmark_block: u64,
    /// Difficulty used by the simulator.
    pub benchmark_diff: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            get_work_poll_interval: Duration::from_millis(1000),
            no_work_timeout: Duration::from_secs(100_000),
            no_response_timeout: Duration::from_secs(2),
            pool_failover_timeout: Duration::ZERO,
            report_hashrate: false,
            hash_rate_interval: Duration::from_secs(60),
            hash_rate_id: Hash256::random().to_hex(),
            connection_max_retries: 9000,
            benchmark_block: 0,
            benchmark_diff: 1.0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("manager already running")]
    AlreadyRunning,
    #[error("outstanding operations, retry")]
    Busy,
    #[error("index out of bounds")]
    OutOfBounds,
    #[error("cannot remove the active connection")]
    ActiveConnection,
    #[error("no connection matches")]
    NotFound,
}

enum ManagerCommand {
    Disconnect,
    Stop,
}

struct ConnState {
    list: Vec<Arc<PoolEndpoint>>,
    active_idx: usize,
}

enum Selection {
    Connect(Arc<PoolEndpoint>),
    Terminate,
}

/// Apply the rotation policy to the connection list.
///
/// First match wins: an unrecoverable endpoint is dropped outright;
/// exhausted retries advance to the next endpoint (or reset in place when
/// it is the only one); otherwise the same endpoint is retried. Returns
/// the selection and how many connection switches the step performed.
fn rotate_selection(
    conns: &mut ConnState,
    attempt_count: &mut u32,
    max_retries: u32,
) -> (Selection, u32) {
    let mut switches = 0;

    if conns.active_idx >= conns.list.len() {
        conns.active_idx = 0;
    }

    if let Some(endpoint) = conns.list.get(conns.active_idx) {
        if endpoint.is_unrecoverable() {
            let dropped = conns.list.remove(conns.active_idx);
            warn!(pool = %dropped.str(), "Discarding unrecoverable pool");
            *attempt_count = 0;
            if conns.active_idx >= conns.list.len() {
                conns.active_idx = 0;
            }
            switches += 1;
        } else if *attempt_count >= max_retries {
            if conns.list.len() == 1 {
                // Only one endpoint: keep retrying it forever.
                *attempt_count = 0;
            } else {
                *attempt_count = 0;
                conns.active_idx += 1;
                if conns.active_idx >= conns.list.len() {
                    conns.active_idx = 0;
                }
                switches += 1;
            }
        }
    }

    if conns.list.is_empty() {
        return (Selection::Terminate, switches);
    }
    let endpoint = &conns.list[conns.active_idx];
    if endpoint.host() == "exit" {
        return (Selection::Terminate, switches);
    }
    (Selection::Connect(Arc::clone(endpoint)), switches)
}

struct Inner {
    settings: PoolSettings,
    farm: Farm,
    conns: Mutex<ConnState>,
    attempt_count: AtomicU32,
    connection_switches: AtomicU32,
    epoch_changes: AtomicU32,
    running: AtomicBool,
    stopping: AtomicBool,
    async_pending: AtomicBool,
    connected: AtomicBool,
    current: Mutex<WorkPackage>,
    selected_host: Mutex<String>,
    exit: CancellationToken,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<ManagerCommand>>>,
}

impl Inner {
    fn send_command(&self, cmd: ManagerCommand) {
        if let Some(tx) = self.cmd_tx.lock().unwrap().as_ref() {
            let _ = tx.send(cmd);
        }
    }
}

/// The connection policy engine.
pub struct PoolManager {
    inner: Arc<Inner>,
    solution_rx: Mutex<Option<mpsc::UnboundedReceiver<Solution>>>,
}

impl PoolManager {
    /// Build a manager over `farm`. Installs itself as the farm's solution
    /// sink.
    pub fn new(settings: PoolSettings, farm: Farm) -> Self {
        let (solution_tx, solution_rx) = mpsc::unbounded_channel();
        farm.set_solution_sink(solution_tx);
        Self {
            inner: Arc::new(Inner {
                settings,
                farm,
                conns: Mutex::new(ConnState {
                    list: Vec::new(),
                    active_idx: 0,
                }),
                attempt_count: AtomicU32::new(0),
                connection_switches: AtomicU32::new(0),
                epoch_changes: AtomicU32::new(0),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                async_pending: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                current: Mutex::new(WorkPackage::default()),
                selected_host: Mutex::new(String::new()),
                exit: CancellationToken::new(),
                cmd_tx: Mutex::new(None),
            }),
            solution_rx: Mutex::new(Some(solution_rx)),
        }
    }

    /// Start connecting. Valid exactly once per manager lifetime.
    pub fn start(&self) -> Result<(), ManagerError> {
        let solution_rx = self
            .solution_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ManagerError::AlreadyRunning)?;
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ManagerError::AlreadyRunning);
        }

        self.inner.async_pending.store(true, Ordering::Release);
        self.inner.connection_switches.fetch_add(1, Ordering::Relaxed);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.inner.cmd_tx.lock().unwrap() = Some(cmd_tx);

        tokio::spawn(run_strand(Arc::clone(&self.inner), cmd_rx, solution_rx));
        Ok(())
    }

    /// Stop and wait for the strand to wind down. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.load(Ordering::Acquire) {
            return;
        }
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.async_pending.store(true, Ordering::Release);
        self.inner.send_command(ManagerCommand::Stop);

        while self.inner.running.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn add_connection(&self, endpoint: PoolEndpoint) {
        self.inner
            .conns
            .lock()
            .unwrap()
            .list
            .push(Arc::new(endpoint));
    }

    pub fn add_connection_str(&self, uri: &str) -> Result<(), EndpointError> {
        let endpoint = PoolEndpoint::parse(uri)?;
        self.add_connection(endpoint);
        Ok(())
    }

    /// Remove the endpoint at `idx`. The active connection cannot be
    /// removed, and reconfiguration is refused while another one is in
    /// flight.
    pub fn remove_connection(&self, idx: usize) -> Result<(), ManagerError> {
        if self.inner.async_pending.load(Ordering::Acquire) {
            return Err(ManagerError::Busy);
        }
        let mut conns = self.inner.conns.lock().unwrap();
        if idx >= conns.list.len() {
            return Err(ManagerError::OutOfBounds);
        }
        if idx == conns.active_idx {
            return Err(ManagerError::ActiveConnection);
        }
        conns.list.remove(idx);
        if conns.active_idx > idx {
            conns.active_idx -= 1;
        }
        Ok(())
    }

    /// Make `idx` the active connection by disconnecting the current one;
    /// the rotation lands on the requested index.
    pub fn set_active_connection(&self, idx: usize) -> Result<(), ManagerError> {
        let conns = self.inner.conns.lock().unwrap();
        if idx >= conns.list.len() {
            return Err(ManagerError::OutOfBounds);
        }
        drop(conns);
        self.set_active_common(idx)
    }

    /// Locate an endpoint by its canonical string, case-insensitively, and
    /// make it active.
    pub fn set_active_connection_str(&self, uri: &str) -> Result<(), ManagerError> {
        let idx = {
            let conns = self.inner.conns.lock().unwrap();
            conns
                .list
                .iter()
                .position(|endpoint| endpoint.str().eq_ignore_ascii_case(uri))
        };
        match idx {
            Some(idx) => self.set_active_common(idx),
            None => Err(ManagerError::NotFound),
        }
    }

    fn set_active_common(&self, idx: usize) -> Result<(), ManagerError> {
        if self
            .inner
            .async_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ManagerError::Busy);
        }

        let mut conns = self.inner.conns.lock().unwrap();
        if idx != conns.active_idx {
            self.inner.connection_switches.fetch_add(1, Ordering::Relaxed);
            conns.active_idx = idx;
            self.inner.attempt_count.store(0, Ordering::Relaxed);
            drop(conns);
            self.inner.send_command(ManagerCommand::Disconnect);
        } else {
            // Nothing to do; release the guard immediately.
            self.inner.async_pending.store(false, Ordering::Release);
        }
        Ok(())
    }

    pub fn get_active_connection(&self) -> Option<Arc<PoolEndpoint>> {
        let conns = self.inner.conns.lock().unwrap();
        conns.list.get(conns.active_idx).cloned()
    }

    /// The configured connections as JSON: `[{index, active, uri}]`.
    pub fn get_connections_json(&self) -> Value {
        let conns = self.inner.conns.lock().unwrap();
        Value::Array(
            conns
                .list
                .iter()
                .enumerate()
                .map(|(i, endpoint)| {
                    json!({
                        "index": i,
                        "active": i == conns.active_idx,
                        "uri": endpoint.str(),
                    })
                })
                .collect(),
        )
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn get_current_epoch(&self) -> Option<u32> {
        self.inner.current.lock().unwrap().epoch
    }

    /// Difficulty of the current work, in expected hashes per solution.
    pub fn get_current_difficulty(&self) -> f64 {
        let current = self.inner.current.lock().unwrap();
        if !current.is_present() {
            return 0.0;
        }
        hashes_to_target(current.boundary)
    }

    pub fn get_connection_switches(&self) -> u32 {
        self.inner.connection_switches.load(Ordering::Relaxed)
    }

    pub fn get_epoch_changes(&self) -> u32 {
        self.inner.epoch_changes.load(Ordering::Relaxed)
    }

    /// Snapshot of the work currently being mined.
    pub fn current_work(&self) -> WorkPackage {
        self.inner.current.lock().unwrap().clone()
    }

    /// Fires when the manager terminated through the `"exit"` sentinel or
    /// by exhausting its endpoints; the process should exit non-zero.
    pub fn exited(&self) -> CancellationToken {
        self.inner.exit.clone()
    }
}

fn build_client(settings: &PoolSettings, endpoint: &PoolEndpoint) -> Box<dyn PoolClient> {
    match endpoint.family() {
        ProtocolFamily::Stratum => Box::new(StratumClient::new(
            settings.no_work_timeout,
            settings.no_response_timeout,
        )),
        ProtocolFamily::Getwork => Box::new(GetworkClient::new(
            settings.no_work_timeout,
            settings.get_work_poll_interval,
        )),
        ProtocolFamily::Simulation => Box::new(SimulateClient::new(
            settings.benchmark_block,
            settings.benchmark_diff,
        )),
    }
}

/// The serialized event loop. Owns the client, its event stream, and both
/// timers; runs until stop or termination.
async fn run_strand(
    inner: Arc<Inner>,
    mut cmd_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    mut solution_rx: mpsc::UnboundedReceiver<Solution>,
) {
    let mut client: Option<Box<dyn PoolClient>> = None;
    let mut events: Option<mpsc::Receiver<ClientEvent>> = None;
    let mut failover_deadline: Option<Instant> = None;
    let mut hashrate_deadline: Option<Instant> = None;

    if !rotate_connect(&inner, &mut client, &mut events).await {
        return;
    }

    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => match cmd {
                ManagerCommand::Disconnect => {
                    if let Some(c) = client.as_mut() {
                        c.disconnect().await;
                    }
                }
                ManagerCommand::Stop => {
                    let connected = client.as_ref().map(|c| c.is_connected()).unwrap_or(false);
                    if let Some(c) = client.as_mut() {
                        c.disconnect().await;
                    }
                    if !connected {
                        // Nothing to wait for; wind down here.
                        finish_stop(&inner);
                        return;
                    }
                    // Otherwise the Disconnected event completes the stop.
                }
            },

            maybe_event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match maybe_event {
                Some(ClientEvent::Connected) => {
                    on_connected(
                        &inner,
                        client.as_deref(),
                        &mut failover_deadline,
                        &mut hashrate_deadline,
                    );
                }
                Some(ClientEvent::Disconnected) => {
                    inner.connected.store(false, Ordering::Release);
                    info!(pool = %inner.selected_host.lock().unwrap().clone(), "Disconnected");

                    if let Some(c) = client.as_mut() {
                        c.unset_connection();
                    }
                    client = None;
                    events = None;
                    failover_deadline = None;
                    hashrate_deadline = None;
                    *inner.current.lock().unwrap() = WorkPackage::default();

                    if inner.stopping.load(Ordering::Acquire) {
                        finish_stop(&inner);
                        return;
                    }

                    inner.async_pending.store(true, Ordering::Release);
                    info!("No connection. Suspend mining ...");
                    inner.farm.pause();
                    if !rotate_connect(&inner, &mut client, &mut events).await {
                        return;
                    }
                }
                Some(ClientEvent::WorkReceived(wp)) => {
                    on_work_received(&inner, wp);
                }
                Some(ClientEvent::SolutionAccepted { delay, miner_index, stale }) => {
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        pool = %inner.selected_host.lock().unwrap().clone(),
                        stale,
                        "**Accepted"
                    );
                    let what = if stale {
                        SolutionAccounting::AcceptedStale
                    } else {
                        SolutionAccounting::Accepted
                    };
                    inner.farm.account_solution(miner_index, what);
                }
                Some(ClientEvent::SolutionRejected { delay, miner_index }) => {
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        pool = %inner.selected_host.lock().unwrap().clone(),
                        "**Rejected"
                    );
                    inner.farm.account_solution(miner_index, SolutionAccounting::Rejected);
                }
                None => {
                    // A client must end with Disconnected; a closed channel
                    // without one means the task died. Treat it the same.
                    warn!("Client event channel closed unexpectedly");
                    events = None;
                }
            },

            Some(solution) = solution_rx.recv() => {
                let connected = client.as_ref().map(|c| c.is_connected()).unwrap_or(false);
                if connected {
                    if let Some(c) = client.as_ref() {
                        c.submit_solution(solution).await;
                    }
                } else {
                    info!(
                        nonce = format!("{:#018x}", solution.nonce),
                        "Solution wasted. Waiting for connection ..."
                    );
                }
            },

            _ = async {
                match failover_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            } => {
                failover_deadline = None;
                if inner.running.load(Ordering::Acquire) {
                    let switch = {
                        let mut conns = inner.conns.lock().unwrap();
                        if conns.active_idx != 0 {
                            conns.active_idx = 0;
                            inner.attempt_count.store(0, Ordering::Relaxed);
                            inner.connection_switches.fetch_add(1, Ordering::Relaxed);
                            true
                        } else {
                            false
                        }
                    };
                    if switch {
                        info!("Failover timeout reached, retrying connection to primary pool");
                        if let Some(c) = client.as_mut() {
                            c.disconnect().await;
                        }
                    }
                }
            },

            _ = async {
                match hashrate_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            } => {
                hashrate_deadline = Some(Instant::now() + inner.settings.hash_rate_interval);
                if let Some(c) = client.as_ref() {
                    if c.is_connected() {
                        c.submit_hashrate(
                            inner.farm.hashrate().into(),
                            &inner.settings.hash_rate_id,
                        )
                        .await;
                    }
                }
            },
        }
    }
}

/// Select the next endpoint and start its client. Returns false when the
/// strand should terminate (exit sentinel or exhausted list).
async fn rotate_connect(
    inner: &Arc<Inner>,
    client: &mut Option<Box<dyn PoolClient>>,
    events: &mut Option<mpsc::Receiver<ClientEvent>>,
) -> bool {
    if client.as_ref().map(|c| c.is_connected()).unwrap_or(false) {
        return true;
    }

    let selection = {
        let mut conns = inner.conns.lock().unwrap();
        let mut attempt = inner.attempt_count.load(Ordering::Relaxed);
        let (selection, switches) = rotate_selection(
            &mut conns,
            &mut attempt,
            inner.settings.connection_max_retries,
        );
        inner.attempt_count.store(attempt, Ordering::Relaxed);
        if switches > 0 {
            inner
                .connection_switches
                .fetch_add(switches, Ordering::Relaxed);
        }
        selection
    };

    match selection {
        Selection::Connect(endpoint) => {
            let mut new_client = build_client(&inner.settings, &endpoint);
            new_client.set_connection(Arc::clone(&endpoint));
            *events = new_client.take_event_receiver();

            inner.attempt_count.fetch_add(1, Ordering::Relaxed);
            let host = format!("{}:{}", endpoint.host(), endpoint.port());
            *inner.selected_host.lock().unwrap() = host.clone();
            info!(pool = %host, "Selected pool");

            new_client.connect().await;
            *client = Some(new_client);
            true
        }
        Selection::Terminate => {
            let empty = inner.conns.lock().unwrap().list.is_empty();
            if empty {
                info!("No more connections to try. Exiting ...");
            } else {
                info!("'exit' failover just got hit. Exiting ...");
            }
            if inner.farm.is_mining() {
                info!("Shutting down miners ...");
                inner.farm.stop();
            }
            inner.running.store(false, Ordering::Release);
            inner.exit.cancel();
            false
        }
    }
}

fn on_connected(
    inner: &Arc<Inner>,
    client: Option<&dyn PoolClient>,
    failover_deadline: &mut Option<Instant>,
    hashrate_deadline: &mut Option<Instant>,
) {
    inner.connected.store(true, Ordering::Release);

    // Append the resolved address for hosts that needed resolving.
    if let Some(c) = client {
        let needs_endpoint = c
            .connection()
            .map(|endpoint| {
                matches!(
                    endpoint.host_name_type(),
                    HostNameType::Dns | HostNameType::Basic
                )
            })
            .unwrap_or(false);
        if needs_endpoint {
            if let Some(addr) = c.active_endpoint() {
                let mut host = inner.selected_host.lock().unwrap();
                *host = format!("{} ({})", host, addr);
            }
        }
    }
    info!(pool = %inner.selected_host.lock().unwrap().clone(), "Established connection");

    *inner.current.lock().unwrap() = WorkPackage::default();

    if inner.farm.shuffle_on_connect() {
        inner.farm.shuffle();
    }

    if !inner.farm.is_mining() {
        info!("Spinning up miners ...");
        inner.farm.start();
    } else if inner.farm.paused() {
        info!("Resume mining ...");
        inner.farm.resume();
    }

    // Primary-pool reaffinity: cancelled and re-armed on every connect.
    let active_idx = inner.conns.lock().unwrap().active_idx;
    *failover_deadline =
        if active_idx != 0 && !inner.settings.pool_failover_timeout.is_zero() {
            Some(Instant::now() + inner.settings.pool_failover_timeout)
        } else {
            None
        };

    *hashrate_deadline = if inner.settings.report_hashrate {
        Some(Instant::now() + inner.settings.hash_rate_interval)
    } else {
        None
    };

    inner.async_pending.store(false, Ordering::Release);
}

fn on_work_received(inner: &Arc<Inner>, mut wp: WorkPackage) {
    if !wp.is_present() || wp.block.is_none() {
        warn!("Invalid work package received");
        return;
    }

    if wp.epoch.is_none() {
        wp.epoch = Some(meowpow::epoch_from_block(wp.block.unwrap_or_default()));
    }

    let (new_epoch, new_diff) = {
        let current = inner.current.lock().unwrap();
        if !current.is_present() {
            (true, true)
        } else {
            (
                current.epoch != wp.epoch,
                current.get_boundary() != wp.get_boundary(),
            )
        }
    };

    *inner.current.lock().unwrap() = wp.clone();

    if new_epoch {
        inner.epoch_changes.fetch_add(1, Ordering::Relaxed);
    }
    if new_epoch || new_diff {
        info!(
            epoch = wp.epoch.unwrap_or_default(),
            difficulty = %format_hashes(hashes_to_target(wp.get_boundary())),
            "Mining at"
        );
    }

    info!(
        job = %wp.header.abridged(),
        block = wp.block.unwrap_or_default(),
        pool = %inner.selected_host.lock().unwrap().clone(),
        "Job"
    );

    inner.farm.set_work(wp);
}

fn finish_stop(inner: &Arc<Inner>) {
    if inner.farm.is_mining() {
        info!("Shutting down miners ...");
        inner.farm.stop();
    }
    inner.connected.store(false, Ordering::Release);
    inner.running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::{FarmSettings, SyntheticBackend};
    use crate::meowpow::EPOCH_LENGTH;
    use crate::pool::testpool::{notify_params, MockPool, PoolScript, SubmitReply};

    const HEADER: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";
    const SEED0: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

    fn quiet_farm() -> Farm {
        Farm::new(
            FarmSettings {
                miner_count: 1,
                segment_width: None,
                shuffle_on_connect: false,
            },
            Box::new(|index| {
                Box::new(SyntheticBackend::new(index).with_batch(256, Duration::from_millis(1)))
            }),
        )
    }

    fn fast_settings() -> PoolSettings {
        PoolSettings {
            no_response_timeout: Duration::from_millis(300),
            connection_max_retries: 1,
            ..PoolSettings::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn solution_for(wp: WorkPackage) -> Solution {
        Solution {
            nonce: 0xdead,
            mix_hash: Hash256::from_hex("0xbeef").unwrap(),
            work: wp,
            tstamp: Instant::now(),
            miner_index: 0,
        }
    }

    // -- rotation policy unit tests ------------------------------------

    fn conn_state(uris: &[&str]) -> ConnState {
        ConnState {
            list: uris
                .iter()
                .map(|u| Arc::new(PoolEndpoint::parse(u).unwrap()))
                .collect(),
            active_idx: 0,
        }
    }

    #[test]
    fn test_rotation_retries_same_endpoint_below_limit() {
        let mut conns = conn_state(&["stratum://a@x.example:1", "stratum://b@y.example:2"]);
        let mut attempt = 3;
        let (selection, switches) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Connect(ep) if ep.host() == "x.example"));
        assert_eq!(switches, 0);
        assert_eq!(attempt, 3);
    }

    #[test]
    fn test_rotation_single_endpoint_retries_forever() {
        let mut conns = conn_state(&["stratum://a@x.example:1"]);
        let mut attempt = 10;
        let (selection, switches) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Connect(_)));
        // Retry-forever resets the attempt counter without a switch.
        assert_eq!(attempt, 0);
        assert_eq!(switches, 0);
        assert_eq!(conns.active_idx, 0);
    }

    #[test]
    fn test_rotation_advances_after_max_retries() {
        let mut conns = conn_state(&["stratum://a@x.example:1", "stratum://b@y.example:2"]);
        let mut attempt = 10;
        let (selection, switches) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Connect(ep) if ep.host() == "y.example"));
        assert_eq!(switches, 1);
        assert_eq!(attempt, 0);
        assert_eq!(conns.active_idx, 1);
    }

    #[test]
    fn test_rotation_wraps_after_last_endpoint() {
        let mut conns = conn_state(&["stratum://a@x.example:1", "stratum://b@y.example:2"]);
        conns.active_idx = 1;
        let mut attempt = 10;
        let (selection, _) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Connect(ep) if ep.host() == "x.example"));
        assert_eq!(conns.active_idx, 0);
    }

    #[test]
    fn test_rotation_out_of_bounds_index_wraps_first() {
        let mut conns = conn_state(&["stratum://a@x.example:1"]);
        conns.active_idx = 7;
        let mut attempt = 0;
        let (selection, _) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Connect(_)));
        assert_eq!(conns.active_idx, 0);
    }

    #[test]
    fn test_rotation_drops_unrecoverable() {
        let mut conns = conn_state(&["stratum://a@x.example:1", "stratum://b@y.example:2"]);
        conns.list[0].mark_unrecoverable();
        let mut attempt = 5;
        let (selection, switches) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Connect(ep) if ep.host() == "y.example"));
        assert_eq!(switches, 1);
        assert_eq!(attempt, 0);
        assert_eq!(conns.list.len(), 1);
    }

    #[test]
    fn test_rotation_exit_sentinel_terminates() {
        let mut conns = conn_state(&["stratum://a@exit:1"]);
        let mut attempt = 0;
        let (selection, _) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Terminate));
    }

    #[test]
    fn test_rotation_empty_list_terminates() {
        let mut conns = conn_state(&[]);
        let mut attempt = 0;
        let (selection, _) = rotate_selection(&mut conns, &mut attempt, 10);
        assert!(matches!(selection, Selection::Terminate));
    }

    // -- handle guard tests --------------------------------------------

    #[test]
    fn test_remove_connection_guards() {
        let manager = PoolManager::new(PoolSettings::default(), quiet_farm());
        manager
            .add_connection_str("stratum://a@x.example:1")
            .unwrap();
        manager
            .add_connection_str("stratum://b@y.example:2")
            .unwrap();

        assert_eq!(manager.remove_connection(5), Err(ManagerError::OutOfBounds));
        assert_eq!(
            manager.remove_connection(0),
            Err(ManagerError::ActiveConnection)
        );
        assert_eq!(manager.remove_connection(1), Ok(()));
        assert_eq!(manager.get_connections_json().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_set_active_busy_while_pending() {
        let manager = PoolManager::new(PoolSettings::default(), quiet_farm());
        manager
            .add_connection_str("stratum://a@x.example:1")
            .unwrap();
        manager
            .add_connection_str("stratum://b@y.example:2")
            .unwrap();

        assert_eq!(manager.set_active_connection(1), Ok(()));
        // The pending flag is set until a strand clears it; further
        // reconfiguration must fail without touching the index.
        assert_eq!(manager.set_active_connection(0), Err(ManagerError::Busy));
        assert_eq!(manager.remove_connection(0), Err(ManagerError::Busy));
        let json = manager.get_connections_json();
        assert_eq!(json[1]["active"], Value::Bool(true));
        assert_eq!(manager.get_connection_switches(), 1);
    }

    #[test]
    fn test_set_active_same_index_releases_flag() {
        let manager = PoolManager::new(PoolSettings::default(), quiet_farm());
        manager
            .add_connection_str("stratum://a@x.example:1")
            .unwrap();
        assert_eq!(manager.set_active_connection(0), Ok(()));
        // Same index: no switch, flag released, a second call still works.
        assert_eq!(manager.get_connection_switches(), 0);
        assert_eq!(manager.set_active_connection(0), Ok(()));
    }

    #[test]
    fn test_set_active_by_string_case_insensitive() {
        let manager = PoolManager::new(PoolSettings::default(), quiet_farm());
        manager
            .add_connection_str("stratum://wallet@pool.example:3333")
            .unwrap();
        manager
            .add_connection_str("stratum://wallet@other.example:3333")
            .unwrap();

        assert_eq!(
            manager.set_active_connection_str("STRATUM://WALLET@OTHER.EXAMPLE:3333"),
            Ok(())
        );
        assert_eq!(manager.get_connections_json()[1]["active"], true);

        assert_eq!(
            manager.set_active_connection_str("stratum://nobody@nowhere.example:1"),
            Err(ManagerError::NotFound)
        );
    }

    #[test]
    fn test_connections_json_roundtrip_after_remove_and_add() {
        let manager = PoolManager::new(PoolSettings::default(), quiet_farm());
        manager
            .add_connection_str("stratum://a@x.example:1")
            .unwrap();
        manager
            .add_connection_str("stratum://b@y.example:2")
            .unwrap();
        let uri = manager.get_connections_json()[1]["uri"]
            .as_str()
            .unwrap()
            .to_string();

        manager.remove_connection(1).unwrap();
        manager.add_connection_str(&uri).unwrap();
        assert_eq!(manager.get_connections_json()[1]["uri"], uri.as_str());
    }

    // -- end-to-end scenarios ------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_happy_path_stratum() {
        let pool = MockPool::spawn(PoolScript {
            notify: Some(notify_params("j1", HEADER, SEED0, 42)),
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager
            .add_connection_str(&pool.uri("worker.rig"))
            .unwrap();
        manager.start().unwrap();

        assert!(wait_until(|| manager.is_connected(), Duration::from_secs(5)).await);
        assert!(wait_until(|| manager.get_epoch_changes() == 1, Duration::from_secs(5)).await);

        let wp = manager.current_work();
        assert_eq!(wp.header, Hash256::from_hex(HEADER).unwrap());
        assert_eq!(wp.block, Some(42));
        assert_eq!(manager.get_current_epoch(), Some(0));
        assert!(farm.is_mining());
        assert!(manager.get_current_difficulty() > 0.0);

        // A found solution travels farm -> manager -> pool and the
        // acceptance is accounted to the miner.
        farm.submit_proof(solution_for(wp));
        assert!(
            wait_until(|| farm.solutions().accepted == 1, Duration::from_secs(5)).await,
            "acceptance not accounted"
        );
        assert_eq!(pool.submit_count(), 1);
        assert_eq!(farm.miner_solutions(0).unwrap().accepted, 1);

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejected_solution_accounted() {
        let pool = MockPool::spawn(PoolScript {
            notify: Some(notify_params("j1", HEADER, SEED0, 42)),
            submit_reply: SubmitReply::Reject,
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager.add_connection_str(&pool.uri("w")).unwrap();
        manager.start().unwrap();

        assert!(wait_until(|| manager.current_work().is_present(), Duration::from_secs(5)).await);
        farm.submit_proof(solution_for(manager.current_work()));
        assert!(wait_until(|| farm.solutions().rejected == 1, Duration::from_secs(5)).await);
        assert_eq!(farm.solutions().accepted, 0);

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_acceptance_flagged() {
        let pool = MockPool::spawn(PoolScript {
            notify: Some(notify_params("j1", HEADER, SEED0, 42)),
            submit_reply: SubmitReply::AcceptStale,
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager.add_connection_str(&pool.uri("w")).unwrap();
        manager.start().unwrap();

        assert!(wait_until(|| manager.current_work().is_present(), Duration::from_secs(5)).await);
        farm.submit_proof(solution_for(manager.current_work()));
        assert!(
            wait_until(|| farm.solutions().accepted_stale == 1, Duration::from_secs(5)).await
        );

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unrecoverable_endpoint_dropped() {
        let bad = MockPool::spawn(PoolScript {
            reject_auth: true,
            ..PoolScript::default()
        })
        .await;
        let good = MockPool::spawn(PoolScript {
            notify: Some(notify_params("j1", HEADER, SEED0, 42)),
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager.add_connection_str(&bad.uri("w")).unwrap();
        manager.add_connection_str(&good.uri("w")).unwrap();
        manager.start().unwrap();

        assert!(wait_until(|| manager.is_connected(), Duration::from_secs(10)).await);
        // The rejected endpoint is gone from the list.
        assert_eq!(manager.get_connections_json().as_array().unwrap().len(), 1);
        assert_eq!(
            manager.get_active_connection().unwrap().port(),
            good.addr.port()
        );
        // One switch for start, one for the drop.
        assert_eq!(manager.get_connection_switches(), 2);

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failover_and_primary_reaffinity() {
        // Primary accepts TCP but goes mute after the subscribe reply;
        // secondary works.
        let primary = MockPool::spawn(PoolScript {
            accept_v1: false,
            mute_after_subscribe: true,
            ..PoolScript::default()
        })
        .await;
        let secondary = MockPool::spawn(PoolScript {
            notify: Some(notify_params("j1", HEADER, SEED0, 42)),
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let settings = PoolSettings {
            no_response_timeout: Duration::from_millis(200),
            connection_max_retries: 1,
            pool_failover_timeout: Duration::from_millis(700),
            ..PoolSettings::default()
        };
        let manager = PoolManager::new(settings, farm.clone());
        manager.add_connection_str(&primary.uri("w")).unwrap();
        manager.add_connection_str(&secondary.uri("w")).unwrap();
        manager.start().unwrap();

        // start (1) + rotate to secondary (2).
        assert!(wait_until(|| manager.is_connected(), Duration::from_secs(10)).await);
        assert_eq!(
            manager.get_active_connection().unwrap().port(),
            secondary.addr.port()
        );
        assert_eq!(manager.get_connection_switches(), 2);

        // The failover timer brings it back to the primary (3), which is
        // still broken, so it lands on the secondary again eventually.
        assert!(
            wait_until(|| manager.get_connection_switches() >= 3, Duration::from_secs(10)).await,
            "failover timer never fired"
        );
        assert!(
            wait_until(
                || primary.connections.load(std::sync::atomic::Ordering::SeqCst) >= 2,
                Duration::from_secs(5)
            )
            .await,
            "primary was never retried"
        );

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_solution_wasted_while_disconnected() {
        // A pool that never completes the handshake keeps the manager in
        // its reconnect loop.
        let pool = MockPool::spawn(PoolScript {
            accept_v1: false,
            mute_after_subscribe: true,
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let manager = PoolManager::new(
            PoolSettings {
                no_response_timeout: Duration::from_millis(300),
                ..PoolSettings::default()
            },
            farm.clone(),
        );
        manager.add_connection_str(&pool.uri("w")).unwrap();
        manager.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_connected());

        farm.submit_proof(solution_for(WorkPackage::default()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // No submission reached the pool and accounting is untouched.
        assert_eq!(pool.submit_count(), 0);
        let account = farm.solutions();
        assert_eq!(account.accepted, 0);
        assert_eq!(account.rejected, 0);
        assert_eq!(account.wasted, 0);

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_epoch_change_mid_session() {
        let seed10 = meowpow::seed_from_epoch(10).to_hex();
        let seed11 = meowpow::seed_from_epoch(11).to_hex();
        let pool = MockPool::spawn(PoolScript {
            notify: Some(notify_params("j1", HEADER, &seed10, EPOCH_LENGTH * 10)),
            later_notify: Some((
                300,
                notify_params("j2", HEADER, &seed11, EPOCH_LENGTH * 11),
            )),
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager.add_connection_str(&pool.uri("w")).unwrap();
        manager.start().unwrap();

        assert!(wait_until(|| manager.get_epoch_changes() == 1, Duration::from_secs(5)).await);
        assert_eq!(manager.get_current_epoch(), Some(10));

        assert!(wait_until(|| manager.get_epoch_changes() == 2, Duration::from_secs(5)).await);
        assert_eq!(manager.get_current_epoch(), Some(11));

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_graceful_stop_while_connected() {
        let pool = MockPool::spawn(PoolScript {
            notify: Some(notify_params("j1", HEADER, SEED0, 42)),
            ..PoolScript::default()
        })
        .await;

        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager.add_connection_str(&pool.uri("w")).unwrap();
        manager.start().unwrap();
        assert!(wait_until(|| manager.is_connected(), Duration::from_secs(5)).await);
        assert!(farm.is_mining());

        manager.stop().await;
        assert!(!manager.is_running());
        assert!(!manager.is_connected());
        assert!(!farm.is_mining());

        // Idempotent.
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_is_once_per_lifetime() {
        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager
            .add_connection_str("simulation://localhost:0")
            .unwrap();
        manager.start().unwrap();
        assert_eq!(manager.start(), Err(ManagerError::AlreadyRunning));
        manager.stop().await;
        assert_eq!(manager.start(), Err(ManagerError::AlreadyRunning));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exit_sentinel_terminates() {
        let farm = quiet_farm();
        let manager = PoolManager::new(fast_settings(), farm.clone());
        manager.add_connection_str("stratum://x@exit:1").unwrap();
        let exited = manager.exited();
        manager.start().unwrap();

        tokio::time::timeout(Duration::from_secs(5), exited.cancelled())
            .await
            .expect("exit signal never fired");
        assert!(!manager.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simulation_end_to_end() {
        // Full pipeline with no network: the simulator hands out work, the
        // synthetic backend finds solutions, the simulator accepts them.
        let farm = Farm::new(
            FarmSettings {
                miner_count: 1,
                segment_width: None,
                shuffle_on_connect: true,
            },
            Box::new(|index| {
                Box::new(
                    SyntheticBackend::new(index)
                        .with_solution_interval(100)
                        .with_batch(1024, Duration::from_millis(1)),
                )
            }),
        );
        let settings = PoolSettings {
            benchmark_block: 30_000,
            benchmark_diff: 1024.0,
            ..PoolSettings::default()
        };
        let manager = PoolManager::new(settings, farm.clone());
        manager
            .add_connection_str("simulation://localhost:0")
            .unwrap();
        manager.start().unwrap();

        assert!(wait_until(|| manager.is_connected(), Duration::from_secs(5)).await);
        assert_eq!(manager.get_current_epoch(), Some(4));
        assert!(
            wait_until(|| farm.solutions().accepted > 0, Duration::from_secs(10)).await,
            "no solution accepted in simulation"
        );

        manager.stop().await;
    }
}
