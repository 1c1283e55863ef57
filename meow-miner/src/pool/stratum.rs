//! Stratum client.
//!
//! Line-delimited JSON-RPC over TCP or TLS. One I/O task per connection
//! attempt drives the whole session: dialect negotiation, job
//! notifications, solution submissions with response-deadline tracking, and
//! the no-work watchdog. The task owns both stream halves; everything else
//! talks to it through channels.
//!
//! Dialect negotiation walks down, falling back on explicit protocol-error
//! replies:
//!
//! 1. `mining.subscribe` advertising `EthereumStratum/2.0.0`,
//! 2. `mining.subscribe` advertising `EthereumStratum/1.0.0` (NiceHash
//!    extranonce scheme),
//! 3. `eth_submitLogin` (proxy-style: getwork triplets over the stratum
//!    socket).
//!
//! The chosen dialect decides the notification shape, how the pool
//! extranonce folds into the start nonce, whether `mining.set_difficulty`
//! drives the boundary, and the submission shape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{PoolEndpoint, StratumNegotiation};
use crate::meowpow;
use crate::pool::client::{ClientEvent, PoolClient, EVENT_CHANNEL_CAPACITY};
use crate::tracing::prelude::*;
use crate::types::{boundary_from_difficulty, Hash256};
use crate::work::{Solution, WorkPackage};

const USER_AGENT: &str = concat!("meow-miner/", env!("CARGO_PKG_VERSION"));

/// TCP/TLS connect deadline. Handshake replies and submissions are under
/// `no_response_timeout` instead.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Negotiated wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    /// EthereumStratum/2.0.0: compact notifies, session state via
    /// `mining.set`.
    Ethereum2,
    /// EthereumStratum/1.0.0: NiceHash extranonce, boundary via
    /// `mining.set_difficulty`.
    Ethereum1,
    /// `eth_submitLogin` session carrying getwork triplets.
    EthProxy,
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error("i/o: {0}")]
    Io(String),
    #[error("connection closed by pool")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("no new work within the timeout window")]
    NoWork,
    #[error("submission response overdue")]
    NoResponse,
    #[error("pool rejected session: {0}")]
    Rejected(String),
    #[error("disconnect requested")]
    Cancelled,
}

enum Command {
    Submit {
        solution: Solution,
        submitted: Instant,
    },
    Hashrate {
        rate: u64,
        id: String,
    },
}

pub struct StratumClient {
    no_work_timeout: Duration,
    no_response_timeout: Duration,
    endpoint: Option<Arc<PoolEndpoint>>,
    connected: Arc<AtomicBool>,
    started: bool,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
    cancel: CancellationToken,
    remote_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl StratumClient {
    pub fn new(no_work_timeout: Duration, no_response_timeout: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            no_work_timeout,
            no_response_timeout,
            endpoint: None,
            connected: Arc::new(AtomicBool::new(false)),
            started: false,
            event_tx,
            event_rx: Some(event_rx),
            cmd_tx: None,
            cancel: CancellationToken::new(),
            remote_addr: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl PoolClient for StratumClient {
    fn set_connection(&mut self, endpoint: Arc<PoolEndpoint>) {
        self.endpoint = Some(endpoint);
    }

    fn unset_connection(&mut self) {
        self.endpoint = None;
    }

    fn connection(&self) -> Option<Arc<PoolEndpoint>> {
        self.endpoint.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    fn active_endpoint(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock().unwrap()
    }

    async fn connect(&mut self) {
        if self.started {
            return;
        }
        let endpoint = match &self.endpoint {
            Some(endpoint) => Arc::clone(endpoint),
            None => return,
        };
        self.started = true;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.cmd_tx = Some(cmd_tx);

        let io = SessionIo {
            endpoint,
            no_work_timeout: self.no_work_timeout,
            no_response_timeout: self.no_response_timeout,
            connected: Arc::clone(&self.connected),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
            remote_addr: Arc::clone(&self.remote_addr),
        };
        tokio::spawn(io.run(cmd_rx));
    }

    async fn disconnect(&mut self) {
        self.cancel.cancel();
    }

    async fn submit_solution(&self, solution: Solution) {
        if !self.is_connected() {
            return;
        }
        if let Some(cmd_tx) = &self.cmd_tx {
            let _ = cmd_tx.send(Command::Submit {
                solution,
                submitted: Instant::now(),
            });
        }
    }

    async fn submit_hashrate(&self, rate: u64, id: &str) {
        if !self.is_connected() {
            return;
        }
        if let Some(cmd_tx) = &self.cmd_tx {
            let _ = cmd_tx.send(Command::Hashrate {
                rate,
                id: id.to_string(),
            });
        }
    }
}

// --- wire helpers -----------------------------------------------------

/// Share difficulty to boundary, NiceHash convention: difficulty 1 is one
/// expected share per 2^32 hashes.
fn boundary_from_share_difficulty(diff: f64) -> Hash256 {
    boundary_from_difficulty(diff * (u32::MAX as f64 + 1.0))
}

/// Fold a pool extranonce hex prefix into a start nonce.
///
/// The extranonce occupies the most significant bytes of the nonce; the
/// miner enumerates the remainder. Returns `(start_nonce, ex_size_bytes)`.
fn start_nonce_from_extranonce(extranonce: &str) -> Result<(u64, u16), String> {
    let extranonce = extranonce.trim_start_matches("0x");
    if extranonce.is_empty() {
        return Ok((0, 0));
    }
    if extranonce.len() > 16 || extranonce.len() % 2 != 0 {
        return Err(format!("bad extranonce {:?}", extranonce));
    }
    let value =
        u64::from_str_radix(extranonce, 16).map_err(|e| format!("extranonce hex: {}", e))?;
    let bytes = (extranonce.len() / 2) as u16;
    Ok((value << (64 - 4 * extranonce.len()), bytes))
}

/// Nonce as submitted: full hex minus the pool-owned extranonce prefix.
fn nonce_suffix_hex(nonce: u64, ex_size_bytes: u16) -> String {
    let full = format!("{:016x}", nonce);
    full[(ex_size_bytes as usize * 2).min(16)..].to_string()
}

fn parse_hex_u64(value: &Value, name: &str) -> Result<u64, String> {
    let s = value.as_str().ok_or_else(|| format!("{} not a string", name))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("{} hex: {}", name, e))
}

fn parse_hash(value: &Value, name: &str) -> Result<Hash256, String> {
    let s = value.as_str().ok_or_else(|| format!("{} not a string", name))?;
    Hash256::from_hex(s).map_err(|e| format!("{} hex: {}", name, e))
}

/// Mutable per-session protocol state.
struct SessionState {
    dialect: Dialect,
    /// Extranonce folded into start nonces, most significant bytes first.
    start_nonce: u64,
    ex_size_bytes: u16,
    /// Boundary from `mining.set_difficulty` / `mining.set`; zero until the
    /// pool sends one.
    session_boundary: Hash256,
    /// Epoch from `mining.set` (EthereumStratum/2.0.0 only).
    session_epoch: Option<u32>,
    /// Jobs that arrived while the handshake was still in flight; they are
    /// dispatched right after `Connected` so event ordering holds.
    deferred_notifies: Vec<Value>,
}

impl SessionState {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            start_nonce: 0,
            ex_size_bytes: 0,
            session_boundary: Hash256::ZERO,
            session_epoch: None,
            deferred_notifies: Vec::new(),
        }
    }

    fn apply_extranonce(&mut self, extranonce: &str) -> Result<(), String> {
        let (start_nonce, ex_size_bytes) = start_nonce_from_extranonce(extranonce)?;
        self.start_nonce = start_nonce;
        self.ex_size_bytes = ex_size_bytes;
        Ok(())
    }

    /// Parse a `mining.notify` into a work package.
    ///
    /// EthereumStratum/2.0.0: `[job, height_hex, header_hash, clean]`, the
    /// boundary and epoch come from the last `mining.set`.
    ///
    /// EthereumStratum/1.0.0: `[job, seed_hash, header_hash, height_hex,
    /// clean(, boundary_hex)]`; without the trailing boundary element the
    /// `mining.set_difficulty` boundary applies.
    fn parse_notify(&self, params: &[Value]) -> Result<WorkPackage, String> {
        match self.dialect {
            Dialect::Ethereum2 => {
                if params.len() < 4 {
                    return Err("mining.notify params too short".to_string());
                }
                let job = params[0]
                    .as_str()
                    .ok_or("job id not a string")?
                    .to_string();
                let block = parse_hex_u64(&params[1], "height")?;
                let header = parse_hash(&params[2], "header")?;
                let epoch = self
                    .session_epoch
                    .unwrap_or_else(|| meowpow::epoch_from_block(block));
                Ok(WorkPackage {
                    job,
                    header,
                    seed: meowpow::seed_from_epoch(epoch),
                    boundary: self.session_boundary,
                    epoch: Some(epoch),
                    block: Some(block),
                    start_nonce: self.start_nonce,
                    ex_size_bytes: self.ex_size_bytes,
                    ..WorkPackage::default()
                })
            }
            Dialect::Ethereum1 => {
                if params.len() < 5 {
                    return Err("mining.notify params too short".to_string());
                }
                let job = params[0]
                    .as_str()
                    .ok_or("job id not a string")?
                    .to_string();
                let seed = parse_hash(&params[1], "seed")?;
                let header = parse_hash(&params[2], "header")?;
                let block = parse_hex_u64(&params[3], "height")?;
                let boundary = match params.get(5) {
                    Some(v) if v.is_string() => parse_hash(v, "boundary")?,
                    _ => self.session_boundary,
                };
                Ok(WorkPackage {
                    job,
                    header,
                    seed,
                    boundary,
                    epoch: meowpow::epoch_from_seed(seed)
                        .or(Some(meowpow::epoch_from_block(block))),
                    block: Some(block),
                    start_nonce: self.start_nonce,
                    ex_size_bytes: self.ex_size_bytes,
                    ..WorkPackage::default()
                })
            }
            Dialect::EthProxy => Err("mining.notify not part of the proxy dialect".to_string()),
        }
    }

    /// Parse a getwork-shaped triplet `[header, seed, boundary(, height)]`
    /// (EthProxy dialect).
    fn parse_proxy_work(&self, result: &[Value]) -> Result<WorkPackage, String> {
        if result.len() < 3 {
            return Err("work result too short".to_string());
        }
        let header = parse_hash(&result[0], "header")?;
        let seed = parse_hash(&result[1], "seed")?;
        let boundary = parse_hash(&result[2], "boundary")?;
        let (block, epoch) = match result.get(3) {
            Some(v) if v.is_string() => {
                let block = parse_hex_u64(v, "height")?;
                (block, meowpow::epoch_from_block(block))
            }
            _ => {
                let epoch = meowpow::epoch_from_seed(seed)
                    .ok_or("work carries no height and the seed matches no epoch")?;
                (u64::from(epoch) * meowpow::EPOCH_LENGTH, epoch)
            }
        };
        Ok(WorkPackage {
            job: header.abridged(),
            header,
            seed,
            boundary,
            epoch: Some(epoch),
            block: Some(block),
            ..WorkPackage::default()
        })
    }

    /// Build the submission request for `solution` with message id `id`.
    fn submit_request(&self, id: u64, endpoint: &PoolEndpoint, solution: &Solution) -> Value {
        match self.dialect {
            Dialect::Ethereum2 => json!({
                "id": id,
                "method": "mining.submit",
                "params": [
                    solution.work.job,
                    nonce_suffix_hex(solution.nonce, solution.work.ex_size_bytes),
                    endpoint.worker(),
                ],
            }),
            Dialect::Ethereum1 => json!({
                "id": id,
                "method": "mining.submit",
                "params": [
                    endpoint.login(),
                    solution.work.job,
                    nonce_suffix_hex(solution.nonce, solution.work.ex_size_bytes),
                ],
            }),
            Dialect::EthProxy => json!({
                "id": id,
                "method": "eth_submitWork",
                "params": [
                    format!("{:#018x}", solution.nonce),
                    solution.work.header.to_hex(),
                    solution.mix_hash.to_hex(),
                ],
            }),
        }
    }

    fn hashrate_request(&self, id: u64, rate: u64, hr_id: &str) -> Value {
        let method = match self.dialect {
            Dialect::EthProxy => "eth_submitHashrate",
            _ => "mining.submit_hashrate",
        };
        json!({
            "id": id,
            "method": method,
            "params": [format!("{:#x}", rate), hr_id],
        })
    }
}

// --- stream plumbing ---------------------------------------------------

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type Reader = BufReader<ReadHalf<Box<dyn AsyncStream>>>;
type Writer = WriteHalf<Box<dyn AsyncStream>>;

async fn open_stream(endpoint: &PoolEndpoint) -> Result<(Box<dyn AsyncStream>, SocketAddr), SessionError> {
    let addr = format!("{}:{}", endpoint.host(), endpoint.port());
    let tcp = tokio::time::timeout(SETUP_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|e| SessionError::Io(e.to_string()))?;
    let peer = tcp.peer_addr().map_err(|e| SessionError::Io(e.to_string()))?;

    if !endpoint.is_secure() {
        return Ok((Box::new(tcp), peer));
    }

    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject.as_ref().to_vec(),
            ta.subject_public_key_info.as_ref().to_vec(),
            ta.name_constraints.clone().map(|c| c.as_ref().to_vec()),
        )
    }));
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let dns = ServerName::try_from(endpoint.host())
        .map_err(|_| SessionError::Io(format!("bad TLS server name {:?}", endpoint.host())))?;
    let tls = tokio::time::timeout(SETUP_TIMEOUT, connector.connect(dns, tcp))
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|e| SessionError::Io(e.to_string()))?;
    Ok((Box::new(tls), peer))
}

async fn write_message(writer: &mut Writer, message: &Value) -> Result<(), SessionError> {
    let mut line = message.to_string();
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| SessionError::Io(e.to_string()))
}

async fn read_message(reader: &mut Reader) -> Result<Value, SessionError> {
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| SessionError::Io(e.to_string()))?;
        if n == 0 {
            return Err(SessionError::Closed);
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => return Ok(value),
            Err(e) => warn!(error = %e, "Dropping unparseable line from pool"),
        }
    }
}

fn error_message(reply: &Value) -> Option<String> {
    let error = reply.get("error")?;
    if error.is_null() {
        return None;
    }
    Some(error.to_string())
}

// --- the session task --------------------------------------------------

struct SessionIo {
    endpoint: Arc<PoolEndpoint>,
    no_work_timeout: Duration,
    no_response_timeout: Duration,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
    remote_addr: Arc<Mutex<Option<SocketAddr>>>,
}

struct PendingSubmit {
    submitted: Instant,
    deadline: Instant,
    miner_index: usize,
}

impl SessionIo {
    async fn run(self, cmd_rx: mpsc::UnboundedReceiver<Command>) {
        match self.session(cmd_rx).await {
            Ok(()) | Err(SessionError::Cancelled) => {}
            Err(SessionError::Rejected(msg)) => {
                warn!(pool = %self.endpoint.host(), error = %msg, "Session rejected by pool");
            }
            Err(e) => {
                warn!(pool = %self.endpoint.host(), error = %e, "Session ended");
            }
        }
        self.connected.store(false, Ordering::Release);
        *self.remote_addr.lock().unwrap() = None;
        let _ = self.event_tx.send(ClientEvent::Disconnected).await;
    }

    async fn session(
        &self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), SessionError> {
        let (stream, peer) = tokio::select! {
            result = open_stream(&self.endpoint) => result?,
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
        };
        *self.remote_addr.lock().unwrap() = Some(peer);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let mut next_id: u64 = 0;
        let mut state = self
            .negotiate(&mut reader, &mut writer, &mut next_id)
            .await?;

        self.connected.store(true, Ordering::Release);
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        debug!(pool = %self.endpoint.host(), dialect = ?state.dialect, "Session established");

        let mut last_job = Instant::now();

        // Dispatch jobs the pool pushed mid-handshake.
        for params in std::mem::take(&mut state.deferred_notifies) {
            let params = params.as_array().cloned().unwrap_or_default();
            match state.parse_notify(&params) {
                Ok(wp) => {
                    last_job = Instant::now();
                    let _ = self.event_tx.send(ClientEvent::WorkReceived(wp)).await;
                }
                Err(e) => warn!(error = %e, "Malformed mining.notify"),
            }
        }

        // The proxy dialect pulls the first job explicitly.
        let mut work_request_id = None;
        if state.dialect == Dialect::EthProxy {
            next_id += 1;
            work_request_id = Some(next_id);
            write_message(
                &mut writer,
                &json!({"id": next_id, "method": "eth_getWork", "params": []}),
            )
            .await?;
        }

        let mut pending: HashMap<u64, PendingSubmit> = HashMap::new();
        let mut hashrate_ids: Vec<u64> = Vec::new();

        loop {
            // The earliest submission deadline, if any is in flight. A new
            // job never moves an existing deadline.
            let response_deadline = pending.values().map(|p| p.deadline).min();

            tokio::select! {
                message = read_message(&mut reader) => {
                    let message = message?;
                    self.handle_message(
                        message,
                        &mut state,
                        &mut writer,
                        &mut pending,
                        &mut hashrate_ids,
                        &mut work_request_id,
                        &mut last_job,
                    )
                    .await?;
                }

                Some(cmd) = cmd_rx.recv() => match cmd {
                    Command::Submit { solution, submitted } => {
                        next_id += 1;
                        let request = state.submit_request(next_id, &self.endpoint, &solution);
                        pending.insert(next_id, PendingSubmit {
                            submitted,
                            deadline: submitted + self.no_response_timeout,
                            miner_index: solution.miner_index,
                        });
                        write_message(&mut writer, &request).await?;
                    }
                    Command::Hashrate { rate, id } => {
                        next_id += 1;
                        hashrate_ids.push(next_id);
                        let request = state.hashrate_request(next_id, rate, &id);
                        write_message(&mut writer, &request).await?;
                    }
                },

                _ = tokio::time::sleep_until((last_job + self.no_work_timeout).into()) => {
                    return Err(SessionError::NoWork);
                }

                _ = async {
                    match response_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                        None => std::future::pending().await,
                    }
                } => {
                    return Err(SessionError::NoResponse);
                }

                _ = self.cancel.cancelled() => {
                    if state.dialect == Dialect::Ethereum2 {
                        next_id += 1;
                        let _ = write_message(
                            &mut writer,
                            &json!({"id": next_id, "method": "mining.bye", "params": []}),
                        ).await;
                    }
                    return Err(SessionError::Cancelled);
                }
            }
        }
    }

    /// Walk the dialect ladder. Explicit protocol rejections fall through
    /// to the next dialect; transport errors abort the attempt.
    async fn negotiate(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
        next_id: &mut u64,
    ) -> Result<SessionState, SessionError> {
        let dialects: &[Dialect] = match self.endpoint.negotiation() {
            StratumNegotiation::Ethereum2 => &[Dialect::Ethereum2],
            StratumNegotiation::Auto => {
                &[Dialect::Ethereum2, Dialect::Ethereum1, Dialect::EthProxy]
            }
        };

        let mut last_rejection = String::new();
        for (attempt, dialect) in dialects.iter().enumerate() {
            let is_last = attempt == dialects.len() - 1;
            match self.try_dialect(*dialect, reader, writer, next_id).await {
                Ok(state) => return Ok(state),
                Err(SessionError::Rejected(msg)) => {
                    debug!(dialect = ?dialect, reason = %msg, "Dialect rejected, falling back");
                    last_rejection = msg;
                    if is_last {
                        // Every dialect was explicitly refused: retrying
                        // this endpoint cannot succeed.
                        self.endpoint.mark_unrecoverable();
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::Rejected(last_rejection))
    }

    async fn try_dialect(
        &self,
        dialect: Dialect,
        reader: &mut Reader,
        writer: &mut Writer,
        next_id: &mut u64,
    ) -> Result<SessionState, SessionError> {
        let mut state = SessionState::new(dialect);

        match dialect {
            Dialect::Ethereum2 | Dialect::Ethereum1 => {
                let protocol = if dialect == Dialect::Ethereum2 {
                    "EthereumStratum/2.0.0"
                } else {
                    "EthereumStratum/1.0.0"
                };
                *next_id += 1;
                let subscribe_id = *next_id;
                write_message(
                    writer,
                    &json!({
                        "id": subscribe_id,
                        "method": "mining.subscribe",
                        "params": [USER_AGENT, protocol],
                    }),
                )
                .await?;
                let reply = self
                    .wait_for_reply(subscribe_id, reader, writer, &mut state)
                    .await?;
                if let Some(msg) = error_message(&reply) {
                    return Err(SessionError::Rejected(format!("subscribe: {}", msg)));
                }

                // The 1.0.0 subscribe result carries the extranonce:
                // [[subscription...], extranonce_hex]
                if dialect == Dialect::Ethereum1 {
                    if let Some(extranonce) =
                        reply.get("result").and_then(|r| r.get(1)).and_then(|v| v.as_str())
                    {
                        state
                            .apply_extranonce(extranonce)
                            .map_err(SessionError::Io)?;
                    }
                }

                *next_id += 1;
                let authorize_id = *next_id;
                write_message(
                    writer,
                    &json!({
                        "id": authorize_id,
                        "method": "mining.authorize",
                        "params": [self.endpoint.login(), self.endpoint.password()],
                    }),
                )
                .await?;
                let reply = self
                    .wait_for_reply(authorize_id, reader, writer, &mut state)
                    .await?;
                if let Some(msg) = error_message(&reply) {
                    // Bad credentials cannot be fixed by retrying.
                    self.endpoint.mark_unrecoverable();
                    return Err(SessionError::Rejected(format!("authorize: {}", msg)));
                }
                if reply.get("result").map(|r| r == &Value::Bool(false)) == Some(true) {
                    self.endpoint.mark_unrecoverable();
                    return Err(SessionError::Rejected(
                        "authorize: pool returned false".to_string(),
                    ));
                }

                Ok(state)
            }

            Dialect::EthProxy => {
                *next_id += 1;
                let login_id = *next_id;
                write_message(
                    writer,
                    &json!({
                        "id": login_id,
                        "method": "eth_submitLogin",
                        "params": [self.endpoint.login(), self.endpoint.password()],
                    }),
                )
                .await?;
                let reply = self
                    .wait_for_reply(login_id, reader, writer, &mut state)
                    .await?;
                if let Some(msg) = error_message(&reply) {
                    return Err(SessionError::Rejected(format!("login: {}", msg)));
                }
                Ok(state)
            }
        }
    }

    /// Read until the reply with `id` arrives, applying notifications
    /// inline; pools interleave `mining.set_difficulty` and friends with
    /// the handshake. A reply overdue past `no_response_timeout` ends the
    /// attempt, same as for submissions.
    async fn wait_for_reply(
        &self,
        id: u64,
        reader: &mut Reader,
        writer: &mut Writer,
        state: &mut SessionState,
    ) -> Result<Value, SessionError> {
        let deadline = Instant::now() + self.no_response_timeout;
        loop {
            let message = tokio::select! {
                message = read_message(reader) => message?,
                _ = tokio::time::sleep_until(deadline.into()) => return Err(SessionError::Timeout),
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            };
            if message.get("id").and_then(|v| v.as_u64()) == Some(id) {
                return Ok(message);
            }
            if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
                if method == "mining.notify" {
                    // Hold jobs back until Connected has been emitted.
                    state
                        .deferred_notifies
                        .push(message.get("params").cloned().unwrap_or(Value::Null));
                    continue;
                }
                let method = method.to_string();
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                self.apply_notification(&method, &params, state, writer, &mut Instant::now())
                    .await?;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_message(
        &self,
        message: Value,
        state: &mut SessionState,
        writer: &mut Writer,
        pending: &mut HashMap<u64, PendingSubmit>,
        hashrate_ids: &mut Vec<u64>,
        work_request_id: &mut Option<u64>,
        last_job: &mut Instant,
    ) -> Result<(), SessionError> {
        // Server-initiated request or notification.
        if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
            let method = method.to_string();
            let request_id = message.get("id").cloned();
            let params = message.get("params").cloned().unwrap_or(Value::Null);

            if method == "client.get_version" {
                if let Some(id) = request_id {
                    write_message(writer, &json!({"id": id, "result": USER_AGENT, "error": null}))
                        .await?;
                }
                return Ok(());
            }
            return self
                .apply_notification(&method, &params, state, writer, last_job)
                .await;
        }

        // Reply to one of our requests.
        let id = match message.get("id").and_then(|v| v.as_u64()) {
            Some(id) => id,
            None => return Ok(()),
        };

        if let Some(sub) = pending.remove(&id) {
            let delay = sub.submitted.elapsed();
            let error = error_message(&message);
            let accepted = message
                .get("result")
                .map(|r| r.as_bool().unwrap_or(false))
                .unwrap_or(false);
            let stale = message
                .to_string()
                .to_ascii_lowercase()
                .contains("stale");
            let event = if accepted {
                ClientEvent::SolutionAccepted {
                    delay,
                    miner_index: sub.miner_index,
                    stale,
                }
            } else {
                if let Some(msg) = error {
                    debug!(error = %msg, "Share rejected");
                }
                ClientEvent::SolutionRejected {
                    delay,
                    miner_index: sub.miner_index,
                }
            };
            let _ = self.event_tx.send(event).await;
            return Ok(());
        }

        if let Some(pos) = hashrate_ids.iter().position(|h| *h == id) {
            hashrate_ids.remove(pos);
            return Ok(());
        }

        if *work_request_id == Some(id) {
            *work_request_id = None;
            if let Some(result) = message.get("result").and_then(|r| r.as_array()) {
                match state.parse_proxy_work(result) {
                    Ok(wp) => {
                        *last_job = Instant::now();
                        let _ = self.event_tx.send(ClientEvent::WorkReceived(wp)).await;
                    }
                    Err(e) => warn!(error = %e, "Malformed work response"),
                }
            }
            return Ok(());
        }

        // Unsolicited proxy-style work push: {"id":0,"result":[...]}
        if let Some(result) = message.get("result").and_then(|r| r.as_array()) {
            if state.dialect == Dialect::EthProxy {
                match state.parse_proxy_work(result) {
                    Ok(wp) => {
                        *last_job = Instant::now();
                        let _ = self.event_tx.send(ClientEvent::WorkReceived(wp)).await;
                    }
                    Err(e) => warn!(error = %e, "Malformed work push"),
                }
                return Ok(());
            }
        }

        trace!(id, "Unmatched reply from pool");
        Ok(())
    }

    async fn apply_notification(
        &self,
        method: &str,
        params: &Value,
        state: &mut SessionState,
        _writer: &mut Writer,
        last_job: &mut Instant,
    ) -> Result<(), SessionError> {
        match method {
            "mining.notify" => {
                let params = params.as_array().cloned().unwrap_or_default();
                match state.parse_notify(&params) {
                    Ok(wp) => {
                        *last_job = Instant::now();
                        let _ = self.event_tx.send(ClientEvent::WorkReceived(wp)).await;
                    }
                    Err(e) => warn!(error = %e, "Malformed mining.notify"),
                }
            }
            "mining.set_difficulty" => {
                if let Some(diff) = params
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|v| v.as_f64())
                {
                    state.session_boundary = boundary_from_share_difficulty(diff);
                    debug!(difficulty = diff, "Pool set share difficulty");
                }
            }
            "mining.set_extranonce" => {
                if let Some(extranonce) = params
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|v| v.as_str())
                {
                    if let Err(e) = state.apply_extranonce(extranonce) {
                        warn!(error = %e, "Bad mining.set_extranonce");
                    }
                }
            }
            "mining.set_target" => {
                if let Some(target) = params
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|v| v.as_str())
                {
                    match Hash256::from_hex(target) {
                        Ok(boundary) => state.session_boundary = boundary,
                        Err(e) => warn!(error = %e, "Bad mining.set_target"),
                    }
                }
            }
            "mining.set" => {
                // EthereumStratum/2.0.0 session update.
                if let Some(obj) = params.as_object() {
                    if let Some(target) = obj.get("target").and_then(|v| v.as_str()) {
                        match Hash256::from_hex(target) {
                            Ok(boundary) => state.session_boundary = boundary,
                            Err(e) => warn!(error = %e, "Bad target in mining.set"),
                        }
                    }
                    if let Some(epoch) = obj.get("epoch").and_then(|v| v.as_str()) {
                        match u64::from_str_radix(epoch.trim_start_matches("0x"), 16) {
                            Ok(epoch) => state.session_epoch = Some(epoch as u32),
                            Err(e) => warn!(error = %e, "Bad epoch in mining.set"),
                        }
                    }
                    if let Some(extranonce) = obj.get("extranonce").and_then(|v| v.as_str()) {
                        if let Err(e) = state.apply_extranonce(extranonce) {
                            warn!(error = %e, "Bad extranonce in mining.set");
                        }
                    }
                }
            }
            other => {
                trace!(method = %other, "Ignoring notification");
            }
        }
        Ok(())
    }
}
