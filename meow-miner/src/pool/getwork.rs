//! HTTP getwork client.
//!
//! The simplest of the protocol clients: POST `eth_getWork` on a fixed
//! cadence, dispatch a package whenever the header changes, and submit
//! solutions through `eth_submitWork`. There is no session to keep alive;
//! any network failure ends the polling task and the manager rotates.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::endpoint::PoolEndpoint;
use crate::meowpow;
use crate::pool::client::{ClientEvent, PoolClient, EVENT_CHANNEL_CAPACITY};
use crate::tracing::prelude::*;
use crate::types::Hash256;
use crate::work::{Solution, WorkPackage};

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

pub struct GetworkClient {
    poll_interval: Duration,
    no_work_timeout: Duration,
    endpoint: Option<Arc<PoolEndpoint>>,
    connected: Arc<AtomicBool>,
    started: bool,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
    cancel: CancellationToken,
}

impl GetworkClient {
    pub fn new(no_work_timeout: Duration, poll_interval: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            poll_interval,
            no_work_timeout,
            endpoint: None,
            connected: Arc::new(AtomicBool::new(false)),
            started: false,
            event_tx,
            event_rx: Some(event_rx),
            cmd_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    fn url(endpoint: &PoolEndpoint) -> String {
        let scheme = if endpoint.is_secure() { "https" } else { "http" };
        format!(
            "{}://{}:{}{}",
            scheme,
            endpoint.host(),
            endpoint.port(),
            endpoint.path()
        )
    }
}

/// Parse an `eth_getWork` result array.
///
/// The canonical shape is `[header, seed, boundary, block]`. Some gateways
/// omit the block; the epoch is then recovered from the seed and the
/// epoch's first block stands in, because the dispatcher needs a height for
/// period arithmetic.
fn parse_getwork(result: &Value) -> Result<WorkPackage, String> {
    let arr = result.as_array().ok_or("getWork result not an array")?;
    if arr.len() < 3 {
        return Err("getWork result too short".to_string());
    }

    let field = |i: usize, name: &str| -> Result<Hash256, String> {
        let s = arr[i].as_str().ok_or_else(|| format!("{} not a string", name))?;
        Hash256::from_hex(s).map_err(|e| format!("{} hex: {}", name, e))
    };

    let header = field(0, "header")?;
    let seed = field(1, "seed")?;
    let boundary = field(2, "boundary")?;

    let block = match arr.get(3).and_then(|v| v.as_str()) {
        Some(s) => Some(
            u64::from_str_radix(s.trim_start_matches("0x"), 16)
                .map_err(|e| format!("block hex: {}", e))?,
        ),
        None => None,
    };

    let (block, epoch) = match block {
        Some(block) => (block, meowpow::epoch_from_block(block)),
        None => {
            let epoch = meowpow::epoch_from_seed(seed)
                .ok_or("work carries no block and the seed matches no epoch")?;
            debug!(epoch, "getWork response without block, synthesizing epoch start");
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

async fn rpc(
    http: &reqwest::Client,
    url: &str,
    id: u64,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    let response = http
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let reply: Value = response.json().await.map_err(|e| e.to_string())?;
    if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
        return Err(error.to_string());
    }
    reply
        .get("result")
        .cloned()
        .ok_or_else(|| "reply without result".to_string())
}

#[allow(clippy::too_many_arguments)]
async fn poll_task(
    url: String,
    poll_interval: Duration,
    no_work_timeout: Duration,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let http = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(http) => http,
        Err(e) => {
            warn!(error = %e, "Failed to build HTTP client");
            let _ = event_tx.send(ClientEvent::Disconnected).await;
            return;
        }
    };

    connected.store(true, Ordering::Release);
    let _ = event_tx.send(ClientEvent::Connected).await;

    let mut rpc_id: u64 = 1;
    let mut last_header = Hash256::ZERO;
    let mut last_new_work = Instant::now();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                rpc_id += 1;
                match rpc(&http, &url, rpc_id, "eth_getWork", json!([])).await {
                    Ok(result) => match parse_getwork(&result) {
                        Ok(wp) if wp.header != last_header => {
                            last_header = wp.header;
                            last_new_work = Instant::now();
                            let _ = event_tx.send(ClientEvent::WorkReceived(wp)).await;
                        }
                        Ok(_) => {
                            if last_new_work.elapsed() >= no_work_timeout {
                                warn!("No new work for too long, dropping connection");
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed getWork response"),
                    },
                    Err(e) => {
                        warn!(error = %e, "getWork request failed");
                        break;
                    }
                }
            }

            Some(cmd) = cmd_rx.recv() => match cmd {
                Command::Submit { solution, submitted } => {
                    rpc_id += 1;
                    let params = json!([
                        format!("{:#018x}", solution.nonce),
                        solution.work.header.to_hex(),
                        solution.mix_hash.to_hex(),
                    ]);
                    match rpc(&http, &url, rpc_id, "eth_submitWork", params).await {
                        Ok(result) => {
                            let delay = submitted.elapsed();
                            let event = if result.as_bool().unwrap_or(false) {
                                ClientEvent::SolutionAccepted {
                                    delay,
                                    miner_index: solution.miner_index,
                                    stale: false,
                                }
                            } else {
                                ClientEvent::SolutionRejected {
                                    delay,
                                    miner_index: solution.miner_index,
                                }
                            };
                            let _ = event_tx.send(event).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "submitWork request failed");
                            break;
                        }
                    }
                }
                Command::Hashrate { rate, id } => {
                    rpc_id += 1;
                    let params = json!([format!("{:#x}", rate), id]);
                    if let Err(e) = rpc(&http, &url, rpc_id, "eth_submitHashrate", params).await {
                        debug!(error = %e, "submitHashrate request failed");
                    }
                }
            },

            _ = cancel.cancelled() => break,
        }
    }

    connected.store(false, Ordering::Release);
    let _ = event_tx.send(ClientEvent::Disconnected).await;
}

#[async_trait]
impl PoolClient for GetworkClient {
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
        None
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

        tokio::spawn(poll_task(
            Self::url(&endpoint),
            self.poll_interval,
            self.no_work_timeout,
            Arc::clone(&self.connected),
            self.event_tx.clone(),
            cmd_rx,
            self.cancel.clone(),
        ));
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEADER: &str = "0x1212121212121212121212121212121212121212121212121212121212121212";
    const SEED: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";
    const BOUNDARY: &str = "0x00000000ffff0000000000000000000000000000000000000000000000000000";

    #[test]
    fn test_parse_getwork_full() {
        let result = json!([HEADER, SEED, BOUNDARY, "0x1d4c0"]);
        let wp = parse_getwork(&result).unwrap();
        assert_eq!(wp.header, Hash256::from_hex(HEADER).unwrap());
        assert_eq!(wp.seed, Hash256::from_hex(SEED).unwrap());
        assert_eq!(wp.boundary, Hash256::from_hex(BOUNDARY).unwrap());
        assert_eq!(wp.block, Some(0x1d4c0));
        assert_eq!(wp.epoch, Some((0x1d4c0_u64 / 7500) as u32));
        assert!(wp.is_present());
    }

    #[test]
    fn test_parse_getwork_without_block_recovers_epoch() {
        // The zero seed is epoch 0.
        let result = json!([HEADER, SEED, BOUNDARY]);
        let wp = parse_getwork(&result).unwrap();
        assert_eq!(wp.epoch, Some(0));
        assert_eq!(wp.block, Some(0));
    }

    #[test]
    fn test_parse_getwork_rejects_garbage() {
        assert!(parse_getwork(&json!("nope")).is_err());
        assert!(parse_getwork(&json!([HEADER])).is_err());
        assert!(parse_getwork(&json!([HEADER, SEED, "zzz"])).is_err());
        assert!(parse_getwork(&json!([HEADER, SEED, BOUNDARY, "0xnope"])).is_err());
    }

    #[test]
    fn test_url_building() {
        let plain = PoolEndpoint::parse("http://node.example.com:8545").unwrap();
        assert_eq!(GetworkClient::url(&plain), "http://node.example.com:8545");

        let secure = PoolEndpoint::parse("https://node.example.com:8545/rpc").unwrap();
        assert_eq!(
            GetworkClient::url(&secure),
            "https://node.example.com:8545/rpc"
        );
    }

    #[test]
    fn test_nonce_hex_is_full_width() {
        // eth_submitWork requires the nonce as a full 16-digit hex quantity.
        assert_eq!(format!("{:#018x}", 0xdead_u64), "0x000000000000dead");
        assert_eq!(format!("{:#018x}", u64::MAX), "0xffffffffffffffff");
    }
}
