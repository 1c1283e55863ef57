//! Simulated pool for benchmarking.
//!
//! Produces one synthetic job at a configured difficulty and block, and
//! accepts every submission. Lets the full farm pipeline run at speed with
//! no network in the loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::endpoint::PoolEndpoint;
use crate::meowpow;
use crate::pool::client::{ClientEvent, PoolClient, EVENT_CHANNEL_CAPACITY};
use crate::tracing::prelude::*;
use crate::types::{boundary_from_difficulty, Hash256};
use crate::work::{Solution, WorkPackage};

pub struct SimulateClient {
    benchmark_block: u64,
    benchmark_diff: f64,
    endpoint: Option<Arc<PoolEndpoint>>,
    connected: bool,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    session_start: Option<Instant>,
}

impl SimulateClient {
    pub fn new(benchmark_block: u64, benchmark_diff: f64) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            benchmark_block,
            benchmark_diff,
            endpoint: None,
            connected: false,
            event_tx,
            event_rx: Some(event_rx),
            session_start: None,
        }
    }

    /// Deterministic header for the benchmark block, so repeated runs
    /// search identical work.
    fn synthetic_header(block: u64) -> Hash256 {
        let mut bytes = [0x5a_u8; 32];
        bytes[24..].copy_from_slice(&block.to_be_bytes());
        Hash256::from_bytes(bytes)
    }

    fn synthetic_work(&self) -> WorkPackage {
        let epoch = meowpow::epoch_from_block(self.benchmark_block);
        WorkPackage {
            job: "simulation".to_string(),
            header: Self::synthetic_header(self.benchmark_block),
            seed: meowpow::seed_from_epoch(epoch),
            boundary: boundary_from_difficulty(self.benchmark_diff),
            epoch: Some(epoch),
            block: Some(self.benchmark_block),
            ..WorkPackage::default()
        }
    }
}

#[async_trait]
impl PoolClient for SimulateClient {
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
        self.connected
    }

    fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    fn active_endpoint(&self) -> Option<SocketAddr> {
        None
    }

    async fn connect(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        self.session_start = Some(Instant::now());
        info!(
            block = self.benchmark_block,
            difficulty = self.benchmark_diff,
            "Simulation session starting"
        );
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        let _ = self
            .event_tx
            .send(ClientEvent::WorkReceived(self.synthetic_work()))
            .await;
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let _ = self.event_tx.send(ClientEvent::Disconnected).await;
    }

    async fn submit_solution(&self, solution: Solution) {
        if !self.connected {
            return;
        }
        let submitted = Instant::now();
        debug!(
            nonce = format!("{:#018x}", solution.nonce),
            "Simulation accepting solution"
        );
        let _ = self
            .event_tx
            .send(ClientEvent::SolutionAccepted {
                delay: submitted.elapsed(),
                miner_index: solution.miner_index,
                stale: false,
            })
            .await;
    }

    async fn submit_hashrate(&self, _rate: u64, _id: &str) {}
}
