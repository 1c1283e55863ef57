//! The uniform pool-client surface.
//!
//! Every protocol variant (stratum, getwork, simulator) is a state machine
//! behind the same trait: the manager binds exactly one client at a time,
//! takes its event receiver once, and reads the five protocol events from
//! it. Events from a client the manager has already dropped land in a
//! closed channel and vanish, which is what breaks the manager/client
//! callback cycle of classic designs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::endpoint::PoolEndpoint;
use crate::work::{Solution, WorkPackage};

/// Protocol events, delivered in arrival order.
///
/// Guarantees every client upholds:
/// - `Connected` precedes any `WorkReceived`;
/// - `Disconnected` is the last event of a client instance, and fires at
///   most once — including after a failed connection attempt;
/// - submission responses carry the wall-clock round trip from
///   `submit_solution` to reply parse.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    WorkReceived(WorkPackage),
    SolutionAccepted {
        delay: Duration,
        miner_index: usize,
        stale: bool,
    },
    SolutionRejected {
        delay: Duration,
        miner_index: usize,
    },
}

/// Capacity of a client's event channel. Pools emit a handful of messages
/// per job; 64 never backpressures in practice.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One pool connection attempt.
///
/// A client is built per attempt and never reused: `connect` is
/// at-most-once (a second call while connected or connecting is a no-op),
/// and after `Disconnected` the instance is dead.
#[async_trait]
pub trait PoolClient: Send {
    /// Bind the endpoint this client will talk to.
    fn set_connection(&mut self, endpoint: Arc<PoolEndpoint>);

    /// Drop the endpoint binding.
    fn unset_connection(&mut self);

    /// The bound endpoint.
    fn connection(&self) -> Option<Arc<PoolEndpoint>>;

    /// Whether the session is established (post-handshake for stratum).
    fn is_connected(&self) -> bool;

    /// Take the event receiver. Yields `Some` exactly once.
    fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>>;

    /// Resolved remote address, for display purposes.
    fn active_endpoint(&self) -> Option<SocketAddr>;

    /// Start the connection attempt. Progress and failure are reported
    /// through events, never a return value.
    async fn connect(&mut self);

    /// Tear the session down; `Disconnected` follows.
    async fn disconnect(&mut self);

    /// Submit a found solution. Silently discarded while not connected
    /// (the manager logs the waste).
    async fn submit_solution(&self, solution: Solution);

    /// Report hashrate under the given id. Best effort.
    async fn submit_hashrate(&self, rate: u64, id: &str);
}
