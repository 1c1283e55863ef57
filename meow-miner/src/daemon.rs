//! Daemon lifecycle management.
//!
//! Wires the farm and the pool manager together, installs signal
//! handlers, and runs until a signal arrives or the manager burns through
//! its connection list.

use tokio::signal::unix::{self, SignalKind};

use crate::config::Settings;
use crate::farm::{Farm, SyntheticBackend};
use crate::pool::PoolManager;
use crate::tracing::prelude::*;

/// Exit status of a daemon run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stopped on request (signal).
    Clean,
    /// The manager hit the `"exit"` sentinel or ran out of endpoints.
    ConnectionsExhausted,
}

/// The main daemon.
pub struct Daemon {
    settings: Settings,
}

impl Daemon {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<Outcome> {
        let farm = Farm::new(
            self.settings.farm.clone(),
            Box::new(|index| Box::new(SyntheticBackend::new(index))),
        );

        let manager = PoolManager::new(self.settings.pool.clone(), farm.clone());
        let endpoints = self.settings.endpoints()?;
        if endpoints.is_empty() {
            info!("No pools configured, running a local simulation");
            manager.add_connection_str("simulation://localhost:0")?;
        } else {
            for endpoint in endpoints {
                manager.add_connection(endpoint);
            }
        }

        let exited = manager.exited();
        manager.start()?;
        info!("Started.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        let outcome = tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
                Outcome::Clean
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                Outcome::Clean
            }
            _ = exited.cancelled() => Outcome::ConnectionsExhausted,
        };

        manager.stop().await;
        info!(telemetry = %farm.telemetry(), "Exiting.");
        Ok(outcome)
    }
}
