//! Experiment server.
//!
//! This module provides:
//! - the TCP listener accepting one connection per participant
//! - the line-delimited JSON-RPC loop run for each connection
//! - method handlers for session start, trial data and document lookups
//! - shared application state and operator-facing counters

mod connection;
mod handlers;
pub mod rpc;

pub use connection::Connection;
pub use handlers::{handle_document_exists, handle_start_session, handle_trial_data};
pub use rpc::{
    CountParam, ExistsParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, SessionAssignment,
    StartSessionParams,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::balancer::StimulusBalancer;
use crate::config::Config;
use crate::session::SessionRegistry;
use crate::storage::Storage;

/// Operator-facing counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub sessions_started: AtomicU64,
    pub assignment_failures: AtomicU64,
    pub documents_stored: AtomicU64,
    pub persistence_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub assignment_failures: u64,
    pub documents_stored: u64,
    pub persistence_failures: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            assignment_failures: self.assignment_failures.load(Ordering::Relaxed),
            documents_stored: self.documents_stored.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

/// Application state shared across connections.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Stimulus pool and document storage.
    pub storage: Arc<dyn Storage>,
    /// Least-used stimulus assignment.
    pub balancer: StimulusBalancer,
    /// Live sessions.
    pub registry: SessionRegistry,
    pub stats: ServerStats,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        let balancer = StimulusBalancer::new(storage.clone(), &config.balancer);
        Self {
            config,
            storage,
            balancer,
            registry: SessionRegistry::new(),
            stats: ServerStats::default(),
        }
    }
}

/// Shared application state handle.
pub type SharedState = Arc<AppState>;

/// Accepts participant connections and serves each on its own task.
pub struct ExperimentServer {
    state: SharedState,
}

impl ExperimentServer {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let bind_addr = self.state.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Experiment server listening on {}", bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let state = self.state.clone();

            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                let connection = Connection::new(state, peer.to_string());
                if let Err(e) = connection.run(reader, writer).await {
                    error!(peer = %peer, error = %e, "Connection failed");
                }
            });
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }
}
