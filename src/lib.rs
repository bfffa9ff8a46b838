//! # Trial Orchestrator
//!
//! Stimulus distribution and trial orchestration for crowd-sourced
//! perceptual-judgment experiments.
//!
//! ## Features
//!
//! - **Stimulus Balancing**: least-served-first assignment with claim-before-handoff
//! - **Session Registry**: per-connection participant sessions
//! - **Trial Timelines**: intro, familiarization with feedback, fixation-interleaved main block, survey, farewell
//! - **Feedback Tracking**: running accuracy feeding deferred prompts
//! - **Result Recording**: annotation plus queued, retried forwarding
//!
//! ## Architecture
//!
//! ```text
//! Participant (TimelineDriver) ⇄ ExperimentClient ⇄ ExperimentServer (Rust)
//!                                                        ↓
//!                                              SQLite (pools, documents)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trial_orchestrator::{AppState, Config, ExperimentServer};
//! use trial_orchestrator::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let state = Arc::new(AppState::new(config, Arc::new(storage)));
//!     ExperimentServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

/// Least-used stimulus assignment.
pub mod balancer;
/// Operator commands (seed, status, export).
pub mod cli;
/// Participant-side JSON-RPC client.
pub mod client;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Timeline building, feedback and the participant-side driver.
pub mod experiment;
/// Result annotation and forwarding.
pub mod recorder;
/// Experiment server and request handling.
pub mod server;
/// Live session registry.
pub mod session;
/// SQLite storage layer for pools and documents.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, ExperimentServer, SharedState};
