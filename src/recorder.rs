//! Result annotation and best-effort forwarding.
//!
//! Completed trials are annotated with session and experiment identifiers and
//! handed to a [`ResultForwarder`]. The forwarder queues them and a background
//! task delivers them to a [`ResultSink`] with bounded retries. Nothing here
//! ever blocks or fails the trial that produced the result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::RecorderConfig;
use crate::error::{RecorderError, RecorderResult};
use crate::experiment::{ExperimentProfile, Scorer, TrialResult};
use crate::session::ParticipantInfo;

/// A trial result plus the identifiers needed to route and analyse it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedRecord {
    #[serde(flatten)]
    pub result: TrialResult,
    pub session_id: String,
    /// Database the record belongs to.
    pub experiment_id: String,
    pub collection_id: String,
    pub iteration_tag: String,
    pub correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantInfo>,
}

/// Annotates results for one session.
#[derive(Debug, Clone)]
pub struct ResultRecorder {
    session_id: String,
    experiment_id: String,
    collection_id: String,
    iteration_tag: String,
    /// Tag for practice-block records, from the familiarization overlay.
    familiarization_tag: String,
    participant: Option<ParticipantInfo>,
    scorer: Scorer,
}

impl ResultRecorder {
    /// Recorder for `session_id` routing into the profile's collection.
    pub fn new(session_id: impl Into<String>, profile: &ExperimentProfile) -> Self {
        Self {
            session_id: session_id.into(),
            experiment_id: profile.database.clone(),
            collection_id: profile.collection.clone(),
            iteration_tag: profile.iteration_name.clone(),
            familiarization_tag: profile.familiarization_profile().iteration_name,
            participant: None,
            scorer: profile.scorer(),
        }
    }

    /// Attach platform identifiers to every record.
    pub fn with_participant(mut self, participant: ParticipantInfo) -> Self {
        self.participant = Some(participant);
        self
    }

    /// Build a new annotated record; `result` is left untouched.
    pub fn annotate(&self, result: &TrialResult) -> AnnotatedRecord {
        let iteration_tag = if result.trial_kind.is_familiarization() {
            &self.familiarization_tag
        } else {
            &self.iteration_tag
        };
        AnnotatedRecord {
            result: result.clone(),
            session_id: self.session_id.clone(),
            experiment_id: self.experiment_id.clone(),
            collection_id: self.collection_id.clone(),
            iteration_tag: iteration_tag.clone(),
            correct: self.scorer.score(result),
            participant: self.participant.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Destination of forwarded records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver one record.
    async fn send(&self, record: &AnnotatedRecord) -> RecorderResult<()>;
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    forwarded: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl ForwarderStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ForwarderSnapshot {
        ForwarderSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwarderSnapshot {
    pub forwarded: u64,
    pub retried: u64,
    pub dropped: u64,
}

/// Non-blocking handle for queueing records.
///
/// The background task stops once every clone of the handle is dropped and
/// the queue has drained; its join handle yields the final counters.
#[derive(Clone)]
pub struct ResultForwarder {
    tx: mpsc::Sender<AnnotatedRecord>,
    stats: Arc<ForwarderStats>,
    capacity: usize,
}

impl ResultForwarder {
    /// Start the delivery task.
    pub fn spawn(
        sink: Arc<dyn ResultSink>,
        config: &RecorderConfig,
    ) -> (Self, JoinHandle<ForwarderSnapshot>) {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(ForwarderStats::default());

        let worker = tokio::spawn(deliver_loop(
            rx,
            sink,
            stats.clone(),
            config.max_retries,
            config.retry_delay_ms,
        ));

        (
            Self {
                tx,
                stats,
                capacity,
            },
            worker,
        )
    }

    /// Queue a record for delivery without waiting.
    ///
    /// A full queue drops the record (counted); the error is informational.
    pub fn forward(&self, record: AnnotatedRecord) -> RecorderResult<()> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %record.session_id,
                    trial_index = record.result.trial_index,
                    capacity = self.capacity,
                    "Result queue full, dropping record"
                );
                Err(RecorderError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(RecorderError::Closed)
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ForwarderSnapshot {
        self.stats.snapshot()
    }
}

/// Exponential backoff before retry number `retry` (1-based), saturating
/// instead of overflowing.
fn backoff_delay(retry_delay_ms: u64, retry: u32) -> Duration {
    let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
    Duration::from_millis(retry_delay_ms.saturating_mul(factor))
}

async fn deliver_loop(
    mut rx: mpsc::Receiver<AnnotatedRecord>,
    sink: Arc<dyn ResultSink>,
    stats: Arc<ForwarderStats>,
    max_retries: u32,
    retry_delay_ms: u64,
) -> ForwarderSnapshot {
    while let Some(record) = rx.recv().await {
        let mut retries = 0u32;
        let mut last_error = None;

        while retries <= max_retries {
            if retries > 0 {
                let delay = backoff_delay(retry_delay_ms, retries);
                warn!(
                    session_id = %record.session_id,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying result delivery"
                );
                stats.retried.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
            }

            match sink.send(&record).await {
                Ok(()) => {
                    debug!(
                        session_id = %record.session_id,
                        trial_index = record.result.trial_index,
                        "Result delivered"
                    );
                    stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    last_error = None;
                    break;
                }
                Err(e) => {
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        if let Some(e) = last_error {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                session_id = %record.session_id,
                trial_index = record.result.trial_index,
                error = %e,
                retries = max_retries,
                "Dropping result after exhausting retries"
            );
        }
    }

    stats.snapshot()
}
