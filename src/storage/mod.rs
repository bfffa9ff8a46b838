//! Storage layer for stimulus pools and trial documents.
//!
//! This module provides SQLite-based storage for the stimulus pool (items plus
//! their usage counters and claim history) and for the opaque result
//! documents recorded by participants.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

/// One unit of experimental material in a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulusItem {
    /// Unique stimulus identifier.
    pub id: String,
    /// Pool the item belongs to.
    pub pool_id: String,
    /// Media references and presentation data (e.g. `stim_url`, `map_url`).
    pub payload: serde_json::Value,
    /// Ground-truth labels used for scoring (e.g. `target_hit_zone_label`).
    pub labels: serde_json::Value,
    /// Free-form metadata echoed back with results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Times the item has been claimed by a session.
    #[serde(default)]
    pub usage_count: i64,
    /// Sessions that received the item, oldest first.
    #[serde(default)]
    pub claimed_by: Vec<String>,
}

impl StimulusItem {
    /// Create an unclaimed item with a generated id.
    pub fn new(pool_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pool_id: pool_id.into(),
            payload,
            labels: serde_json::Value::Object(Default::default()),
            metadata: None,
            usage_count: 0,
            claimed_by: Vec::new(),
        }
    }

    /// Set the identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the ground-truth labels.
    pub fn with_labels(mut self, labels: serde_json::Value) -> Self {
        self.labels = labels;
        self
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Look up a ground-truth label by name.
    pub fn label(&self, name: &str) -> Option<&serde_json::Value> {
        self.labels.get(name)
    }

    /// Primary media reference, if the payload carries one.
    pub fn media_url(&self) -> Option<&str> {
        self.payload.get("stim_url").and_then(|v| v.as_str())
    }

    /// Record a successful claim on this in-memory copy.
    pub(crate) fn mark_claimed(&mut self, session_id: &str) {
        self.usage_count += 1;
        self.claimed_by.push(session_id.to_string());
    }
}

/// Stimulus record as written in a seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct NewStimulus {
    /// Optional explicit id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Media references.
    pub payload: serde_json::Value,
    /// Ground-truth labels.
    #[serde(default)]
    pub labels: Option<serde_json::Value>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NewStimulus {
    /// Turn the seed record into a pool item.
    pub fn into_item(self, pool_id: &str) -> StimulusItem {
        let mut item = StimulusItem::new(pool_id, self.payload);
        if let Some(id) = self.id {
            item = item.with_id(id);
        }
        if let Some(labels) = self.labels {
            item = item.with_labels(labels);
        }
        if let Some(metadata) = self.metadata {
            item = item.with_metadata(metadata);
        }
        item
    }
}

/// Selects items of one pool, optionally leaving some out.
#[derive(Debug, Clone, Default)]
pub struct PoolFilter {
    /// Pool to read.
    pub pool_id: String,
    /// Item ids to leave out of the result.
    pub exclude: Vec<String>,
}

impl PoolFilter {
    /// Filter matching the whole pool.
    pub fn pool(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            exclude: Vec::new(),
        }
    }

    /// Leave the given ids out.
    pub fn excluding(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.exclude.extend(ids);
        self
    }
}

/// A persisted result document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Unique document identifier.
    pub id: String,
    /// Database (experiment) name.
    pub database: String,
    /// Collection name.
    pub collection: String,
    /// The document as received.
    pub body: serde_json::Value,
    /// When the document was stored.
    pub created_at: DateTime<Utc>,
}

/// Storage trait for pool and document persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    // Stimulus pool operations

    /// Add an item to its pool.
    async fn insert_stimulus(&self, item: &StimulusItem) -> StorageResult<()>;
    /// Load all matching items in insertion order.
    async fn load(&self, filter: &PoolFilter) -> StorageResult<Vec<StimulusItem>>;
    /// Up to `limit` matching items, least used first, ties in insertion order.
    async fn least_used(&self, filter: &PoolFilter, limit: usize)
        -> StorageResult<Vec<StimulusItem>>;
    /// Atomically bump an item's usage counter and record the claim.
    ///
    /// With a `ceiling`, the claim only succeeds while the stored counter is
    /// at most `ceiling`. Returns `false` (and changes nothing) otherwise, or
    /// when the item does not exist.
    async fn increment_usage(
        &self,
        item_id: &str,
        session_id: &str,
        ceiling: Option<i64>,
    ) -> StorageResult<bool>;
    /// Undo one claim `session_id` holds on an item: drop the claim record
    /// and decrement the counter together. Returns `false` when the session
    /// holds no claim on the item.
    async fn release_usage(&self, item_id: &str, session_id: &str) -> StorageResult<bool>;

    // Document operations

    /// Store a document verbatim and return its id.
    async fn insert_document(
        &self,
        database: &str,
        collection: &str,
        document: &serde_json::Value,
    ) -> StorageResult<String>;
    /// Whether any document in the collection has `field == value`.
    async fn document_exists(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> StorageResult<bool>;
    /// All documents of a collection, oldest first.
    async fn get_documents(
        &self,
        database: &str,
        collection: &str,
    ) -> StorageResult<Vec<StoredDocument>>;
}
