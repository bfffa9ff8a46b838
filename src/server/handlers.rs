//! Method handlers for participant connections.

use std::sync::atomic::Ordering;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::rpc::{ExistsParams, SessionAssignment, StartSessionParams};
use super::SharedState;
use crate::config::AssignCount;
use crate::error::{AppError, AppResult, AssignmentError, ProtocolError};

/// Routing keys of a result message. The first name is current, the second
/// is accepted from older clients.
const EXPERIMENT_KEYS: [&str; 2] = ["experimentId", "dbname"];
const COLLECTION_KEYS: [&str; 2] = ["collectionId", "colname"];

/// Parse a method's parameters, treating a missing object as `{}`.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Option<Value>,
) -> AppResult<T> {
    let value = params.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(value).map_err(|e| {
        ProtocolError::InvalidParameters {
            method: method.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Register a session and claim its stimuli.
///
/// The session is discarded again if the main pool cannot serve it, so a
/// participant never starts with zero stimuli.
pub async fn handle_start_session(
    state: &SharedState,
    params: StartSessionParams,
) -> AppResult<SessionAssignment> {
    let pool_id = params
        .pool_id
        .unwrap_or_else(|| state.config.pool.stimulus_pool.clone());
    let familiarization_pool = params
        .familiarization_pool_id
        .or_else(|| state.config.pool.familiarization_pool.clone());
    let count = match params.count {
        Some(count) => count
            .to_assign_count(state.config.pool.max_per_session)
            .map_err(|message| {
            AppError::from(ProtocolError::InvalidParameters {
                method: super::rpc::methods::START_SESSION.to_string(),
                message,
            })
        })?,
        None => state.config.pool.per_session,
    };

    let session_id = state.registry.create(params.participant).await;

    let stimuli = match state.balancer.assign(&pool_id, &session_id, count).await {
        Ok(items) => items,
        Err(e) => {
            state.registry.remove(&session_id).await;
            state.stats.assignment_failures.fetch_add(1, Ordering::Relaxed);
            warn!(pool_id = %pool_id, session_id = %session_id, error = %e, "Session setup aborted");
            return Err(e.into());
        }
    };

    let familiarization_stimuli = match familiarization_pool {
        Some(fam_pool) => match state
            .balancer
            .assign(&fam_pool, &session_id, AssignCount::All)
            .await
        {
            Ok(items) => items,
            Err(AssignmentError::EmptyPool { .. }) => {
                warn!(pool_id = %fam_pool, "Familiarization pool is empty, skipping practice trials");
                Vec::new()
            }
            Err(e) => {
                state.balancer.release(&session_id, &stimuli).await;
                state.registry.remove(&session_id).await;
                state.stats.assignment_failures.fetch_add(1, Ordering::Relaxed);
                warn!(pool_id = %fam_pool, session_id = %session_id, error = %e, "Session setup aborted");
                return Err(e.into());
            }
        },
        None => Vec::new(),
    };

    state
        .registry
        .attach_stimuli(&session_id, stimuli.clone(), familiarization_stimuli.clone())
        .await;
    state.stats.sessions_started.fetch_add(1, Ordering::Relaxed);

    info!(
        session_id = %session_id,
        pool_id = %pool_id,
        stimuli = stimuli.len(),
        familiarization = familiarization_stimuli.len(),
        "Session started"
    );

    Ok(SessionAssignment {
        session_id,
        stimuli,
        familiarization_stimuli,
        stim_version: state.config.pool.stim_version.clone(),
    })
}

fn take_routing_key(body: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    let mut found = None;
    for key in keys {
        if let Some(value) = body.remove(*key) {
            if found.is_none() {
                found = value.as_str().map(str::to_string);
            }
        }
    }
    found
}

/// Persist one trial result, minus its routing fields.
///
/// Returns the stored document id. Failures are counted here; the caller
/// decides whether anyone hears about them.
pub async fn handle_trial_data(state: &SharedState, params: Option<Value>) -> AppResult<String> {
    let mut body = match params {
        Some(Value::Object(body)) => body,
        _ => {
            state.stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ProtocolError::InvalidParameters {
                method: super::rpc::methods::TRIAL_DATA.to_string(),
                message: "expected a JSON object".to_string(),
            }
            .into());
        }
    };

    let experiment = take_routing_key(&mut body, &EXPERIMENT_KEYS);
    let collection = take_routing_key(&mut body, &COLLECTION_KEYS);
    let (Some(database), Some(collection)) = (experiment, collection) else {
        state.stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
        return Err(ProtocolError::InvalidParameters {
            method: super::rpc::methods::TRIAL_DATA.to_string(),
            message: "experimentId and collectionId are required".to_string(),
        }
        .into());
    };

    match state
        .storage
        .insert_document(&database, &collection, &Value::Object(body))
        .await
    {
        Ok(id) => {
            state.stats.documents_stored.fetch_add(1, Ordering::Relaxed);
            Ok(id)
        }
        Err(e) => {
            state.stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
            error!(database = %database, collection = %collection, error = %e, "Failed to store trial data");
            Err(e.into())
        }
    }
}

/// Whether a matching document is already stored.
pub async fn handle_document_exists(state: &SharedState, params: ExistsParams) -> AppResult<bool> {
    let exists = state
        .storage
        .document_exists(
            &params.database,
            &params.collection,
            &params.field,
            &params.value,
        )
        .await?;
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{StorageError, StorageResult};
    use crate::server::rpc::CountParam;
    use crate::server::AppState;
    use crate::storage::{PoolFilter, SqliteStorage, StimulusItem, Storage, StoredDocument};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// Storage that cannot read the practice pool.
    struct PracticeOutage {
        inner: SqliteStorage,
    }

    #[async_trait]
    impl Storage for PracticeOutage {
        async fn insert_stimulus(&self, item: &StimulusItem) -> StorageResult<()> {
            self.inner.insert_stimulus(item).await
        }

        async fn load(&self, filter: &PoolFilter) -> StorageResult<Vec<StimulusItem>> {
            if filter.pool_id == "practice" {
                return Err(StorageError::Query {
                    message: "practice pool unavailable".to_string(),
                });
            }
            self.inner.load(filter).await
        }

        async fn least_used(
            &self,
            filter: &PoolFilter,
            limit: usize,
        ) -> StorageResult<Vec<StimulusItem>> {
            self.inner.least_used(filter, limit).await
        }

        async fn increment_usage(
            &self,
            item_id: &str,
            session_id: &str,
            ceiling: Option<i64>,
        ) -> StorageResult<bool> {
            self.inner.increment_usage(item_id, session_id, ceiling).await
        }

        async fn release_usage(&self, item_id: &str, session_id: &str) -> StorageResult<bool> {
            self.inner.release_usage(item_id, session_id).await
        }

        async fn insert_document(
            &self,
            database: &str,
            collection: &str,
            document: &Value,
        ) -> StorageResult<String> {
            self.inner.insert_document(database, collection, document).await
        }

        async fn document_exists(
            &self,
            database: &str,
            collection: &str,
            field: &str,
            value: &Value,
        ) -> StorageResult<bool> {
            self.inner
                .document_exists(database, collection, field, value)
                .await
        }

        async fn get_documents(
            &self,
            database: &str,
            collection: &str,
        ) -> StorageResult<Vec<StoredDocument>> {
            self.inner.get_documents(database, collection).await
        }
    }

    #[tokio::test]
    async fn test_familiarization_failure_releases_main_claims() {
        let inner = SqliteStorage::new_in_memory().await.unwrap();
        for id in ["A", "B"] {
            inner
                .insert_stimulus(&StimulusItem::new("main", json!({})).with_id(id))
                .await
                .unwrap();
        }
        let storage = Arc::new(PracticeOutage { inner });

        let mut config = Config::default();
        config.pool.stimulus_pool = "main".to_string();
        config.pool.familiarization_pool = Some("practice".to_string());
        let state: SharedState = Arc::new(AppState::new(config, storage.clone()));

        let result = handle_start_session(&state, StartSessionParams::default()).await;
        assert!(matches!(result, Err(AppError::Assignment(_))));

        let items = storage.load(&PoolFilter::pool("main")).await.unwrap();
        assert!(items.iter().all(|i| i.usage_count == 0 && i.claimed_by.is_empty()));
        assert!(state.registry.is_empty().await);
        assert_eq!(state.stats.snapshot().assignment_failures, 1);
    }

    #[tokio::test]
    async fn test_count_above_max_is_invalid_params() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let mut config = Config::default();
        config.pool.max_per_session = 5;
        let state: SharedState = Arc::new(AppState::new(config, storage));

        let params = StartSessionParams {
            count: Some(CountParam::Limit(100_000_000_000)),
            ..Default::default()
        };
        let err = handle_start_session(&state, params).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Protocol(ProtocolError::InvalidParameters { .. })
        ));
        assert!(state.registry.is_empty().await);
    }

    #[test]
    fn test_take_routing_key_prefers_current_name_and_strips_both() {
        let mut body = json!({
            "experimentId": "human_physics_benchmarking",
            "dbname": "legacy",
            "response": "YES"
        })
        .as_object()
        .cloned()
        .unwrap();

        let found = take_routing_key(&mut body, &EXPERIMENT_KEYS);
        assert_eq!(found.as_deref(), Some("human_physics_benchmarking"));
        assert!(!body.contains_key("dbname"));
        assert!(body.contains_key("response"));
    }

    #[test]
    fn test_take_routing_key_accepts_legacy_name() {
        let mut body = json!({"colname": "dominoes_pilot"}).as_object().cloned().unwrap();
        assert_eq!(
            take_routing_key(&mut body, &COLLECTION_KEYS).as_deref(),
            Some("dominoes_pilot")
        );
        assert!(body.is_empty());
    }

    #[test]
    fn test_parse_params_missing_object() {
        let params: StartSessionParams = parse_params("session/start", None).unwrap();
        assert!(params.pool_id.is_none());

        let err = parse_params::<StartSessionParams>("session/start", Some(json!({"count": []})))
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Protocol(ProtocolError::InvalidParameters { .. })
        ));
    }
}
