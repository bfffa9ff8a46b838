//! In-process registry of live participant sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::storage::StimulusItem;

/// Identifiers the recruiting platform passes along with a participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Platform-wide participant id (e.g. `PROLIFIC_PID`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prolific_id: Option<String>,
    /// Study id on the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_id: Option<String>,
    /// Submission id on the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// One participant's run through the experiment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Generated session id, unique for the pool's lifetime.
    pub id: String,
    /// Platform identifiers.
    pub participant: ParticipantInfo,
    /// Main-block stimuli, in presentation order.
    pub stimuli: Vec<StimulusItem>,
    /// Familiarization stimuli, in presentation order.
    pub familiarization_stimuli: Vec<StimulusItem>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a session with a fresh id and no stimuli yet.
    pub fn new(participant: ParticipantInfo) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participant,
            stimuli: Vec::new(),
            familiarization_stimuli: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Registry of sessions owned by open connections.
///
/// Sessions live only as long as the connection that created them; nothing
/// here is persisted.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a session, returning its id.
    pub async fn create(&self, participant: ParticipantInfo) -> String {
        let session = Session::new(participant);
        let id = session.id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    /// Attach assigned stimuli to a session. Returns `false` if it is gone.
    pub async fn attach_stimuli(
        &self,
        id: &str,
        stimuli: Vec<StimulusItem>,
        familiarization_stimuli: Vec<StimulusItem>,
    ) -> bool {
        match self.sessions.write().await.get_mut(id) {
            Some(session) => {
                session.stimuli = stimuli;
                session.familiarization_stimuli = familiarization_stimuli;
                true
            }
            None => false,
        }
    }

    /// Get a snapshot of a session.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Drop a session, returning it if it existed.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.write().await.remove(id)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_remove() {
        let registry = SessionRegistry::new();
        let id = registry.create(ParticipantInfo::default()).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&id).await.is_some());

        let removed = registry.remove(&id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(registry.is_empty().await);
        assert!(registry.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.create(ParticipantInfo::default()).await;
        let b = registry.create(ParticipantInfo::default()).await;
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_attach_stimuli() {
        let registry = SessionRegistry::new();
        let id = registry
            .create(ParticipantInfo {
                prolific_id: Some("P1".to_string()),
                ..Default::default()
            })
            .await;

        let item = StimulusItem::new("pool", json!({})).with_id("a");
        assert!(registry.attach_stimuli(&id, vec![item], Vec::new()).await);
        assert!(!registry.attach_stimuli("missing", Vec::new(), Vec::new()).await);

        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.stimuli.len(), 1);
        assert_eq!(session.participant.prolific_id.as_deref(), Some("P1"));
    }
}
