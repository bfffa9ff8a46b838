//! Trial kinds and the raw result a rendered trial produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::StimulusItem;

/// What a timeline entry presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialKind {
    Fixation,
    StimulusResponse,
    FamiliarizationPre,
    FamiliarizationFeedback,
    Survey,
    Instructions,
}

impl TrialKind {
    /// Whether completing this kind updates the running accuracy.
    pub fn is_scored(self) -> bool {
        matches!(
            self,
            TrialKind::StimulusResponse | TrialKind::FamiliarizationPre
        )
    }

    /// Whether this kind belongs to the practice block.
    pub fn is_familiarization(self) -> bool {
        matches!(
            self,
            TrialKind::FamiliarizationPre | TrialKind::FamiliarizationFeedback
        )
    }

    /// Short name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TrialKind::Fixation => "fixation",
            TrialKind::StimulusResponse => "stimulus_response",
            TrialKind::FamiliarizationPre => "familiarization_pre",
            TrialKind::FamiliarizationFeedback => "familiarization_feedback",
            TrialKind::Survey => "survey",
            TrialKind::Instructions => "instructions",
        }
    }
}

impl std::fmt::Display for TrialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of presenting one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialResult {
    pub trial_kind: TrialKind,
    /// Position in the timeline.
    pub trial_index: usize,
    /// Position within the block, for stimulus trials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_num: Option<usize>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub reaction_time_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Ended by its duration rather than a response.
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus_payload: Option<Value>,
    /// Ground-truth labels echoed from the stimulus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus_metadata: Option<Value>,
    /// Plugin-specific output such as survey answers.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl TrialResult {
    /// Empty result for a trial starting now.
    pub fn new(trial_kind: TrialKind, trial_index: usize) -> Self {
        let now = Utc::now();
        Self {
            trial_kind,
            trial_index,
            trial_num: None,
            response: None,
            reaction_time_ms: None,
            started_at: now,
            ended_at: now,
            timed_out: false,
            condition: None,
            stimulus_id: None,
            stimulus_payload: None,
            labels: None,
            stimulus_metadata: None,
            data: Map::new(),
        }
    }

    /// Copy the stimulus' identity and labels into the result.
    pub fn echo_stimulus(mut self, item: &StimulusItem) -> Self {
        self.stimulus_id = Some(item.id.clone());
        self.stimulus_payload = Some(item.payload.clone());
        self.labels = Some(item.labels.clone());
        self.stimulus_metadata = item.metadata.clone();
        self
    }

    /// Set the response and its latency, ending the trial now.
    pub fn with_response(mut self, response: impl Into<String>, reaction_time_ms: u64) -> Self {
        self.response = Some(response.into());
        self.reaction_time_ms = Some(reaction_time_ms);
        self.ended_at = Utc::now();
        self
    }

    /// Attach one plugin-specific field.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}
