//! Running-accuracy state and the prompts computed from it.
//!
//! Prompts that depend on how the participant is doing are not fixed when the
//! timeline is built. They are produced by the pure functions in this module,
//! called with the current [`FeedbackState`] right before the trial renders.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::trial::TrialResult;

/// How a response is compared with a stimulus' ground-truth label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ScoringRule {
    /// The response text equals the label (strings, numbers and booleans
    /// compared by their text form).
    Exact,
    /// The label is a boolean that must equal `response == yes`.
    Affirmative {
        /// The choice that means "the event happens".
        yes: String,
    },
}

impl Default for ScoringRule {
    fn default() -> Self {
        ScoringRule::Exact
    }
}

impl ScoringRule {
    /// Score one response. Missing responses or labels are incorrect.
    pub fn score(&self, response: Option<&str>, label: Option<&Value>) -> bool {
        let (Some(response), Some(label)) = (response, label) else {
            return false;
        };

        match self {
            ScoringRule::Exact => match label {
                Value::String(s) => s == response,
                Value::Number(n) => n.to_string() == response,
                Value::Bool(b) => b.to_string() == response,
                _ => false,
            },
            ScoringRule::Affirmative { yes } => label
                .as_bool()
                .map(|expected| expected == (response == yes))
                .unwrap_or(false),
        }
    }
}

/// A scoring rule bound to the label it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scorer {
    rule: ScoringRule,
    label_field: String,
}

impl Scorer {
    /// Create a scorer reading `label_field` from the echoed labels.
    pub fn new(rule: ScoringRule, label_field: impl Into<String>) -> Self {
        Self {
            rule,
            label_field: label_field.into(),
        }
    }

    /// Whether the result's response matches its ground truth.
    pub fn score(&self, result: &TrialResult) -> bool {
        let label = result
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.label_field));
        self.rule.score(result.response.as_deref(), label)
    }

    /// The rule in use.
    pub fn rule(&self) -> &ScoringRule {
        &self.rule
    }
}

/// Running correctness counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackState {
    pub correct_count: u32,
    pub total_count: u32,
    pub last_was_correct: Option<bool>,
    pub last_response: Option<String>,
}

impl FeedbackState {
    /// Share of correct answers as a whole percentage, 0 before any trial.
    pub fn percentage_correct(&self) -> u32 {
        if self.total_count == 0 {
            return 0;
        }
        (f64::from(self.correct_count) / f64::from(self.total_count) * 100.0).round() as u32
    }
}

/// Updates [`FeedbackState`] as scored trials complete.
#[derive(Debug, Clone)]
pub struct FeedbackTracker {
    scorer: Scorer,
    state: FeedbackState,
}

impl FeedbackTracker {
    /// Create a tracker with zeroed counters.
    pub fn new(scorer: Scorer) -> Self {
        Self {
            scorer,
            state: FeedbackState::default(),
        }
    }

    /// Fold one completed trial into the counters.
    pub fn record(&mut self, result: &TrialResult) -> &FeedbackState {
        let correct = self.scorer.score(result);
        self.state.total_count += 1;
        if correct {
            self.state.correct_count += 1;
        }
        self.state.last_was_correct = Some(correct);
        self.state.last_response = result.response.clone();
        &self.state
    }

    /// Zero the counters between the familiarization and main blocks.
    ///
    /// The last-trial fields are kept; only the running totals restart.
    pub fn reset_counts(&mut self) {
        self.state.correct_count = 0;
        self.state.total_count = 0;
    }

    /// Current state.
    pub fn state(&self) -> &FeedbackState {
        &self.state
    }
}

/// Wording of the feedback shown after a familiarization trial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum FeedbackStyle {
    /// Only whether the prediction was right.
    Outcome,
    /// Whether it was right, and what actually happened.
    OutcomeWithAnswer {
        /// The choice meaning "the event happens".
        affirmative: String,
        /// Sentence stating the event happened.
        happened: String,
        /// Sentence stating the event did not happen.
        did_not_happen: String,
        /// Replaces `happened` when the participant predicted it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirm_happened: Option<String>,
        /// Replaces `did_not_happen` when the participant predicted it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirm_did_not_happen: Option<String>,
    },
}

impl Default for FeedbackStyle {
    fn default() -> Self {
        FeedbackStyle::Outcome
    }
}

const FULL_VIDEO: &str = "Above, you see the full video.";

/// Feedback prompt for the replay that follows a familiarization trial.
pub fn feedback_prompt(style: &FeedbackStyle, state: &FeedbackState) -> String {
    let correct = state.last_was_correct.unwrap_or(false);

    match style {
        FeedbackStyle::Outcome => {
            if correct {
                format!("Nice, you predicted correctly. {}", FULL_VIDEO)
            } else {
                format!("Sorry, you got that one wrong. {}", FULL_VIDEO)
            }
        }
        FeedbackStyle::OutcomeWithAnswer {
            affirmative,
            happened,
            did_not_happen,
            confirm_happened,
            confirm_did_not_happen,
        } => {
            let said_yes = state.last_response.as_deref() == Some(affirmative.as_str());
            let verdict = if correct {
                "✅ Nice, you got that right."
            } else {
                "❌ Sorry, you got that one wrong."
            };
            // A right "yes" or a wrong "no" both mean the event happened.
            let (plain, confirmed) = if said_yes == correct {
                (happened, confirm_happened)
            } else {
                (did_not_happen, confirm_did_not_happen)
            };
            let truth = match confirmed {
                Some(sentence) if correct => sentence,
                _ => plain,
            };
            format!("{} {} {}", verdict, truth, FULL_VIDEO)
        }
    }
}

/// Closing page text with the participant's final score.
pub fn farewell_text(state: &FeedbackState) -> String {
    format!(
        "Congrats! You are all done. Thanks for participating in our game. \
         You've gotten {}% correct! Click 'Next' to submit this study.",
        state.percentage_correct()
    )
}
