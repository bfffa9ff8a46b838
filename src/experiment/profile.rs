//! Experiment profiles and the overlay that derives the familiarization profile.
//!
//! A profile carries everything the timeline builder and the result recorder
//! need to know about one experiment variant. The familiarization block uses
//! the same profile with a few fields overridden; [`ExperimentProfile::overlay`]
//! produces that derived profile explicitly.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::feedback::{FeedbackStyle, ScoringRule, Scorer};
use crate::error::{AppError, AppResult};

/// Which optional blocks the timeline includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BlockFlags {
    pub include_intro: bool,
    pub include_familiarization_trials: bool,
    pub include_survey: bool,
    pub include_goodbye: bool,
}

impl Default for BlockFlags {
    fn default() -> Self {
        Self {
            include_intro: true,
            include_familiarization_trials: true,
            include_survey: true,
            include_goodbye: true,
        }
    }
}

/// Bounds of the randomized fixation-cross duration, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FixationSettings {
    pub min_ms: u64,
    pub max_ms: u64,
    pub html: String,
}

impl Default for FixationSettings {
    fn default() -> Self {
        Self {
            min_ms: 500,
            max_ms: 1500,
            html: r#"<div style="font-size:60px">+</div>"#.to_string(),
        }
    }
}

/// One multiple-choice survey question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceQuestion {
    pub prompt: String,
    pub name: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub horizontal: bool,
    #[serde(default)]
    pub required: bool,
}

/// One free-text survey question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextQuestion {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_rows")]
    pub rows: u32,
    #[serde(default = "default_columns")]
    pub columns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

fn default_rows() -> u32 {
    1
}

fn default_columns() -> u32 {
    40
}

/// A page of the closing survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SurveyPage {
    MultiChoice {
        #[serde(default)]
        preamble: Option<String>,
        questions: Vec<ChoiceQuestion>,
    },
    Text { questions: Vec<TextQuestion> },
}

impl SurveyPage {
    /// Rendering plugin for this page.
    pub fn plugin(&self) -> &'static str {
        match self {
            SurveyPage::MultiChoice { .. } => "survey-multi-choice",
            SurveyPage::Text { .. } => "survey-text",
        }
    }
}

/// Fields the familiarization block may override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileOverlay {
    pub plugin: Option<String>,
    pub condition: Option<String>,
    pub prompt: Option<String>,
    pub choices: Option<Vec<String>>,
    /// Iteration tag recorded on practice-block results.
    pub iteration_name: Option<String>,
    pub stop_secs: Option<f64>,
}

impl ProfileOverlay {
    /// The overlay every variant uses unless told otherwise.
    pub fn familiarization() -> Self {
        Self {
            condition: Some("familiarization_prediction".to_string()),
            ..Default::default()
        }
    }
}

/// Full description of one experiment variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExperimentProfile {
    /// Rendering plugin for stimulus trials.
    pub plugin: String,
    /// Database results are recorded into.
    pub database: String,
    /// Collection results are recorded into.
    pub collection: String,
    pub iteration_name: String,
    pub condition: String,
    pub prompt: String,
    pub choices: Vec<String>,
    /// Flip the choice order for half of the sessions.
    pub counterbalance_choices: bool,
    /// Stop playback after this many seconds.
    pub stop_secs: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub response_allowed_while_playing: bool,
    /// Stimulus label holding the ground truth.
    pub label_field: String,
    pub scoring: ScoringRule,
    pub feedback: FeedbackStyle,
    pub blocks: BlockFlags,
    pub intro_pages: Vec<String>,
    pub end_familiarization_text: String,
    pub fixation: FixationSettings,
    pub survey: Vec<SurveyPage>,
    /// Overrides applied to build the familiarization profile.
    pub familiarization: ProfileOverlay,
}

impl Default for ExperimentProfile {
    fn default() -> Self {
        Self::dominoes()
    }
}

impl ExperimentProfile {
    /// The prediction task with plain correct/incorrect feedback.
    pub fn dominoes() -> Self {
        let condition = "prediction".to_string();
        Self {
            plugin: "video-button-response".to_string(),
            database: "human_physics_benchmarking".to_string(),
            collection: "dominoes_pilot".to_string(),
            iteration_name: "run_1".to_string(),
            prompt: "Is the red block going to hit the yellow area?".to_string(),
            choices: vec!["No".to_string(), "Yes".to_string()],
            counterbalance_choices: false,
            stop_secs: Some(1.5),
            width: 500,
            height: 500,
            response_allowed_while_playing: true,
            label_field: "target_hit_zone_label".to_string(),
            scoring: ScoringRule::Exact,
            feedback: FeedbackStyle::Outcome,
            blocks: BlockFlags::default(),
            intro_pages: vec![
                "<p>On each trial, you will see a brief video of a few objects interacting.</p>\
                 <p>Your task will be to predict whether a certain event will happen after the \
                 video ends. In this case, you'll be asked if the red object will touch the \
                 yellow area.</p>"
                    .to_string(),
            ],
            end_familiarization_text: "You're now ready to start the full experiment.".to_string(),
            fixation: FixationSettings::default(),
            survey: default_survey(&condition),
            condition,
            familiarization: ProfileOverlay::familiarization(),
        }
    }

    /// The yes/no prediction task that also reveals what happened.
    pub fn containment() -> Self {
        Self {
            collection: "containment_pilot".to_string(),
            prompt: "Is the red object going to hit the yellow area?".to_string(),
            choices: vec!["NO".to_string(), "YES".to_string()],
            counterbalance_choices: true,
            response_allowed_while_playing: false,
            scoring: ScoringRule::Affirmative {
                yes: "YES".to_string(),
            },
            feedback: FeedbackStyle::OutcomeWithAnswer {
                affirmative: "YES".to_string(),
                happened: "The red object did hit the yellow area.".to_string(),
                did_not_happen: "The red object did not hit the yellow area.".to_string(),
                confirm_happened: Some(
                    "The red object did indeed hit the yellow area.".to_string(),
                ),
                confirm_did_not_happen: Some(
                    "The red object indeed did not hit the yellow area.".to_string(),
                ),
            },
            survey: containment_survey(),
            ..Self::dominoes()
        }
    }

    /// Load a profile from a JSON file; missing fields take defaults.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Config {
            message: format!("Failed to read profile {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&raw).map_err(|e| AppError::Config {
            message: format!("Invalid profile {}: {}", path.display(), e),
        })
    }

    /// Return a copy with the overlay's fields applied.
    pub fn overlay(&self, overlay: &ProfileOverlay) -> Self {
        let mut derived = self.clone();
        if let Some(plugin) = &overlay.plugin {
            derived.plugin = plugin.clone();
        }
        if let Some(condition) = &overlay.condition {
            derived.condition = condition.clone();
        }
        if let Some(prompt) = &overlay.prompt {
            derived.prompt = prompt.clone();
        }
        if let Some(choices) = &overlay.choices {
            derived.choices = choices.clone();
        }
        if let Some(iteration_name) = &overlay.iteration_name {
            derived.iteration_name = iteration_name.clone();
        }
        if overlay.stop_secs.is_some() {
            derived.stop_secs = overlay.stop_secs;
        }
        derived
    }

    /// The profile used for the familiarization block.
    pub fn familiarization_profile(&self) -> Self {
        self.overlay(&self.familiarization)
    }

    /// Scorer matching this profile's rule and label.
    pub fn scorer(&self) -> Scorer {
        Scorer::new(self.scoring.clone(), self.label_field.clone())
    }
}

/// Closing survey: demographics first, then free-text reflections.
pub fn default_survey(condition: &str) -> Vec<SurveyPage> {
    let text = |prompt: String, rows: u32| TextQuestion {
        prompt,
        name: None,
        rows,
        columns: 40,
        placeholder: None,
    };

    vec![
        SurveyPage::MultiChoice {
            preamble: Some("<strong><u>Survey</u></strong>".to_string()),
            questions: vec![
                ChoiceQuestion {
                    prompt: "What is your sex?".to_string(),
                    name: "participantSex".to_string(),
                    options: vec![
                        "Male".to_string(),
                        "Female".to_string(),
                        "Neither/Other/Do Not Wish To Say".to_string(),
                    ],
                    horizontal: true,
                    required: true,
                },
                ChoiceQuestion {
                    prompt: "Did you encounter any technical difficulties while completing \
                             this study? This could include: images were glitchy (e.g., did \
                             not load), ability to click was glitchy, or sections of the study \
                             did not load properly."
                        .to_string(),
                    name: "technicalDifficultiesBinary".to_string(),
                    options: vec!["Yes".to_string(), "No".to_string()],
                    horizontal: true,
                    required: true,
                },
            ],
        },
        SurveyPage::Text {
            questions: vec![
                TextQuestion {
                    name: Some("participantAge".to_string()),
                    placeholder: Some("Age".to_string()),
                    columns: 3,
                    ..text("Please enter your age:".to_string(), 1)
                },
                text(
                    "What strategies did you use to predict what will happen?".to_string(),
                    5,
                ),
                text(
                    format!("What criteria mattered most when evaluating {}?", condition),
                    5,
                ),
                text(
                    format!("What criteria did not matter when evaluating {}?", condition),
                    5,
                ),
                text("Any final thoughts?".to_string(), 5),
            ],
        },
    ]
}

/// Closing survey of the containment variant: strategy, demographics
/// including education, then age on its own page.
pub fn containment_survey() -> Vec<SurveyPage> {
    let options =
        |labels: &[&str]| -> Vec<String> { labels.iter().map(|l| l.to_string()).collect() };

    vec![
        SurveyPage::Text {
            questions: vec![TextQuestion {
                prompt: "What strategies did you use to predict what will happen?".to_string(),
                name: None,
                rows: 5,
                columns: 40,
                placeholder: None,
            }],
        },
        SurveyPage::MultiChoice {
            preamble: Some("<strong><u>Survey</u></strong>".to_string()),
            questions: vec![
                ChoiceQuestion {
                    prompt: "What is your sex?".to_string(),
                    name: "participantSex".to_string(),
                    options: options(&["Male", "Female", "Neither/Other/Do Not Wish To Say"]),
                    horizontal: true,
                    required: true,
                },
                ChoiceQuestion {
                    prompt: "What is the highest level of education you have completed?"
                        .to_string(),
                    name: "participantEducation".to_string(),
                    options: options(&[
                        "High school",
                        "Some high school",
                        "Bachelor’s degree",
                        "Master’s degree",
                        "Ph.D. or higher",
                        "Associates degree",
                        "Trade school",
                        "Prefer not to say",
                        "Other",
                    ]),
                    horizontal: false,
                    required: true,
                },
                ChoiceQuestion {
                    prompt: "Did you encounter any technical difficulties while completing \
                             this study? This could include: images were glitchy (e.g., did \
                             not load), ability to click was glitchy, or sections of the study \
                             did not load properly."
                        .to_string(),
                    name: "technicalDifficultiesBinary".to_string(),
                    options: options(&["Yes", "No"]),
                    horizontal: true,
                    required: true,
                },
            ],
        },
        SurveyPage::Text {
            questions: vec![TextQuestion {
                prompt: "How old are you?".to_string(),
                name: Some("participantAge".to_string()),
                rows: 1,
                columns: 3,
                placeholder: Some("Age".to_string()),
            }],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::feedback::{feedback_prompt, FeedbackState};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_familiarization_overlay_changes_only_condition() {
        let profile = ExperimentProfile::dominoes();
        let fam = profile.familiarization_profile();

        assert_eq!(fam.condition, "familiarization_prediction");
        assert_eq!(fam.prompt, profile.prompt);
        assert_eq!(fam.choices, profile.choices);
        assert_eq!(profile.condition, "prediction");
    }

    #[test]
    fn test_overlay_applies_every_set_field() {
        let profile = ExperimentProfile::dominoes();
        let overlay = ProfileOverlay {
            plugin: Some("image-button-response".to_string()),
            prompt: Some("Practice: will it hit?".to_string()),
            choices: Some(vec!["Next".to_string()]),
            iteration_name: Some("practice".to_string()),
            stop_secs: Some(3.0),
            condition: None,
        };
        let derived = profile.overlay(&overlay);

        assert_eq!(derived.plugin, "image-button-response");
        assert_eq!(derived.prompt, "Practice: will it hit?");
        assert_eq!(derived.choices, vec!["Next"]);
        assert_eq!(derived.iteration_name, "practice");
        assert_eq!(derived.stop_secs, Some(3.0));
        assert_eq!(derived.condition, "prediction");
    }

    #[test]
    fn test_containment_variant() {
        let profile = ExperimentProfile::containment();
        assert!(profile.counterbalance_choices);
        assert_eq!(profile.collection, "containment_pilot");
        assert!(matches!(profile.scoring, ScoringRule::Affirmative { .. }));
        assert!(!profile.response_allowed_while_playing);
    }

    #[test]
    fn test_containment_feedback_confirms_correct_predictions() {
        let profile = ExperimentProfile::containment();
        let state = FeedbackState {
            last_was_correct: Some(true),
            last_response: Some("NO".to_string()),
            ..Default::default()
        };
        assert!(feedback_prompt(&profile.feedback, &state)
            .contains("The red object indeed did not hit the yellow area."));
    }

    #[test]
    fn test_containment_survey_asks_education_and_age() {
        let survey = ExperimentProfile::containment().survey;
        assert_eq!(survey.len(), 3);
        assert_ne!(survey, ExperimentProfile::dominoes().survey);

        match &survey[1] {
            SurveyPage::MultiChoice { questions, .. } => {
                let names: Vec<_> = questions.iter().map(|q| q.name.as_str()).collect();
                assert_eq!(
                    names,
                    vec!["participantSex", "participantEducation", "technicalDifficultiesBinary"]
                );
                assert_eq!(questions[1].options.len(), 9);
            }
            other => panic!("unexpected page {:?}", other),
        }
        match &survey[2] {
            SurveyPage::Text { questions } => {
                assert_eq!(questions[0].prompt, "How old are you?");
                assert_eq!(questions[0].name.as_deref(), Some("participantAge"));
            }
            other => panic!("unexpected page {:?}", other),
        }
    }

    #[test]
    fn test_default_survey_mentions_condition() {
        let survey = default_survey("prediction");
        assert_eq!(survey.len(), 2);
        assert_eq!(survey[0].plugin(), "survey-multi-choice");
        match &survey[1] {
            SurveyPage::Text { questions } => {
                assert_eq!(questions.len(), 5);
                assert!(questions[2].prompt.contains("evaluating prediction"));
            }
            other => panic!("unexpected page {:?}", other),
        }
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"collection": "towers_pilot", "blocks": {{"includeSurvey": false}}}}"#
        )
        .unwrap();

        let profile = ExperimentProfile::from_file(file.path()).unwrap();
        assert_eq!(profile.collection, "towers_pilot");
        assert_eq!(profile.database, "human_physics_benchmarking");
        assert!(!profile.blocks.include_survey);
        assert!(profile.blocks.include_intro);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let result = ExperimentProfile::from_file(file.path());
        assert!(matches!(result, Err(AppError::Config { .. })));
    }
}
