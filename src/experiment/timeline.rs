//! Per-participant trial timeline construction.
//!
//! Order: intro, familiarization pre/post pairs and their closing page,
//! fixation + stimulus for every main item, survey pages, farewell.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::feedback::{farewell_text, feedback_prompt, FeedbackState, FeedbackStyle};
use super::profile::{ExperimentProfile, SurveyPage};
use super::trial::TrialKind;
use crate::storage::StimulusItem;

/// Where a descriptor's prompt text comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum PromptSource {
    None,
    Static(String),
    /// Computed from the feedback state when the trial renders.
    Feedback(FeedbackStyle),
    /// Final score page, computed when the trial renders.
    Farewell,
}

impl PromptSource {
    /// Produce the prompt text for the current state.
    pub fn resolve(&self, state: &FeedbackState) -> Option<String> {
        match self {
            PromptSource::None => None,
            PromptSource::Static(text) => Some(text.clone()),
            PromptSource::Feedback(style) => Some(feedback_prompt(style, state)),
            PromptSource::Farewell => Some(farewell_text(state)),
        }
    }
}

/// How long a trial may last before it ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrialDuration {
    /// Until the participant responds.
    Unbounded,
    Fixed { ms: u64 },
    /// Uniform in `[min_ms, max_ms]`, drawn when the trial renders.
    Jittered { min_ms: u64, max_ms: u64 },
}

impl TrialDuration {
    /// Pick a concrete duration.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<u64> {
        match *self {
            TrialDuration::Unbounded => None,
            TrialDuration::Fixed { ms } => Some(ms),
            TrialDuration::Jittered { min_ms, max_ms } if min_ms >= max_ms => Some(min_ms),
            TrialDuration::Jittered { min_ms, max_ms } => Some(rng.random_range(min_ms..=max_ms)),
        }
    }
}

/// What the driver does once a trial completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPolicy {
    Nothing,
    /// Update the feedback state, then forward the annotated result.
    ScoreAndForward,
    Forward,
    /// Zero the running counters.
    ResetCounts,
}

/// Presentation parameters handed to the rendering plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationParams {
    pub plugin: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default)]
    pub response_allowed_while_playing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Static HTML shown instead of media (fixation cross).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Instruction pages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<String>,
    #[serde(default)]
    pub allow_backward: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survey: Option<SurveyPage>,
}

/// One presentable unit of the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialDescriptor {
    pub kind: TrialKind,
    /// Position within its block, for stimulus trials.
    pub trial_num: Option<usize>,
    pub stimulus: Option<StimulusItem>,
    pub params: PresentationParams,
    pub prompt: PromptSource,
    pub duration: TrialDuration,
    pub on_finish: RecordPolicy,
}

impl TrialDescriptor {
    fn new(kind: TrialKind, params: PresentationParams) -> Self {
        Self {
            kind,
            trial_num: None,
            stimulus: None,
            params,
            prompt: PromptSource::None,
            duration: TrialDuration::Unbounded,
            on_finish: RecordPolicy::Nothing,
        }
    }

    fn instructions(pages: Vec<String>, allow_backward: bool) -> Self {
        Self::new(
            TrialKind::Instructions,
            PresentationParams {
                plugin: "instructions".to_string(),
                pages,
                allow_backward,
                ..Default::default()
            },
        )
    }
}

fn stimulus_params(profile: &ExperimentProfile, choices: &[String]) -> PresentationParams {
    PresentationParams {
        plugin: profile.plugin.clone(),
        choices: choices.to_vec(),
        stop_secs: profile.stop_secs,
        width: Some(profile.width),
        height: Some(profile.height),
        response_allowed_while_playing: profile.response_allowed_while_playing,
        condition: Some(profile.condition.clone()),
        ..Default::default()
    }
}

/// Build the full timeline for one session.
///
/// The only randomness consumed here is the once-per-session choice order;
/// fixation durations are drawn later, when each fixation renders.
pub fn build<R: Rng>(
    profile: &ExperimentProfile,
    stimuli: &[StimulusItem],
    familiarization: &[StimulusItem],
    rng: &mut R,
) -> Vec<TrialDescriptor> {
    let blocks = profile.blocks;
    let fam_profile = profile.familiarization_profile();

    let flipped = profile.counterbalance_choices && rng.random_bool(0.5);
    let orient = |choices: &[String]| {
        let mut choices = choices.to_vec();
        if flipped {
            choices.reverse();
        }
        choices
    };
    let main_choices = orient(&profile.choices);
    let fam_choices = orient(&fam_profile.choices);

    let mut timeline = Vec::with_capacity(stimuli.len() * 2 + familiarization.len() * 2 + 6);

    if blocks.include_intro {
        timeline.push(TrialDescriptor::instructions(profile.intro_pages.clone(), true));
    }

    if blocks.include_familiarization_trials {
        for (i, item) in familiarization.iter().enumerate() {
            let mut pre = TrialDescriptor::new(
                TrialKind::FamiliarizationPre,
                stimulus_params(&fam_profile, &fam_choices),
            );
            pre.trial_num = Some(i);
            pre.stimulus = Some(item.clone());
            pre.prompt = PromptSource::Static(fam_profile.prompt.clone());
            pre.on_finish = RecordPolicy::ScoreAndForward;

            let mut post = TrialDescriptor::new(
                TrialKind::FamiliarizationFeedback,
                PresentationParams {
                    choices: vec!["Next".to_string()],
                    stop_secs: None,
                    response_allowed_while_playing: false,
                    ..stimulus_params(&fam_profile, &fam_choices)
                },
            );
            post.trial_num = Some(i);
            post.stimulus = Some(item.clone());
            post.prompt = PromptSource::Feedback(profile.feedback.clone());

            timeline.push(pre);
            timeline.push(post);
        }

        let mut end = TrialDescriptor::instructions(
            vec![profile.end_familiarization_text.clone()],
            false,
        );
        end.on_finish = RecordPolicy::ResetCounts;
        timeline.push(end);
    }

    let fixation = fixation_descriptor(profile);
    for (i, item) in stimuli.iter().enumerate() {
        let mut trial = TrialDescriptor::new(
            TrialKind::StimulusResponse,
            stimulus_params(profile, &main_choices),
        );
        trial.trial_num = Some(i);
        trial.stimulus = Some(item.clone());
        trial.prompt = PromptSource::Static(profile.prompt.clone());
        trial.on_finish = RecordPolicy::ScoreAndForward;

        timeline.push(fixation.clone());
        timeline.push(trial);
    }

    if blocks.include_survey {
        for page in &profile.survey {
            let mut survey = TrialDescriptor::new(
                TrialKind::Survey,
                PresentationParams {
                    plugin: page.plugin().to_string(),
                    condition: Some(profile.condition.clone()),
                    survey: Some(page.clone()),
                    ..Default::default()
                },
            );
            survey.on_finish = RecordPolicy::Forward;
            timeline.push(survey);
        }
    }

    if blocks.include_goodbye {
        let mut goodbye = TrialDescriptor::instructions(Vec::new(), false);
        goodbye.prompt = PromptSource::Farewell;
        timeline.push(goodbye);
    }

    timeline
}

fn fixation_descriptor(profile: &ExperimentProfile) -> TrialDescriptor {
    let settings = &profile.fixation;
    let mut fixation = TrialDescriptor::new(
        TrialKind::Fixation,
        PresentationParams {
            plugin: "html-keyboard-response".to_string(),
            html: Some(settings.html.clone()),
            ..Default::default()
        },
    );
    fixation.duration = if settings.min_ms >= settings.max_ms {
        TrialDuration::Fixed {
            ms: settings.min_ms,
        }
    } else {
        TrialDuration::Jittered {
            min_ms: settings.min_ms,
            max_ms: settings.max_ms,
        }
    };
    fixation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::profile::BlockFlags;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn items(prefix: &str, n: usize) -> Vec<StimulusItem> {
        (0..n)
            .map(|i| StimulusItem::new("p", json!({})).with_id(format!("{}{}", prefix, i)))
            .collect()
    }

    fn main_only() -> ExperimentProfile {
        ExperimentProfile {
            blocks: BlockFlags {
                include_intro: false,
                include_familiarization_trials: false,
                include_survey: false,
                include_goodbye: false,
            },
            ..ExperimentProfile::dominoes()
        }
    }

    #[test]
    fn test_duration_sampling() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(TrialDuration::Unbounded.sample(&mut rng), None);
        assert_eq!(TrialDuration::Fixed { ms: 1000 }.sample(&mut rng), Some(1000));
        assert_eq!(
            TrialDuration::Jittered { min_ms: 800, max_ms: 800 }.sample(&mut rng),
            Some(800)
        );
        for _ in 0..200 {
            let ms = TrialDuration::Jittered { min_ms: 500, max_ms: 1500 }
                .sample(&mut rng)
                .unwrap();
            assert!((500..=1500).contains(&ms));
        }
    }

    #[test]
    fn test_prompt_resolution_is_deferred() {
        let source = PromptSource::Feedback(FeedbackStyle::Outcome);
        let mut state = FeedbackState::default();
        let before = source.resolve(&state).unwrap();
        state.last_was_correct = Some(true);
        let after = source.resolve(&state).unwrap();
        assert_ne!(before, after);
        assert_eq!(PromptSource::None.resolve(&state), None);
    }

    #[test]
    fn test_main_block_only() {
        let mut rng = StdRng::seed_from_u64(1);
        let timeline = build(&main_only(), &items("m", 2), &[], &mut rng);
        let kinds: Vec<_> = timeline.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TrialKind::Fixation,
                TrialKind::StimulusResponse,
                TrialKind::Fixation,
                TrialKind::StimulusResponse,
            ]
        );
        assert_eq!(timeline[1].trial_num, Some(0));
        assert_eq!(timeline[3].on_finish, RecordPolicy::ScoreAndForward);
    }

    #[test]
    fn test_choices_fixed_once_per_session() {
        let profile = ExperimentProfile::containment();
        let mut saw_flipped = false;
        let mut saw_original = false;

        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let timeline = build(&profile, &items("m", 3), &items("f", 2), &mut rng);
            let orders: Vec<_> = timeline
                .iter()
                .filter(|d| d.kind.is_scored())
                .map(|d| d.params.choices.clone())
                .collect();
            assert!(orders.windows(2).all(|w| w[0] == w[1]));
            if orders[0] == vec!["YES", "NO"] {
                saw_flipped = true;
            } else {
                saw_original = true;
            }
        }

        assert!(saw_flipped && saw_original);
    }

    #[test]
    fn test_no_counterbalance_keeps_order() {
        let mut rng = StdRng::seed_from_u64(3);
        let timeline = build(&main_only(), &items("m", 1), &[], &mut rng);
        assert_eq!(timeline[1].params.choices, vec!["No", "Yes"]);
    }
}
