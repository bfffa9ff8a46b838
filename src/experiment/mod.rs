//! Participant-side experiment core.
//!
//! This module contains everything that runs on the participant's side of a
//! session:
//! - [`profile`]: experiment variants and the familiarization overlay
//! - [`timeline`]: building the ordered trial sequence
//! - [`feedback`]: running accuracy and the prompts derived from it
//! - [`driver`]: presenting the timeline and recording results

pub mod driver;
pub mod feedback;
pub mod profile;
pub mod timeline;
pub mod trial;

pub use driver::{Renderer, ResolvedTrial, RunOutcome, RunSummary, TimelineDriver};
pub use feedback::{
    farewell_text, feedback_prompt, FeedbackState, FeedbackStyle, FeedbackTracker, Scorer,
    ScoringRule,
};
pub use profile::{
    BlockFlags, ChoiceQuestion, ExperimentProfile, FixationSettings, ProfileOverlay, SurveyPage,
    TextQuestion,
};
pub use timeline::{
    build, PresentationParams, PromptSource, RecordPolicy, TrialDescriptor, TrialDuration,
};
pub use trial::{TrialKind, TrialResult};
