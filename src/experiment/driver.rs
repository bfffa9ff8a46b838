//! Runs a built timeline one trial at a time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use super::feedback::{FeedbackState, FeedbackTracker, Scorer};
use super::timeline::{RecordPolicy, TrialDescriptor};
use super::trial::TrialResult;
use crate::error::RenderError;
use crate::recorder::{ResultForwarder, ResultRecorder};

/// A descriptor with its render-time values filled in.
#[derive(Debug, Clone)]
pub struct ResolvedTrial {
    /// Position in the timeline.
    pub index: usize,
    pub descriptor: TrialDescriptor,
    /// Prompt text for this rendering, if any.
    pub prompt: Option<String>,
    /// How long the trial may run before ending on its own.
    pub duration_ms: Option<u64>,
}

impl ResolvedTrial {
    /// Result skeleton with the trial's identity and stimulus echoed.
    pub fn blank_result(&self) -> TrialResult {
        let mut result = TrialResult::new(self.descriptor.kind, self.index);
        result.trial_num = self.descriptor.trial_num;
        result.condition = self.descriptor.params.condition.clone();
        match &self.descriptor.stimulus {
            Some(item) => result.echo_stimulus(item),
            None => result,
        }
    }
}

/// Presents trials to the participant.
#[async_trait]
pub trait Renderer: Send {
    /// Show one trial and wait for its completion.
    ///
    /// Implementations usually start from [`ResolvedTrial::blank_result`].
    async fn present(&mut self, trial: &ResolvedTrial) -> Result<TrialResult, RenderError>;
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// The participant went away; the in-flight trial was discarded.
    Disconnected(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            RunOutcome::Completed(summary) | RunOutcome::Disconnected(summary) => summary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub trials_completed: usize,
    pub final_state: FeedbackState,
}

/// Drives a timeline through a [`Renderer`], keeping the feedback state and
/// forwarding results as each trial's record policy asks.
pub struct TimelineDriver<R, G> {
    renderer: R,
    rng: G,
    tracker: FeedbackTracker,
    recorder: ResultRecorder,
    forwarder: ResultForwarder,
}

impl<R, G> TimelineDriver<R, G>
where
    R: Renderer,
    G: Rng + Send,
{
    pub fn new(
        renderer: R,
        rng: G,
        scorer: Scorer,
        recorder: ResultRecorder,
        forwarder: ResultForwarder,
    ) -> Self {
        Self {
            renderer,
            rng,
            tracker: FeedbackTracker::new(scorer),
            recorder,
            forwarder,
        }
    }

    /// Current feedback state.
    pub fn state(&self) -> &FeedbackState {
        self.tracker.state()
    }

    /// Give back the renderer once the run is over.
    pub fn into_renderer(self) -> R {
        self.renderer
    }

    fn resolve(&mut self, index: usize, descriptor: &TrialDescriptor) -> ResolvedTrial {
        ResolvedTrial {
            index,
            descriptor: descriptor.clone(),
            prompt: descriptor.prompt.resolve(self.tracker.state()),
            duration_ms: descriptor.duration.sample(&mut self.rng),
        }
    }

    /// Run every descriptor in order.
    ///
    /// A plugin failure aborts the run with an error; a lost connection ends
    /// it with [`RunOutcome::Disconnected`].
    pub async fn run(&mut self, timeline: &[TrialDescriptor]) -> Result<RunOutcome, RenderError> {
        let session_id = self.recorder.session_id().to_string();
        info!(session_id = %session_id, trials = timeline.len(), "Starting timeline");

        for (index, descriptor) in timeline.iter().enumerate() {
            let resolved = self.resolve(index, descriptor);

            let outcome = match resolved.duration_ms {
                Some(ms) => {
                    match tokio::time::timeout(
                        Duration::from_millis(ms),
                        self.renderer.present(&resolved),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            let mut result = resolved.blank_result();
                            result.timed_out = true;
                            result.ended_at = Utc::now();
                            Ok(result)
                        }
                    }
                }
                None => self.renderer.present(&resolved).await,
            };

            let result = match outcome {
                Ok(result) => result,
                Err(RenderError::Disconnected) => {
                    warn!(
                        session_id = %session_id,
                        trial_index = index,
                        kind = %descriptor.kind,
                        "Participant disconnected, discarding in-flight trial"
                    );
                    return Ok(RunOutcome::Disconnected(self.summary(index)));
                }
                Err(e) => return Err(e),
            };

            debug!(
                session_id = %session_id,
                trial_index = index,
                kind = %descriptor.kind,
                timed_out = result.timed_out,
                "Trial finished"
            );
            self.apply_policy(descriptor.on_finish, &result);
        }

        let summary = self.summary(timeline.len());
        info!(
            session_id = %session_id,
            percent_correct = summary.final_state.percentage_correct(),
            "Timeline completed"
        );
        Ok(RunOutcome::Completed(summary))
    }

    fn apply_policy(&mut self, policy: RecordPolicy, result: &TrialResult) {
        match policy {
            RecordPolicy::Nothing => {}
            RecordPolicy::ResetCounts => self.tracker.reset_counts(),
            RecordPolicy::ScoreAndForward => {
                self.tracker.record(result);
                self.forward(result);
            }
            RecordPolicy::Forward => self.forward(result),
        }
    }

    fn forward(&self, result: &TrialResult) {
        if let Err(e) = self.forwarder.forward(self.recorder.annotate(result)) {
            warn!(trial_index = result.trial_index, error = %e, "Result not queued");
        }
    }

    fn summary(&self, trials_completed: usize) -> RunSummary {
        RunSummary {
            trials_completed,
            final_state: self.tracker.state().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use crate::error::RecorderResult;
    use crate::experiment::trial::TrialKind;
    use crate::experiment::{timeline, ExperimentProfile};
    use crate::recorder::{AnnotatedRecord, ResultSink};
    use crate::storage::StimulusItem;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Answers "Yes" to every choice trial; fixations never respond.
    struct YesRenderer {
        seen: Vec<(TrialKind, Option<String>)>,
        disconnect_at: Option<usize>,
    }

    #[async_trait]
    impl Renderer for YesRenderer {
        async fn present(&mut self, trial: &ResolvedTrial) -> Result<TrialResult, RenderError> {
            if self.disconnect_at == Some(trial.index) {
                return Err(RenderError::Disconnected);
            }
            self.seen.push((trial.descriptor.kind, trial.prompt.clone()));
            if trial.descriptor.kind == TrialKind::Fixation {
                std::future::pending::<()>().await;
            }
            Ok(trial.blank_result().with_response("Yes", 500))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<AnnotatedRecord>>,
    }

    #[async_trait]
    impl ResultSink for CollectingSink {
        async fn send(&self, record: &AnnotatedRecord) -> RecorderResult<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn profile() -> ExperimentProfile {
        let mut profile = ExperimentProfile::dominoes();
        profile.fixation.min_ms = 1;
        profile.fixation.max_ms = 5;
        profile
    }

    fn stim(id: &str, label: &str) -> StimulusItem {
        StimulusItem::new("p", json!({}))
            .with_id(id)
            .with_labels(json!({ "target_hit_zone_label": label }))
    }

    fn driver(
        disconnect_at: Option<usize>,
        sink: Arc<CollectingSink>,
    ) -> (TimelineDriver<YesRenderer, StdRng>, tokio::task::JoinHandle<crate::recorder::ForwarderSnapshot>) {
        let config = RecorderConfig {
            queue_capacity: 64,
            max_retries: 0,
            retry_delay_ms: 1,
        };
        let (forwarder, worker) = ResultForwarder::spawn(sink, &config);
        let profile = profile();
        let renderer = YesRenderer {
            seen: Vec::new(),
            disconnect_at,
        };
        let driver = TimelineDriver::new(
            renderer,
            StdRng::seed_from_u64(9),
            profile.scorer(),
            ResultRecorder::new("s1", &profile),
            forwarder,
        );
        (driver, worker)
    }

    #[tokio::test]
    async fn test_full_run_scores_and_forwards() {
        let sink = Arc::new(CollectingSink::default());
        let (mut driver, worker) = driver(None, sink.clone());

        let mut rng = StdRng::seed_from_u64(1);
        let timeline = timeline::build(
            &profile(),
            &[stim("m0", "Yes"), stim("m1", "No"), stim("m2", "Yes")],
            &[stim("f0", "No")],
            &mut rng,
        );

        let outcome = driver.run(&timeline).await.unwrap();
        let summary = outcome.summary().clone();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(summary.trials_completed, timeline.len());
        // Familiarization answer was wrong, but counts restart before the main block.
        assert_eq!(summary.final_state.correct_count, 2);
        assert_eq!(summary.final_state.total_count, 3);

        let renderer = driver.into_renderer();
        let feedback = renderer
            .seen
            .iter()
            .find(|(kind, _)| *kind == TrialKind::FamiliarizationFeedback)
            .and_then(|(_, prompt)| prompt.clone())
            .unwrap();
        assert!(feedback.starts_with("Sorry"));

        let farewell = renderer.seen.last().unwrap().1.clone().unwrap();
        assert!(farewell.contains("67% correct"));

        worker.await.unwrap();
        let records = sink.records.lock().unwrap();
        // 1 familiarization + 3 main + 2 survey pages
        assert_eq!(records.len(), 6);
        assert!(!records[0].correct);
        assert_eq!(records[0].result.condition.as_deref(), Some("familiarization_prediction"));
        assert!(records[1].correct);
        assert!(!records[2].correct);
    }

    #[tokio::test]
    async fn test_fixation_ends_by_timeout() {
        let sink = Arc::new(CollectingSink::default());
        let (mut driver, _worker) = driver(None, sink);

        let mut profile = profile();
        profile.blocks.include_intro = false;
        profile.blocks.include_familiarization_trials = false;
        profile.blocks.include_survey = false;
        profile.blocks.include_goodbye = false;
        let mut rng = StdRng::seed_from_u64(1);
        let timeline = timeline::build(&profile, &[stim("m0", "Yes")], &[], &mut rng);

        let outcome = driver.run(&timeline).await.unwrap();
        assert_eq!(outcome.summary().trials_completed, 2);
        assert_eq!(outcome.summary().final_state.total_count, 1);
    }

    #[tokio::test]
    async fn test_disconnect_discards_in_flight_trial() {
        let sink = Arc::new(CollectingSink::default());
        let mut profile = profile();
        profile.blocks.include_intro = false;
        profile.blocks.include_familiarization_trials = false;
        let mut rng = StdRng::seed_from_u64(1);
        let timeline = timeline::build(
            &profile,
            &[stim("m0", "Yes"), stim("m1", "Yes")],
            &[],
            &mut rng,
        );

        // Index 3 is the second stimulus trial.
        let (mut driver, worker) = driver(Some(3), sink.clone());
        let outcome = driver.run(&timeline).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Disconnected(_)));
        assert_eq!(outcome.summary().trials_completed, 3);
        assert_eq!(outcome.summary().final_state.total_count, 1);

        drop(driver);
        worker.await.unwrap();
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }
}
