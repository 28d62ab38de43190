//! Per-session refinement dialogue and the batch runner around it.
//!
//! Every session walks the same stages in order:
//!
//! `Init → SelfCorrect → Parse → FeedbackLoop → IntentGeneration →
//! IntentRating → TestGeneration → Done`
//!
//! Sessions share only read-only reference data, so the batch runner drives
//! them concurrently while each session stays strictly sequential.

mod rating;
mod record;
mod refine;

#[cfg(test)]
mod tests;

pub use rating::{rate_intents, RATING_ATTEMPTS};
pub use record::{
    Exclusion, FeedbackTranscript, FeedbackVerdict, SessionOutcome, SessionRecord,
    TestTranscript,
};

use crate::llm::ParseOptions;
use bundlelab_core::protocol::ModelClient;
use bundlelab_core::session::{ItemCatalog, SessionPairing};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    SelfCorrect,
    Parse,
    FeedbackLoop,
    IntentGeneration,
    IntentRating,
    TestGeneration,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::SelfCorrect => "self_correct",
            Stage::Parse => "parse",
            Stage::FeedbackLoop => "feedback_loop",
            Stage::IntentGeneration => "intent_generation",
            Stage::IntentRating => "intent_rating",
            Stage::TestGeneration => "test_generation",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Upper bound on corrective feedback prompts per session.
    pub feedback_iterations: usize,
    pub parse: ParseOptions,
    /// Sessions in flight at once.
    pub concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            feedback_iterations: 3,
            parse: ParseOptions::default(),
            concurrency: 4,
        }
    }
}

/// Outcome counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub sessions: usize,
    pub completed: usize,
    pub hallucinated: usize,
    pub excluded: usize,
}

impl BatchSummary {
    fn observe(&mut self, record: &SessionRecord) {
        self.sessions += 1;
        match record.outcome {
            SessionOutcome::Completed { .. } => self.completed += 1,
            SessionOutcome::Hallucinated => self.hallucinated += 1,
            SessionOutcome::Excluded(_) => self.excluded += 1,
        }
    }
}

/// The refinement dialogue, bound to its models.
///
/// Raters are fully resolved before they reach the pipeline; rating performs
/// no fallback of its own.
pub struct Pipeline {
    primary: Arc<dyn ModelClient>,
    raters: Vec<Arc<dyn ModelClient>>,
    catalog: Arc<ItemCatalog>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        primary: Arc<dyn ModelClient>,
        raters: Vec<Arc<dyn ModelClient>>,
        catalog: Arc<ItemCatalog>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            primary,
            raters,
            catalog,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run every pairing, at most `concurrency` at a time, handing each
    /// record to `on_complete` as soon as its session finishes.
    ///
    /// `on_complete` runs on the async workers; blocking file I/O belongs in
    /// `spawn_blocking`. An error from it stops the batch, and sessions still
    /// in flight are dropped.
    pub async fn run_batch<F, Fut>(
        &self,
        pairings: &[SessionPairing],
        mut on_complete: F,
    ) -> anyhow::Result<BatchSummary>
    where
        F: FnMut(SessionRecord) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let concurrency = self.settings.concurrency.max(1);
        tracing::info!(
            sessions = pairings.len(),
            concurrency,
            model = self.primary.model_id(),
            raters = self.raters.len(),
            "starting batch"
        );

        let mut summary = BatchSummary::default();
        let mut running = stream::iter(pairings.iter().map(|pairing| self.run_session(pairing)))
            .buffer_unordered(concurrency);
        while let Some(record) = running.next().await {
            summary.observe(&record);
            on_complete(record).await?;
            if summary.sessions % 10 == 0 {
                tracing::info!(
                    done = summary.sessions,
                    total = pairings.len(),
                    "batch progress"
                );
            }
        }

        tracing::info!(
            completed = summary.completed,
            hallucinated = summary.hallucinated,
            excluded = summary.excluded,
            "batch finished"
        );
        Ok(summary)
    }
}
