use super::Stage;
use crate::llm::ParseOutcome;
use bundlelab_adapters::cache::Artifact;
use bundlelab_core::bundle::BundleMapping;
use bundlelab_core::classify::ErrorReport;
use bundlelab_core::conversation::Conversation;
use bundlelab_core::matcher::RelatedBundle;
use bundlelab_core::rating::RatingSheet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Why a session left the pipeline early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackVerdict {
    /// The candidate classified as `{0}`.
    Accepted,
    /// Code 5 stopped the loop.
    Hallucinated,
    /// The iteration bound ran out first.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackTranscript {
    pub conversation: Conversation,
    /// One report per classification, in order.
    pub reports: Vec<ErrorReport>,
    pub verdict: FeedbackVerdict,
    /// Corrective prompts sent.
    pub corrections: usize,
}

impl FeedbackTranscript {
    /// True when at least one corrective prompt was sent.
    pub fn engaged(&self) -> bool {
        self.corrections > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestTranscript {
    pub conversation: Conversation,
    pub rules: String,
    pub bundles: ParseOutcome,
    pub intents: ParseOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Held-out bundles ready for evaluation.
    Completed { bundles: BundleMapping },
    /// The feedback loop hit a hallucination.
    Hallucinated,
    Excluded(Exclusion),
}

/// Everything one session produced, stage by stage.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub test_id: String,
    pub reference_id: String,
    pub self_correction: Conversation,
    /// Self-correction prompts actually sent (2 or 3).
    pub self_correction_calls: usize,
    pub parsed: Option<ParseOutcome>,
    pub feedback: Option<FeedbackTranscript>,
    pub intents: Option<Conversation>,
    pub related: Vec<RelatedBundle>,
    pub rating_prompt: Option<String>,
    pub rating: Option<RatingSheet>,
    pub test: Option<TestTranscript>,
    pub outcome: SessionOutcome,
}

impl SessionRecord {
    pub(crate) fn new(test_id: &str, reference_id: &str) -> Self {
        Self {
            test_id: test_id.to_string(),
            reference_id: reference_id.to_string(),
            self_correction: Conversation::new(),
            self_correction_calls: 0,
            parsed: None,
            feedback: None,
            intents: None,
            related: Vec::new(),
            rating_prompt: None,
            rating: None,
            test: None,
            outcome: SessionOutcome::Excluded(Exclusion {
                stage: Stage::Init,
                reason: "not started".to_string(),
            }),
        }
    }

    pub fn bundles(&self) -> Option<&BundleMapping> {
        match &self.outcome {
            SessionOutcome::Completed { bundles } => Some(bundles),
            _ => None,
        }
    }

    /// Stage file entries for this session, ready for the artifact store.
    pub fn stage_entries(&self) -> anyhow::Result<Vec<(Artifact, Value)>> {
        let mut entries = vec![(
            Artifact::SelfCorrection,
            json!({
                "reference_session": self.reference_id,
                "calls": self.self_correction_calls,
                "messages": self.self_correction,
            }),
        )];
        if let Some(parsed) = &self.parsed {
            entries.push((Artifact::Parsed, serde_json::to_value(parsed)?));
        }
        if let Some(feedback) = &self.feedback {
            entries.push((Artifact::Feedback, serde_json::to_value(feedback)?));
        }
        if let Some(intents) = &self.intents {
            entries.push((Artifact::Intents, serde_json::to_value(intents)?));
        }
        if !self.related.is_empty() {
            entries.push((
                Artifact::RatingInputs,
                json!({
                    "related": self.related,
                    "tuples": self.related.iter().map(RelatedBundle::as_tuple).collect::<Vec<_>>(),
                    "prompt": self.rating_prompt,
                }),
            ));
        }
        if let Some(rating) = &self.rating {
            entries.push((Artifact::RatingScores, serde_json::to_value(rating)?));
        }
        if let Some(test) = &self.test {
            entries.push((Artifact::TestTranscripts, serde_json::to_value(test)?));
        }
        match &self.outcome {
            SessionOutcome::Completed { bundles } => {
                entries.push((Artifact::Bundles, serde_json::to_value(bundles)?));
            }
            SessionOutcome::Hallucinated => {
                let report = self
                    .feedback
                    .as_ref()
                    .and_then(|feedback| feedback.reports.last());
                entries.push((
                    Artifact::Hallucinated,
                    json!({
                        "reference_session": self.reference_id,
                        "report": report,
                    }),
                ));
            }
            SessionOutcome::Excluded(exclusion) => {
                entries.push((Artifact::Excluded, serde_json::to_value(exclusion)?));
            }
        }
        Ok(entries)
    }
}
