use crate::llm::Usage;
use crate::pipeline::BatchSummary;
use anyhow::Context;
use bundlelab_adapters::cache::{Artifact, ArtifactStore};
use bundlelab_core::bundle::BundleMapping;
use bundlelab_core::error::EvaluationError;
use bundlelab_core::metrics::{self, MetricsReport};
use bundlelab_core::session::Corpus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Manifest written to `run.json` at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub dataset: String,
    pub model: String,
    #[serde(default)]
    pub raters: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Sessions skipped because an earlier run already finished them.
    #[serde(default)]
    pub resumed: usize,
    #[serde(default)]
    pub summary: BatchSummary,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub metrics: Option<MetricsReport>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl RunReport {
    pub fn start(dataset: &str, model: &str, raters: Vec<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            dataset: dataset.to_string(),
            model: model.to_string(),
            raters,
            started_at: Utc::now(),
            finished_at: None,
            resumed: 0,
            summary: BatchSummary::default(),
            usage: Usage::default(),
            metrics: None,
            notes: Vec::new(),
        }
    }

    pub fn finish(&mut self, summary: BatchSummary, metrics: Option<MetricsReport>) {
        self.summary = summary;
        self.metrics = metrics;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_seconds())
    }
}

/// Final held-out bundles from `bundles.json`, keyed by test session.
pub fn load_predictions(store: &ArtifactStore) -> anyhow::Result<BTreeMap<String, BundleMapping>> {
    store
        .load_typed(Artifact::Bundles)
        .with_context(|| format!("Failed to read {}", Artifact::Bundles.file_name()))
}

/// Score the persisted bundles and write `metrics.json`.
///
/// `NoValidBundles` comes back as an [`anyhow::Error`] wrapping
/// [`EvaluationError`]; see [`is_no_valid_bundles`].
pub fn evaluate(corpus: &Corpus, store: &ArtifactStore) -> anyhow::Result<MetricsReport> {
    let predictions = load_predictions(store)?;
    tracing::info!(sessions = predictions.len(), "evaluating persisted bundles");

    let report = metrics::compute(corpus, &predictions)?;
    if !report.skipped_sessions.is_empty() {
        tracing::warn!(
            skipped = report.skipped_sessions.len(),
            "predictions for unknown sessions were ignored"
        );
    }
    store
        .write_document(Artifact::Metrics, &report)
        .context("Failed to write metrics")?;

    tracing::info!(
        precision = report.precision,
        recall = report.recall,
        coverage = report.coverage,
        valid_sessions = report.valid_sessions,
        total_hits = report.total_hits,
        "evaluation finished"
    );
    Ok(report)
}

pub fn is_no_valid_bundles(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<EvaluationError>(),
        Some(EvaluationError::NoValidBundles)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlelab_core::session::{GroundTruthBundle, ItemCatalog, Session};
    use serde_json::json;
    use std::collections::HashMap;

    fn corpus() -> Corpus {
        Corpus::new(
            [Session::new(
                "t1",
                ["A", "B", "C"].map(String::from).to_vec(),
                Vec::new(),
            )],
            HashMap::from([(
                "t1".to_string(),
                vec![GroundTruthBundle::new("g1", ["A", "B"].map(String::from).to_vec())],
            )]),
            ItemCatalog::default(),
        )
    }

    #[test]
    fn evaluate_scores_bundles_and_writes_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store
            .record_many(
                "t1",
                &[(Artifact::Bundles, json!({"bundle1": ["product1", "product2"]}))],
            )
            .unwrap();

        let report = evaluate(&corpus(), &store).unwrap();
        assert_eq!(report.precision, 1.0);
        assert_eq!(report.recall, 1.0);
        assert_eq!(report.coverage, 1.0);
        assert!(store.path(Artifact::Metrics).exists());
    }

    #[test]
    fn single_item_predictions_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store
            .record_many("t1", &[(Artifact::Bundles, json!({"bundle1": ["product1"]}))])
            .unwrap();

        let err = evaluate(&corpus(), &store).unwrap_err();
        assert!(is_no_valid_bundles(&err));
        assert!(!store.path(Artifact::Metrics).exists());
    }

    #[test]
    fn empty_store_has_nothing_to_score() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(is_no_valid_bundles(&evaluate(&corpus(), &store).unwrap_err()));
    }

    #[test]
    fn other_errors_are_not_mistaken_for_empty_evaluations() {
        assert!(!is_no_valid_bundles(&anyhow::anyhow!("disk full")));
    }

    #[test]
    fn run_report_round_trips_with_defaults() {
        let mut report = RunReport::start("electronic", "gpt-3.5-turbo", vec!["rater".into()]);
        report.finish(
            BatchSummary {
                sessions: 2,
                completed: 1,
                hallucinated: 1,
                excluded: 0,
            },
            None,
        );
        assert!(report.duration_secs().is_some());

        let decoded: RunReport = serde_json::from_value(json!({
            "run_id": report.run_id,
            "dataset": "electronic",
            "model": "gpt-3.5-turbo",
            "started_at": report.started_at,
        }))
        .unwrap();
        assert_eq!(decoded.summary, BatchSummary::default());
        assert!(decoded.metrics.is_none());
        assert_eq!(uuid::Uuid::parse_str(&decoded.run_id).unwrap().get_version_num(), 4);
    }
}
