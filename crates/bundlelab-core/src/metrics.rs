//! Precision, recall and coverage of final bundles against ground truth.

use crate::bundle::BundleMapping;
use crate::error::EvaluationError;
use crate::matcher::{first_superset, resolve_items, MIN_BUNDLE_ITEMS};
use crate::session::Corpus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scores for one evaluated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionScore {
    pub session_id: String,
    pub predicted: usize,
    pub ground_truth: usize,
    pub hits: usize,
    pub precision: f64,
    pub recall: f64,
    /// Sum over hits of `|matched ∩ predicted| / |matched|`.
    pub coverage_sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub precision: f64,
    pub recall: f64,
    pub coverage: f64,
    /// Sessions left after removing single-item bundles.
    pub valid_sessions: usize,
    /// Sessions that contributed to precision and recall.
    pub scored_sessions: usize,
    pub total_hits: usize,
    #[serde(default)]
    pub sessions: Vec<SessionScore>,
    /// Predictions for sessions the corpus does not know.
    #[serde(default)]
    pub skipped_sessions: Vec<String>,
}

/// Drop single-item bundles, then drop sessions left with no bundles.
pub fn filter_single_item_bundles(
    predictions: &BTreeMap<String, BundleMapping>,
) -> BTreeMap<String, BundleMapping> {
    predictions
        .iter()
        .filter_map(|(id, mapping)| {
            let kept = mapping.without_single_items();
            (!kept.is_empty()).then(|| (id.clone(), kept))
        })
        .collect()
}

/// Score final predictions, keyed by test session identifier.
///
/// A predicted bundle is a hit when its resolved items fall inside some
/// ground-truth bundle; the first such bundle in dataset order is the match.
/// Several predictions may hit the same ground-truth bundle and each counts.
pub fn compute(
    corpus: &Corpus,
    predictions: &BTreeMap<String, BundleMapping>,
) -> Result<MetricsReport, EvaluationError> {
    let valid = filter_single_item_bundles(predictions);
    if valid.is_empty() {
        return Err(EvaluationError::NoValidBundles);
    }

    let scored: Vec<(String, Option<SessionScore>)> = valid
        .par_iter()
        .map(|(id, mapping)| (id.clone(), score_session(corpus, id, mapping)))
        .collect();

    let mut sessions = Vec::with_capacity(scored.len());
    let mut skipped_sessions = Vec::new();
    for (id, score) in scored {
        match score {
            Some(score) => sessions.push(score),
            None => skipped_sessions.push(id),
        }
    }

    let scored_sessions = sessions.len();
    let total_hits: usize = sessions.iter().map(|s| s.hits).sum();
    let coverage_sum: f64 = sessions.iter().map(|s| s.coverage_sum).sum();
    let mean = |values: f64| {
        if scored_sessions == 0 {
            0.0
        } else {
            values / scored_sessions as f64
        }
    };

    Ok(MetricsReport {
        precision: mean(sessions.iter().map(|s| s.precision).sum()),
        recall: mean(sessions.iter().map(|s| s.recall).sum()),
        coverage: if total_hits > 0 {
            coverage_sum / total_hits as f64
        } else {
            0.0
        },
        valid_sessions: valid.len(),
        scored_sessions,
        total_hits,
        sessions,
        skipped_sessions,
    })
}

fn score_session(corpus: &Corpus, id: &str, mapping: &BundleMapping) -> Option<SessionScore> {
    let session = corpus.session(id)?;
    let ground_truth = corpus.ground_truth(id);
    let predicted = mapping.len();
    if predicted == 0 {
        return None;
    }

    let mut hits = 0;
    let mut coverage_sum = 0.0;
    for bundle in mapping {
        let items = resolve_items(bundle, session);
        if items.len() < MIN_BUNDLE_ITEMS {
            continue;
        }
        if let Some(truth) = first_superset(&items, ground_truth) {
            hits += 1;
            let truth_items = truth.item_set();
            let shared = items
                .iter()
                .filter(|item| truth_items.contains(item.as_str()))
                .count();
            coverage_sum += shared as f64 / truth_items.len() as f64;
        }
    }

    let recall = if ground_truth.is_empty() {
        0.0
    } else {
        hits as f64 / ground_truth.len() as f64
    };

    Some(SessionScore {
        session_id: id.to_string(),
        predicted,
        ground_truth: ground_truth.len(),
        hits,
        precision: hits as f64 / predicted as f64,
        recall,
        coverage_sum,
    })
}
