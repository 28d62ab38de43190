//! Aligns candidate bundles with ground-truth bundles.

use crate::bundle::{canonical_label, parse_ref, BundleMapping, CandidateBundle};
use crate::session::{GroundTruthBundle, Session};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Intent attached when no spelling of a bundle label has an intent.
pub const NO_INTENT: &str = "No intent provided";

/// Minimum number of resolved items for a bundle to take part in matching.
pub const MIN_BUNDLE_ITEMS: usize = 2;

/// Resolve `product<N>` references to the session's item identifiers.
///
/// Out-of-range and unparseable references are dropped; the classifier has
/// already reported them. The result is deduplicated and in session order.
pub fn resolve_items(bundle: &CandidateBundle, session: &Session) -> Vec<String> {
    let positions: BTreeSet<usize> = bundle
        .refs()
        .filter_map(parse_ref)
        .filter(|pos| session.item_at(*pos).is_some())
        .collect();

    let mut seen = HashSet::new();
    positions
        .into_iter()
        .filter_map(|pos| session.item_at(pos))
        .filter(|item| seen.insert(*item))
        .map(str::to_string)
        .collect()
}

/// First ground-truth bundle, in dataset order, containing every item.
pub fn first_superset<'g>(
    items: &[String],
    ground_truth: &'g [GroundTruthBundle],
) -> Option<&'g GroundTruthBundle> {
    ground_truth
        .iter()
        .find(|truth| truth.contains_all(items.iter().map(String::as_str)))
}

/// Intent text keyed by bundle label, tolerant of label spelling.
#[derive(Debug, Clone, Default)]
pub struct IntentIndex {
    exact: HashMap<String, String>,
    folded: HashMap<String, String>,
    canonical: HashMap<String, String>,
}

impl IntentIndex {
    pub fn new<I, K, V>(intents: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut index = IntentIndex::default();
        for (label, intent) in intents {
            let label = label.into();
            let intent = intent.into();
            index
                .folded
                .entry(label.to_lowercase())
                .or_insert_with(|| intent.clone());
            if let Some(canonical) = canonical_label(&label) {
                index
                    .canonical
                    .entry(canonical)
                    .or_insert_with(|| intent.clone());
            }
            index.exact.entry(label).or_insert(intent);
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Exact label, then case-folded label, then canonical `bundle<N>` form.
    pub fn lookup(&self, label: &str) -> Option<&str> {
        self.exact
            .get(label)
            .or_else(|| self.folded.get(&label.to_lowercase()))
            .or_else(|| canonical_label(label).and_then(|canonical| self.canonical.get(&canonical)))
            .map(String::as_str)
    }
}

/// A generated bundle paired with the ground-truth bundle it falls inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedBundle {
    /// Label the model used for the bundle.
    pub label: String,
    pub items: Vec<String>,
    pub intent: String,
    pub ground_truth_items: Vec<String>,
    pub ground_truth_id: String,
    /// Reference intent shown to raters next to the generated one.
    pub ground_truth_intent: String,
}

impl RelatedBundle {
    pub fn joined_items(&self) -> String {
        self.items.join(",")
    }

    /// `(items, intent, ground-truth items, ground-truth id)` with items joined
    /// by commas.
    pub fn as_tuple(&self) -> (String, String, String, String) {
        (
            self.joined_items(),
            self.intent.clone(),
            self.ground_truth_items.join(","),
            self.ground_truth_id.clone(),
        )
    }
}

/// Pair every candidate bundle with at least [`MIN_BUNDLE_ITEMS`] resolved items
/// with its first ground-truth superset.
///
/// A label that is not a bundle label at all is taken to be the intent itself;
/// models sometimes key bundles by their intent.
pub fn match_bundles(
    mapping: &BundleMapping,
    intents: &IntentIndex,
    session: &Session,
    ground_truth: &[GroundTruthBundle],
) -> Vec<RelatedBundle> {
    let mut related = Vec::new();
    for bundle in mapping {
        let items = resolve_items(bundle, session);
        if items.len() < MIN_BUNDLE_ITEMS {
            continue;
        }
        let Some(truth) = first_superset(&items, ground_truth) else {
            continue;
        };
        let intent = if canonical_label(&bundle.label).is_some() {
            intents.lookup(&bundle.label).unwrap_or(NO_INTENT).to_string()
        } else {
            bundle.label.clone()
        };
        related.push(RelatedBundle {
            label: bundle.label.clone(),
            items,
            intent,
            ground_truth_items: truth.items.clone(),
            ground_truth_id: truth.id.clone(),
            ground_truth_intent: truth.annotation().to_string(),
        });
    }
    related
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "s1",
            ["A", "B", "C", "D"].map(String::from).to_vec(),
            Vec::new(),
        )
    }

    fn truth() -> Vec<GroundTruthBundle> {
        vec![
            GroundTruthBundle::new("g1", ["A", "B", "C"].map(String::from).to_vec()),
            GroundTruthBundle::new("g2", ["A", "B", "C", "D"].map(String::from).to_vec()),
        ]
    }

    #[test]
    fn resolve_drops_out_of_range_and_sorts() {
        let bundle = CandidateBundle::new("bundle1", ["product3", "product9", "product1", "x"]);
        assert_eq!(resolve_items(&bundle, &session()), vec!["A", "C"]);
    }

    #[test]
    fn first_superset_wins_in_dataset_order() {
        let mapping = BundleMapping::new(vec![CandidateBundle::new(
            "bundle1",
            ["product1", "product2"],
        )]);
        for _ in 0..3 {
            let related = match_bundles(&mapping, &IntentIndex::default(), &session(), &truth());
            assert_eq!(related.len(), 1);
            assert_eq!(related[0].ground_truth_id, "g1");
        }
    }

    #[test]
    fn single_item_bundles_are_skipped() {
        let mapping = BundleMapping::new(vec![CandidateBundle::new(
            "bundle1",
            ["product1", "product9"],
        )]);
        assert!(match_bundles(&mapping, &IntentIndex::default(), &session(), &truth()).is_empty());
    }

    #[test]
    fn intent_lookup_ladder() {
        let index = IntentIndex::new([("Bundle 1", "phone setup"), ("BUNDLE2", "gaming")]);
        assert_eq!(index.lookup("Bundle 1"), Some("phone setup"));
        assert_eq!(index.lookup("bundle 1"), Some("phone setup"));
        assert_eq!(index.lookup("bundle1"), Some("phone setup"));
        assert_eq!(index.lookup("1"), Some("phone setup"));
        assert_eq!(index.lookup("bundle2"), Some("gaming"));
        assert_eq!(index.lookup("bundle3"), None);
    }

    #[test]
    fn missing_intent_uses_sentinel_and_intent_labels_pass_through() {
        let mapping = BundleMapping::new(vec![
            CandidateBundle::new("bundle7", ["product1", "product2"]),
            CandidateBundle::new("home office upgrade", ["product2", "product4"]),
        ]);
        let related = match_bundles(&mapping, &IntentIndex::default(), &session(), &truth());
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].intent, NO_INTENT);
        assert_eq!(related[1].intent, "home office upgrade");
        assert_eq!(related[1].ground_truth_id, "g2");
        assert_eq!(
            related[1].as_tuple(),
            (
                "B,D".to_string(),
                "home office upgrade".to_string(),
                "A,B,C,D".to_string(),
                "g2".to_string()
            )
        );
    }
}
