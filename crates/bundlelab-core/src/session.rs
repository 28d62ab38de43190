//! Reference data: sessions, ground-truth bundles and the item catalog.
//!
//! All of it is loaded once per run and shared read-only between sessions.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Prefix of the positional item references models are asked to use.
pub const PRODUCT_PREFIX: &str = "product";

/// An ordered purchase sequence.
///
/// `titles` is aligned with `items` when the dataset provides titles for the
/// session; it may be empty for sessions that are only used for evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub items: Vec<String>,
    #[serde(default)]
    pub titles: Vec<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, items: Vec<String>, titles: Vec<String>) -> Self {
        Self {
            id: id.into(),
            items,
            titles,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item at a 1-indexed position, as referenced by `product<N>`.
    pub fn item_at(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|idx| self.items.get(idx))
            .map(String::as_str)
    }

    /// `(product<N>, title)` pairs in session order.
    ///
    /// Falls back to item identifiers when the session carries no titles.
    pub fn product_listing(&self) -> Vec<(String, String)> {
        let labels: &[String] = if self.titles.is_empty() {
            &self.items
        } else {
            &self.titles
        };
        labels
            .iter()
            .enumerate()
            .map(|(idx, title)| (format!("{}{}", PRODUCT_PREFIX, idx + 1), title.clone()))
            .collect()
    }
}

/// A curated bundle observed in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthBundle {
    pub id: String,
    pub items: Vec<String>,
    /// Curated intent annotation, when the dataset has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

impl GroundTruthBundle {
    pub fn new(id: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            id: id.into(),
            items,
            intent: None,
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn item_set(&self) -> HashSet<&str> {
        self.items.iter().map(String::as_str).collect()
    }

    /// Text shown to raters as the reference intent. Datasets without a
    /// separate annotation use the bundle identifier itself.
    pub fn annotation(&self) -> &str {
        self.intent.as_deref().unwrap_or(&self.id)
    }

    /// True when every item of `items` belongs to this bundle.
    pub fn contains_all<'a>(&self, items: impl IntoIterator<Item = &'a str>) -> bool {
        let own = self.item_set();
        items.into_iter().all(|item| own.contains(item))
    }
}

/// Item identifier to human-readable title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemCatalog {
    titles: HashMap<String, String>,
}

impl ItemCatalog {
    pub fn new(titles: HashMap<String, String>) -> Self {
        Self { titles }
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }

    /// Title for an item, or the identifier itself when the catalog has none.
    pub fn title<'a>(&'a self, item_id: &'a str) -> &'a str {
        self.titles
            .get(item_id)
            .map(String::as_str)
            .unwrap_or(item_id)
    }
}

/// Sessions and ground truth indexed by session identifier.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    sessions: HashMap<String, Session>,
    ground_truth: HashMap<String, Vec<GroundTruthBundle>>,
    pub catalog: ItemCatalog,
}

impl Corpus {
    pub fn new(
        sessions: impl IntoIterator<Item = Session>,
        ground_truth: HashMap<String, Vec<GroundTruthBundle>>,
        catalog: ItemCatalog,
    ) -> Self {
        Self {
            sessions: sessions
                .into_iter()
                .map(|session| (session.id.clone(), session))
                .collect(),
            ground_truth,
            catalog,
        }
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Ground-truth bundles in dataset order; empty when the session has none.
    pub fn ground_truth(&self, id: &str) -> &[GroundTruthBundle] {
        self.ground_truth
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// One unit of work: a held-out test session paired with the related training
/// session the dialogue is refined on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPairing {
    pub test_id: String,
    pub reference: Session,
    pub reference_truth: Vec<GroundTruthBundle>,
    pub test: Session,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "s1",
            vec!["A".into(), "B".into(), "C".into()],
            vec!["Phone".into(), "Case".into(), "Charger".into()],
        )
    }

    #[test]
    fn item_at_is_one_indexed() {
        let session = session();
        assert_eq!(session.item_at(1), Some("A"));
        assert_eq!(session.item_at(3), Some("C"));
        assert_eq!(session.item_at(0), None);
        assert_eq!(session.item_at(4), None);
    }

    #[test]
    fn product_listing_uses_titles_when_present() {
        let listing = session().product_listing();
        assert_eq!(listing[0], ("product1".to_string(), "Phone".to_string()));
        assert_eq!(listing[2], ("product3".to_string(), "Charger".to_string()));
    }

    #[test]
    fn product_listing_falls_back_to_item_ids() {
        let session = Session::new("s2", vec!["X".into(), "Y".into()], Vec::new());
        let listing = session.product_listing();
        assert_eq!(listing[1], ("product2".to_string(), "Y".to_string()));
    }

    #[test]
    fn ground_truth_annotation_prefers_intent() {
        let plain = GroundTruthBundle::new("phone accessories", vec!["A".into(), "B".into()]);
        assert_eq!(plain.annotation(), "phone accessories");
        let annotated = plain.clone().with_intent("protect a new phone");
        assert_eq!(annotated.annotation(), "protect a new phone");
        assert!(annotated.contains_all(["A", "B"]));
        assert!(!annotated.contains_all(["A", "C"]));
    }

    #[test]
    fn corpus_missing_ground_truth_is_empty() {
        let corpus = Corpus::new(vec![session()], HashMap::new(), ItemCatalog::default());
        assert!(corpus.session("s1").is_some());
        assert!(corpus.ground_truth("s1").is_empty());
    }

    #[test]
    fn catalog_title_falls_back_to_id() {
        let catalog = ItemCatalog::new(HashMap::from([("A".to_string(), "Phone".to_string())]));
        assert_eq!(catalog.title("A"), "Phone");
        assert_eq!(catalog.title("Z"), "Z");
    }
}
