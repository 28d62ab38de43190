//! Loading of a named dataset directory.
//!
//! A dataset is a set of JSON files keyed by session identifier:
//!
//! | file | shape |
//! |---|---|
//! | `session_items.json` | id → `"item1,item2,..."` or a list of item ids |
//! | `session_bundles.json` | id → list of `[bundle_id, ..., "item1,item2"]` or `{id, items, intent}` |
//! | `item_titles.json` | item id → title |
//! | `training_set.json`, `test_set.json` | id → `"title1|title2|..."` or a list of titles |
//! | `related_sessions.json` | test id → training ids, most related first |

use bundlelab_core::session::{Corpus, GroundTruthBundle, ItemCatalog, Session, SessionPairing};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SESSION_ITEMS_FILE: &str = "session_items.json";
pub const SESSION_BUNDLES_FILE: &str = "session_bundles.json";
pub const ITEM_TITLES_FILE: &str = "item_titles.json";
pub const TRAINING_SET_FILE: &str = "training_set.json";
pub const TEST_SET_FILE: &str = "test_set.json";
pub const RELATED_SESSIONS_FILE: &str = "related_sessions.json";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset file '{path}' is missing")]
    Missing { path: PathBuf },
    #[error("failed to read dataset file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse dataset file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A list stored either as a JSON array or as one delimited string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawList {
    List(Vec<String>),
    Joined(String),
}

impl RawList {
    fn into_vec(self, delimiter: char) -> Vec<String> {
        match self {
            RawList::List(items) => items,
            RawList::Joined(text) if text.trim().is_empty() => Vec::new(),
            RawList::Joined(text) => text
                .split(delimiter)
                .map(|item| item.trim().to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawBundle {
    /// Bundle id first, comma-joined items last. Tried before `Record`, which
    /// would otherwise also accept a sequence.
    Tuple(Vec<Value>),
    Record {
        id: Value,
        items: RawList,
        #[serde(default)]
        intent: Option<String>,
    },
}

impl RawBundle {
    fn into_bundle(self) -> Option<GroundTruthBundle> {
        match self {
            RawBundle::Record { id, items, intent } => {
                let mut bundle = GroundTruthBundle::new(value_text(&id)?, items.into_vec(','));
                bundle.intent = intent.filter(|text| !text.trim().is_empty());
                Some(bundle)
            }
            RawBundle::Tuple(fields) => {
                if fields.len() < 2 {
                    return None;
                }
                let id = value_text(fields.first()?)?;
                let items = match fields.last()? {
                    Value::String(joined) => RawList::Joined(joined.clone()).into_vec(','),
                    Value::Array(entries) => entries.iter().filter_map(value_text).collect(),
                    _ => return None,
                };
                Some(GroundTruthBundle::new(id, items))
            }
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn read_json<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<T, DatasetError> {
    let path = dir.join(file);
    if !path.exists() {
        return Err(DatasetError::Missing { path });
    }
    let content = fs::read_to_string(&path).map_err(|source| DatasetError::Read {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| DatasetError::Parse { path, source })
}

/// Sessions, ground truth and item titles: everything evaluation needs.
pub fn load_corpus(dir: &Path) -> Result<Corpus, DatasetError> {
    let items: HashMap<String, RawList> = read_json(dir, SESSION_ITEMS_FILE)?;
    let raw_bundles: HashMap<String, Vec<RawBundle>> = read_json(dir, SESSION_BUNDLES_FILE)?;
    let catalog = match read_json::<HashMap<String, String>>(dir, ITEM_TITLES_FILE) {
        Ok(titles) => ItemCatalog::new(titles),
        Err(DatasetError::Missing { path }) => {
            tracing::warn!(path = %path.display(), "item titles missing, raters will see item ids");
            ItemCatalog::default()
        }
        Err(err) => return Err(err),
    };

    let sessions = items
        .into_iter()
        .map(|(id, list)| Session::new(id, list.into_vec(','), Vec::new()));

    let mut ground_truth = HashMap::with_capacity(raw_bundles.len());
    for (session_id, bundles) in raw_bundles {
        let total = bundles.len();
        let parsed: Vec<GroundTruthBundle> =
            bundles.into_iter().filter_map(RawBundle::into_bundle).collect();
        if parsed.len() < total {
            tracing::warn!(
                session = %session_id,
                skipped = total - parsed.len(),
                "skipped unreadable ground-truth bundles"
            );
        }
        ground_truth.insert(session_id, parsed);
    }

    Ok(Corpus::new(sessions, ground_truth, catalog))
}

/// A complete dataset: the corpus plus the train/test split.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub corpus: Corpus,
    training: HashMap<String, Vec<String>>,
    test: BTreeMap<String, Vec<String>>,
    related: HashMap<String, Vec<String>>,
}

impl Dataset {
    pub fn load(data_path: &Path, name: &str) -> Result<Self, DatasetError> {
        let dir = data_path.join(name);
        let corpus = load_corpus(&dir)?;
        let training: HashMap<String, RawList> = read_json(&dir, TRAINING_SET_FILE)?;
        let test: BTreeMap<String, RawList> = read_json(&dir, TEST_SET_FILE)?;
        let related: HashMap<String, Vec<Value>> = read_json(&dir, RELATED_SESSIONS_FILE)?;

        let dataset = Self {
            name: name.to_string(),
            corpus,
            training: training
                .into_iter()
                .map(|(id, titles)| (id, titles.into_vec('|')))
                .collect(),
            test: test
                .into_iter()
                .map(|(id, titles)| (id, titles.into_vec('|')))
                .collect(),
            related: related
                .into_iter()
                .map(|(id, ranked)| (id, ranked.iter().filter_map(value_text).collect()))
                .collect(),
        };
        tracing::info!(
            dataset = name,
            train = dataset.training.len(),
            test = dataset.test.len(),
            sessions = dataset.corpus.session_count(),
            "dataset loaded"
        );
        Ok(dataset)
    }

    pub fn test_count(&self) -> usize {
        self.test.len()
    }

    /// Pair every test session with its most related training session, in
    /// test identifier order. Tests without a usable reference session are
    /// skipped with a warning.
    pub fn pairings(&self) -> Vec<SessionPairing> {
        let mut pairings = Vec::with_capacity(self.test.len());
        for (test_id, test_titles) in &self.test {
            let Some(reference_id) = self.related.get(test_id).and_then(|ranked| ranked.first())
            else {
                tracing::warn!(test = %test_id, "no related training session, skipping");
                continue;
            };
            let Some(reference_titles) = self.training.get(reference_id) else {
                tracing::warn!(
                    test = %test_id,
                    reference = %reference_id,
                    "related session is not in the training set, skipping"
                );
                continue;
            };
            let Some(reference_items) = self.corpus.session(reference_id) else {
                tracing::warn!(
                    test = %test_id,
                    reference = %reference_id,
                    "related session has no items, skipping"
                );
                continue;
            };
            let test_items = self
                .corpus
                .session(test_id)
                .map(|session| session.items.clone())
                .unwrap_or_default();

            pairings.push(SessionPairing {
                test_id: test_id.clone(),
                reference: Session::new(
                    reference_id.clone(),
                    reference_items.items.clone(),
                    reference_titles.clone(),
                ),
                reference_truth: self.corpus.ground_truth(reference_id).to_vec(),
                test: Session::new(test_id.clone(), test_items, test_titles.clone()),
            });
        }
        pairings
    }
}
