//! Candidate bundle mappings produced by the model.
//!
//! Model output is dynamically shaped. [`CandidateShape::from_value`] turns a
//! parsed JSON value into a tagged variant once, so classification and matching
//! never have to inspect raw JSON.

use crate::session::PRODUCT_PREFIX;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const BUNDLE_PREFIX: &str = "bundle";

/// One element of a candidate bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemEntry {
    /// A textual reference, normally `product<N>`.
    Ref(String),
    /// Anything the model emitted that is not text.
    NonText(Value),
}

impl ItemEntry {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(text) => ItemEntry::Ref(text.clone()),
            other => ItemEntry::NonText(other.clone()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ItemEntry::Ref(text) => Value::String(text.clone()),
            ItemEntry::NonText(value) => value.clone(),
        }
    }

    pub fn as_ref_str(&self) -> Option<&str> {
        match self {
            ItemEntry::Ref(text) => Some(text),
            ItemEntry::NonText(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBundle {
    pub label: String,
    pub items: Vec<ItemEntry>,
}

impl CandidateBundle {
    pub fn new<I, S>(label: impl Into<String>, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            items: refs
                .into_iter()
                .map(|r| ItemEntry::Ref(r.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Textual references, skipping non-text entries.
    pub fn refs(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(ItemEntry::as_ref_str)
    }

    pub fn has_non_text(&self) -> bool {
        self.items
            .iter()
            .any(|item| matches!(item, ItemEntry::NonText(_)))
    }
}

/// Ordered bundle label to items mapping. Serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct BundleMapping {
    bundles: Vec<CandidateBundle>,
}

impl BundleMapping {
    pub fn new(bundles: Vec<CandidateBundle>) -> Self {
        Self { bundles }
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CandidateBundle> {
        self.bundles.iter()
    }

    pub fn get(&self, label: &str) -> Option<&CandidateBundle> {
        self.bundles.iter().find(|bundle| bundle.label == label)
    }

    /// Copy keeping only bundles with more than one item.
    pub fn without_single_items(&self) -> BundleMapping {
        BundleMapping {
            bundles: self
                .bundles
                .iter()
                .filter(|bundle| bundle.len() > 1)
                .cloned()
                .collect(),
        }
    }

    fn from_object(map: &Map<String, Value>) -> Self {
        let bundles = map
            .iter()
            .map(|(label, value)| CandidateBundle {
                label: label.clone(),
                items: match value {
                    Value::Array(entries) => entries.iter().map(ItemEntry::from_value).collect(),
                    other => vec![ItemEntry::from_value(other)],
                },
            })
            .collect();
        Self { bundles }
    }
}

impl<'a> IntoIterator for &'a BundleMapping {
    type Item = &'a CandidateBundle;
    type IntoIter = std::slice::Iter<'a, CandidateBundle>;

    fn into_iter(self) -> Self::IntoIter {
        self.bundles.iter()
    }
}

impl From<Map<String, Value>> for BundleMapping {
    fn from(map: Map<String, Value>) -> Self {
        BundleMapping::from_object(&map)
    }
}

impl From<BundleMapping> for Map<String, Value> {
    fn from(mapping: BundleMapping) -> Self {
        mapping
            .bundles
            .into_iter()
            .map(|bundle| {
                let items = bundle.items.iter().map(ItemEntry::to_value).collect();
                (bundle.label, Value::Array(items))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedReason {
    /// A plain collection whose elements cannot become bundles.
    NotConvertible,
    /// A scalar where a mapping was expected.
    NotAMapping,
}

/// Normalized view of whatever the model produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateShape {
    Absent,
    Malformed(MalformedReason),
    Valid(BundleMapping),
}

impl CandidateShape {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => CandidateShape::Absent,
            Value::Object(map) if map.is_empty() => CandidateShape::Absent,
            Value::Object(map) => CandidateShape::Valid(BundleMapping::from_object(map)),
            Value::Array(entries) if entries.is_empty() => CandidateShape::Absent,
            Value::Array(entries) => coerce_positional(entries),
            _ => CandidateShape::Malformed(MalformedReason::NotAMapping),
        }
    }

    pub fn mapping(&self) -> Option<&BundleMapping> {
        match self {
            CandidateShape::Valid(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn into_mapping(self) -> Option<BundleMapping> {
        match self {
            CandidateShape::Valid(mapping) => Some(mapping),
            _ => None,
        }
    }
}

impl From<BundleMapping> for CandidateShape {
    fn from(mapping: BundleMapping) -> Self {
        if mapping.is_empty() {
            CandidateShape::Absent
        } else {
            CandidateShape::Valid(mapping)
        }
    }
}

/// A list of bundles becomes `bundle1..bundleN` by position. Each element must
/// itself be a list of items or a single item reference.
fn coerce_positional(entries: &[Value]) -> CandidateShape {
    let mut bundles = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let items = match entry {
            Value::Array(items) => items.iter().map(ItemEntry::from_value).collect(),
            Value::String(text) => vec![ItemEntry::Ref(text.clone())],
            _ => return CandidateShape::Malformed(MalformedReason::NotConvertible),
        };
        bundles.push(CandidateBundle {
            label: format!("{}{}", BUNDLE_PREFIX, idx + 1),
            items,
        });
    }
    CandidateShape::Valid(BundleMapping::new(bundles))
}

/// Number in a bundle label spelled any of the ways models spell it:
/// `bundle3`, `Bundle 3`, `BUNDLE_3`, `3`.
pub fn bundle_number(label: &str) -> Option<u32> {
    let lower = label.trim().to_ascii_lowercase();
    let rest = lower.strip_prefix(BUNDLE_PREFIX).unwrap_or(&lower);
    let digits = rest.trim_start_matches([' ', '_', '-', '#']).trim_end();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Canonical `bundle<N>` form of a label, if it is a bundle label at all.
pub fn canonical_label(label: &str) -> Option<String> {
    bundle_number(label).map(|n| format!("{}{}", BUNDLE_PREFIX, n))
}

/// Position referenced by `product<N>` (case-insensitive). The position is not
/// range-checked here.
pub fn parse_ref(reference: &str) -> Option<usize> {
    let lower = reference.trim().to_ascii_lowercase();
    let digits = lower.strip_prefix(PRODUCT_PREFIX)?.trim_start();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
