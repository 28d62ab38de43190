//! Validation of candidate bundles against the session and its ground truth.
//!
//! The resulting [`ErrorReport`] drives the corrective feedback dialogue.

use crate::bundle::{parse_ref, CandidateShape, MalformedReason};
use crate::matcher::resolve_items;
use crate::session::{GroundTruthBundle, Session};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NO_ERRORS: &str = "No errors";

/// Description used when a defect concerns the whole response.
const WHOLE_RESPONSE: &str = "in the response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    NoErrors,
    Empty,
    NotConvertible,
    NotAMapping,
    NonTextItem,
    Hallucination,
    UncoveredGroundTruth,
}

impl ErrorCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            ErrorCode::NoErrors => 0,
            ErrorCode::Empty => 1,
            ErrorCode::NotConvertible => 2,
            ErrorCode::NotAMapping => 3,
            ErrorCode::NonTextItem => 4,
            ErrorCode::Hallucination => 5,
            ErrorCode::UncoveredGroundTruth => 6,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => ErrorCode::NoErrors,
            1 => ErrorCode::Empty,
            2 => ErrorCode::NotConvertible,
            3 => ErrorCode::NotAMapping,
            4 => ErrorCode::NonTextItem,
            5 => ErrorCode::Hallucination,
            6 => ErrorCode::UncoveredGroundTruth,
            _ => return None,
        })
    }
}

/// Error code to description, ordered by code.
///
/// A passing candidate yields exactly `{0: "No errors"}`; codes 1-6 may
/// co-occur.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorReport {
    entries: BTreeMap<u8, String>,
}

impl ErrorReport {
    pub fn success() -> Self {
        Self::single(ErrorCode::NoErrors, NO_ERRORS)
    }

    pub fn single(code: ErrorCode, description: impl Into<String>) -> Self {
        let mut report = Self::default();
        report.insert(code, description);
        report
    }

    fn insert(&mut self, code: ErrorCode, description: impl Into<String>) {
        self.entries.insert(code.as_u8(), description.into());
    }

    /// True only for the exact `{0}` report.
    pub fn is_success(&self) -> bool {
        self.entries.len() == 1 && self.entries.contains_key(&ErrorCode::NoErrors.as_u8())
    }

    pub fn contains(&self, code: ErrorCode) -> bool {
        self.entries.contains_key(&code.as_u8())
    }

    pub fn is_hallucination(&self) -> bool {
        self.contains(ErrorCode::Hallucination)
    }

    pub fn description(&self, code: ErrorCode) -> Option<&str> {
        self.entries.get(&code.as_u8()).map(String::as_str)
    }

    pub fn codes(&self) -> impl Iterator<Item = ErrorCode> + '_ {
        self.entries.keys().filter_map(|code| ErrorCode::from_u8(*code))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ErrorCode, &str)> + '_ {
        self.entries
            .iter()
            .filter_map(|(code, text)| ErrorCode::from_u8(*code).map(|c| (c, text.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classify a candidate for one session.
///
/// Shape defects (codes 1-3) short-circuit. Content checks accumulate: code 4
/// for non-text items, code 5 for references outside `[1, session_length]` or
/// not of the form `product<N>`, and a single code 6 when some ground-truth
/// bundle has no candidate bundle falling entirely inside it.
pub fn classify(
    candidate: &CandidateShape,
    ground_truth: &[GroundTruthBundle],
    session: &Session,
) -> ErrorReport {
    let mapping = match candidate {
        CandidateShape::Absent => return ErrorReport::single(ErrorCode::Empty, WHOLE_RESPONSE),
        CandidateShape::Malformed(MalformedReason::NotConvertible) => {
            return ErrorReport::single(ErrorCode::NotConvertible, WHOLE_RESPONSE)
        }
        CandidateShape::Malformed(MalformedReason::NotAMapping) => {
            return ErrorReport::single(ErrorCode::NotAMapping, WHOLE_RESPONSE)
        }
        CandidateShape::Valid(mapping) if mapping.is_empty() => {
            return ErrorReport::single(ErrorCode::Empty, WHOLE_RESPONSE)
        }
        CandidateShape::Valid(mapping) => mapping,
    };

    let mut report = ErrorReport::default();

    let non_text: Vec<&str> = mapping
        .iter()
        .filter(|bundle| bundle.has_non_text())
        .map(|bundle| bundle.label.as_str())
        .collect();
    if !non_text.is_empty() {
        report.insert(ErrorCode::NonTextItem, non_text.join(", "));
    }

    let hallucinated: Vec<&str> = mapping
        .iter()
        .filter(|bundle| {
            bundle.refs().any(|reference| {
                parse_ref(reference)
                    .and_then(|pos| session.item_at(pos))
                    .is_none()
            })
        })
        .map(|bundle| bundle.label.as_str())
        .collect();
    if !hallucinated.is_empty() {
        report.insert(ErrorCode::Hallucination, hallucinated.join(", "));
    }

    let resolved: Vec<(&str, Vec<String>)> = mapping
        .iter()
        .map(|bundle| (bundle.label.as_str(), resolve_items(bundle, session)))
        .collect();
    let fits = |items: &[String], truth: &GroundTruthBundle| {
        !items.is_empty() && truth.contains_all(items.iter().map(String::as_str))
    };
    let uncovered = ground_truth
        .iter()
        .any(|truth| !resolved.iter().any(|(_, items)| fits(items.as_slice(), truth)));
    if uncovered {
        let misfits: Vec<&str> = resolved
            .iter()
            .filter(|(_, items)| !ground_truth.iter().any(|truth| fits(items.as_slice(), truth)))
            .map(|(label, _)| *label)
            .collect();
        let description = if misfits.is_empty() {
            WHOLE_RESPONSE.to_string()
        } else {
            misfits.join(", ")
        };
        report.insert(ErrorCode::UncoveredGroundTruth, description);
    }

    if report.is_empty() {
        ErrorReport::success()
    } else {
        report
    }
}
