//! Accumulation of rater scores for generated and reference intents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDimension {
    /// 1-3: how easy the intent is to read.
    Naturalness,
    /// 1-3: how many bundle items the intent covers.
    Coverage,
    /// 1-2: whether the intent describes a motivation.
    Motivation,
}

impl ScoreDimension {
    pub const ALL: [ScoreDimension; 3] = [
        ScoreDimension::Naturalness,
        ScoreDimension::Coverage,
        ScoreDimension::Motivation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreDimension::Naturalness => "naturalness",
            ScoreDimension::Coverage => "coverage",
            ScoreDimension::Motivation => "motivation",
        }
    }

    /// Highest score on the dimension's scale. The lowest is always 1.
    pub fn max_score(&self) -> u32 {
        match self {
            ScoreDimension::Naturalness | ScoreDimension::Coverage => 3,
            ScoreDimension::Motivation => 2,
        }
    }

    /// Midpoint of the dimension's scale. Mean scores below it are flagged.
    pub fn midpoint(&self) -> f64 {
        match self {
            ScoreDimension::Naturalness | ScoreDimension::Coverage => 2.0,
            ScoreDimension::Motivation => 1.5,
        }
    }
}

/// `[naturalness, coverage, motivation]`, summed across rating attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct ScoreVector {
    pub naturalness: u32,
    pub coverage: u32,
    pub motivation: u32,
}

impl ScoreVector {
    pub fn new(naturalness: u32, coverage: u32, motivation: u32) -> Self {
        Self {
            naturalness,
            coverage,
            motivation,
        }
    }

    /// Read a rater's score list. Exactly three numbers are required, each
    /// within its dimension's scale; numeric strings are accepted and
    /// fractions truncated.
    pub fn from_value(value: &Value) -> Option<Self> {
        let Value::Array(entries) = value else {
            return None;
        };
        if entries.len() != 3 {
            return None;
        }
        let mut scores = [0u32; 3];
        for ((slot, entry), dimension) in scores.iter_mut().zip(entries).zip(ScoreDimension::ALL) {
            let score = score_component(entry)?;
            if !(1..=dimension.max_score()).contains(&score) {
                return None;
            }
            *slot = score;
        }
        Some(scores.into())
    }

    pub fn get(&self, dimension: ScoreDimension) -> u32 {
        match dimension {
            ScoreDimension::Naturalness => self.naturalness,
            ScoreDimension::Coverage => self.coverage,
            ScoreDimension::Motivation => self.motivation,
        }
    }
}

fn score_component(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

impl From<[u32; 3]> for ScoreVector {
    fn from([naturalness, coverage, motivation]: [u32; 3]) -> Self {
        Self::new(naturalness, coverage, motivation)
    }
}

impl From<ScoreVector> for [u32; 3] {
    fn from(scores: ScoreVector) -> Self {
        [scores.naturalness, scores.coverage, scores.motivation]
    }
}

impl AddAssign for ScoreVector {
    fn add_assign(&mut self, other: Self) {
        self.naturalness = self.naturalness.saturating_add(other.naturalness);
        self.coverage = self.coverage.saturating_add(other.coverage);
        self.motivation = self.motivation.saturating_add(other.motivation);
    }
}

/// Score sums for one related bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleRating {
    pub label: String,
    /// Sum of scores given to the generated intent.
    pub generated: ScoreVector,
    /// Sum of scores given to the reference intent.
    pub reference: ScoreVector,
    /// Number of attempts that scored the generated intent.
    pub samples: u32,
}

/// A generated intent whose mean score fell below the midpoint on some
/// dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingNote {
    pub label: String,
    pub dimensions: Vec<ScoreDimension>,
}

/// Per-bundle score sums, indexed like the related bundles shown to raters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSheet {
    pub bundles: Vec<BundleRating>,
    /// Rating attempts that parsed and contributed at least one score.
    pub attempts: u32,
}

impl RatingSheet {
    pub fn for_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bundles: labels
                .into_iter()
                .map(|label| BundleRating {
                    label: label.into(),
                    ..BundleRating::default()
                })
                .collect(),
            attempts: 0,
        }
    }

    /// Add one attempt's scores for the bundle at `index`. Out-of-range indices
    /// are ignored. Returns whether anything was recorded.
    pub fn record(
        &mut self,
        index: usize,
        generated: Option<ScoreVector>,
        reference: Option<ScoreVector>,
    ) -> bool {
        let Some(bundle) = self.bundles.get_mut(index) else {
            return false;
        };
        let mut recorded = false;
        if let Some(scores) = generated {
            bundle.generated += scores;
            bundle.samples += 1;
            recorded = true;
        }
        if let Some(scores) = reference {
            bundle.reference += scores;
            recorded = true;
        }
        recorded
    }

    /// Vector-add another sheet over the same bundles.
    pub fn merge(&mut self, other: &RatingSheet) {
        for (mine, theirs) in self.bundles.iter_mut().zip(&other.bundles) {
            mine.generated += theirs.generated;
            mine.reference += theirs.reference;
            mine.samples += theirs.samples;
        }
        self.attempts += other.attempts;
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.iter().all(|bundle| bundle.samples == 0)
    }

    /// Generated intents whose mean score is below the midpoint of at least
    /// one dimension.
    pub fn low_score_notes(&self) -> Vec<RatingNote> {
        self.bundles
            .iter()
            .filter(|bundle| bundle.samples > 0)
            .filter_map(|bundle| {
                let samples = f64::from(bundle.samples);
                let dimensions: Vec<ScoreDimension> = ScoreDimension::ALL
                    .into_iter()
                    .filter(|dim| f64::from(bundle.generated.get(*dim)) / samples < dim.midpoint())
                    .collect();
                (!dimensions.is_empty()).then(|| RatingNote {
                    label: bundle.label.clone(),
                    dimensions,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn score_vector_reads_numbers_and_numeric_strings() {
        assert_eq!(
            ScoreVector::from_value(&json!([3, "2", 1.0])),
            Some(ScoreVector::new(3, 2, 1))
        );
        assert_eq!(ScoreVector::from_value(&json!([3, 2])), None);
        assert_eq!(ScoreVector::from_value(&json!([3, "high", 1])), None);
        assert_eq!(ScoreVector::from_value(&json!([3, -1, 1])), None);
        assert_eq!(ScoreVector::from_value(&json!("3,2,1")), None);
    }

    #[test]
    fn score_vector_rejects_scores_off_the_scale() {
        assert_eq!(ScoreVector::from_value(&json!([0, 4, 3])), None);
        assert_eq!(ScoreVector::from_value(&json!([9, 9, 9])), None);
        assert_eq!(ScoreVector::from_value(&json!([3, 3, 3])), None);
        assert_eq!(ScoreVector::from_value(&json!([4294967295u64, 1, 1])), None);
        assert_eq!(
            ScoreVector::from_value(&json!([1, 3, 2])),
            Some(ScoreVector::new(1, 3, 2))
        );
    }

    #[test]
    fn sums_saturate_instead_of_overflowing() {
        let mut total = ScoreVector::new(u32::MAX, 1, 1);
        total += ScoreVector::new(3, 3, 2);
        assert_eq!(total, ScoreVector::new(u32::MAX, 4, 3));
    }

    #[test]
    fn score_vector_serializes_as_list() {
        let encoded = serde_json::to_value(ScoreVector::new(3, 2, 1)).unwrap();
        assert_eq!(encoded, json!([3, 2, 1]));
    }

    #[test]
    fn record_accumulates_by_vector_addition() {
        let mut sheet = RatingSheet::for_labels(["bundle1", "bundle2"]);
        assert!(sheet.record(0, Some(ScoreVector::new(3, 3, 2)), Some(ScoreVector::new(2, 2, 1))));
        assert!(sheet.record(0, Some(ScoreVector::new(2, 1, 1)), None));
        assert!(!sheet.record(5, Some(ScoreVector::new(1, 1, 1)), None));

        assert_eq!(sheet.bundles[0].generated, ScoreVector::new(5, 4, 3));
        assert_eq!(sheet.bundles[0].reference, ScoreVector::new(2, 2, 1));
        assert_eq!(sheet.bundles[0].samples, 2);
        assert_eq!(sheet.bundles[1].samples, 0);
    }

    #[test]
    fn merge_sums_sheets() {
        let mut a = RatingSheet::for_labels(["bundle1"]);
        a.record(0, Some(ScoreVector::new(3, 3, 2)), None);
        a.attempts = 1;
        let mut b = RatingSheet::for_labels(["bundle1"]);
        b.record(0, Some(ScoreVector::new(1, 1, 1)), Some(ScoreVector::new(3, 3, 2)));
        b.attempts = 1;

        a.merge(&b);
        assert_eq!(a.bundles[0].generated, ScoreVector::new(4, 4, 3));
        assert_eq!(a.bundles[0].reference, ScoreVector::new(3, 3, 2));
        assert_eq!(a.bundles[0].samples, 2);
        assert_eq!(a.attempts, 2);
    }

    #[test]
    fn low_scores_are_flagged_per_dimension() {
        let mut sheet = RatingSheet::for_labels(["bundle1", "bundle2", "bundle3"]);
        sheet.record(0, Some(ScoreVector::new(3, 1, 2)), None);
        sheet.record(0, Some(ScoreVector::new(3, 2, 1)), None);
        sheet.record(1, Some(ScoreVector::new(3, 3, 2)), None);

        let notes = sheet.low_score_notes();
        assert_eq!(
            notes,
            vec![RatingNote {
                label: "bundle1".to_string(),
                dimensions: vec![ScoreDimension::Coverage],
            }]
        );
    }
}
