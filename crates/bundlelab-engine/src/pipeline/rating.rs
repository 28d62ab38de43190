use crate::llm::parse::IntentEntry;
use crate::llm::{parse, ParseOptions, Schema};
use bundlelab_core::bundle::bundle_number;
use bundlelab_core::matcher::RelatedBundle;
use bundlelab_core::protocol::{ChatMessage, ModelClient};
use bundlelab_core::rating::RatingSheet;
use futures::future::join_all;
use std::sync::Arc;

/// Rating prompts sent to each rater. A malformed reply uses up an attempt.
pub const RATING_ATTEMPTS: usize = 3;

/// Score sums over every rater and attempt, indexed like `related`.
pub async fn rate_intents(
    raters: &[Arc<dyn ModelClient>],
    prompt: &str,
    related: &[RelatedBundle],
    options: ParseOptions,
) -> RatingSheet {
    let sheets = join_all(
        raters
            .iter()
            .map(|rater| rate_with(rater.as_ref(), prompt, related, options)),
    )
    .await;

    let mut total = RatingSheet::for_labels(related.iter().map(|bundle| bundle.label.clone()));
    for sheet in &sheets {
        total.merge(sheet);
    }
    total
}

async fn rate_with(
    rater: &dyn ModelClient,
    prompt: &str,
    related: &[RelatedBundle],
    options: ParseOptions,
) -> RatingSheet {
    let mut sheet = RatingSheet::for_labels(related.iter().map(|bundle| bundle.label.clone()));
    let messages = [ChatMessage::user(prompt)];

    for attempt in 1..=RATING_ATTEMPTS {
        let reply = rater.send(&messages).await;
        let outcome = parse(&reply, Schema::Intent, options);
        if !outcome.is_ok() {
            tracing::debug!(rater = rater.model_id(), attempt, "unparseable rating reply");
            continue;
        }

        let mut contributed = false;
        for (position, (label, entry)) in outcome.as_intents().into_iter().enumerate() {
            let IntentEntry::Rated {
                generated,
                reference,
            } = entry
            else {
                continue;
            };
            let index = rated_index(&label, position, related.len());
            contributed |= sheet.record(index, generated, reference);
        }
        if contributed {
            sheet.attempts += 1;
        } else {
            tracing::debug!(rater = rater.model_id(), attempt, "rating reply had no scores");
        }
    }
    sheet
}

/// Raters answer with `bundle<i>` following the prompt order; fall back to
/// the position in the reply when the label is unusable.
fn rated_index(label: &str, position: usize, count: usize) -> usize {
    bundle_number(label)
        .map(|number| number as usize)
        .filter(|number| (1..=count).contains(number))
        .map(|number| number - 1)
        .unwrap_or(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlelab_core::rating::ScoreVector;
    use std::future::Future;
    use std::pin::Pin;

    /// Gives the same reply to every prompt.
    struct FixedRater(&'static str);

    impl ModelClient for FixedRater {
        fn model_id(&self) -> &str {
            "fixed"
        }

        fn send<'a>(
            &'a self,
            _messages: &'a [ChatMessage],
        ) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
            let reply = self.0.to_string();
            Box::pin(async move { reply })
        }
    }

    fn related() -> Vec<RelatedBundle> {
        vec![RelatedBundle {
            label: "bundle1".into(),
            items: vec!["A".into(), "B".into()],
            intent: "protect a new phone".into(),
            ground_truth_items: vec!["A".into(), "B".into()],
            ground_truth_id: "g1".into(),
            ground_truth_intent: "phone protection".into(),
        }]
    }

    async fn rate_with_reply(reply: &'static str) -> RatingSheet {
        let raters: Vec<Arc<dyn ModelClient>> = vec![Arc::new(FixedRater(reply))];
        rate_intents(&raters, "rate these", &related(), ParseOptions::default()).await
    }

    #[tokio::test]
    async fn oversized_scores_count_as_malformed_attempts() {
        let sheet = rate_with_reply(r#"{"bundle1": {"intent1": [4294967295, 1, 1]}}"#).await;
        assert_eq!(sheet.attempts, 0);
        assert_eq!(sheet.bundles[0].samples, 0);
        assert_eq!(sheet.bundles[0].generated, ScoreVector::default());
    }

    #[tokio::test]
    async fn off_scale_scores_never_mask_a_weak_intent() {
        let sheet = rate_with_reply(r#"{"bundle1": {"intent1": [9, 9, 9], "intent2": [0, 4, 3]}}"#).await;
        assert_eq!(sheet.attempts, 0);
        assert!(sheet.is_empty());

        let weak = rate_with_reply(r#"{"bundle1": {"intent1": [1, 1, 1], "intent2": [3, 3, 2]}}"#).await;
        assert_eq!(weak.attempts, RATING_ATTEMPTS as u32);
        assert_eq!(weak.bundles[0].generated, ScoreVector::new(3, 3, 3));
        assert_eq!(weak.low_score_notes().len(), 1);
    }

    #[test]
    fn rated_index_prefers_bundle_number() {
        assert_eq!(rated_index("bundle2", 0, 3), 1);
        assert_eq!(rated_index("Bundle 3", 0, 3), 2);
        assert_eq!(rated_index("bundle7", 1, 3), 1);
        assert_eq!(rated_index("Phone accessories", 2, 3), 2);
    }
}
