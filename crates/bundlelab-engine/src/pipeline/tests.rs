use super::*;
use crate::llm::client::failure_sentinel;
use bundlelab_adapters::cache::{Artifact, ArtifactStore};
use bundlelab_core::classify::ErrorCode;
use bundlelab_core::protocol::{ChatMessage, Role};
use bundlelab_core::rating::ScoreVector;
use bundlelab_core::session::{GroundTruthBundle, Session};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Replays canned replies in order and keeps every prompt it was sent.
struct ScriptedClient {
    replies: Mutex<VecDeque<String>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedClient {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|reply| reply.to_string()).collect()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    fn history(&self, call: usize) -> Vec<ChatMessage> {
        self.seen.lock().unwrap()[call].clone()
    }
}

impl ModelClient for ScriptedClient {
    fn model_id(&self) -> &str {
        "scripted"
    }

    fn send<'a>(
        &'a self,
        messages: &'a [ChatMessage],
    ) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| failure_sentinel("script exhausted"));
        Box::pin(async move { reply })
    }
}

const PHONE_CASE: &str = r#"{"bundle1": ["product1", "product2"]}"#;
const PHONE_CHARGER: &str = r#"{"bundle1": ["product1", "product3"]}"#;
const INTENTS: &str = r#"{"bundle1": "protect a new phone"}"#;
const RULES: &str = "Group accessories with the device they serve.";
const TEST_BUNDLES: &str = r#"{"bundle1": ["product1", "product2"]}"#;
const TEST_INTENTS: &str = r#"{"bundle1": "desk setup"}"#;

fn pairing(test_id: &str) -> SessionPairing {
    SessionPairing {
        test_id: test_id.to_string(),
        reference: Session::new(
            "ref",
            ["A", "B", "C"].map(String::from).to_vec(),
            ["Phone", "Phone case", "Charger"].map(String::from).to_vec(),
        ),
        reference_truth: vec![GroundTruthBundle::new("g1", ["A", "B"].map(String::from).to_vec())
            .with_intent("phone protection")],
        test: Session::new(
            test_id,
            ["D", "E"].map(String::from).to_vec(),
            ["Desk lamp", "Desk mat"].map(String::from).to_vec(),
        ),
    }
}

fn catalog() -> Arc<ItemCatalog> {
    Arc::new(ItemCatalog::new(HashMap::from([
        ("A".to_string(), "Phone".to_string()),
        ("B".to_string(), "Phone case".to_string()),
        ("C".to_string(), "Charger".to_string()),
    ])))
}

fn pipeline(primary: Arc<ScriptedClient>, raters: Vec<Arc<ScriptedClient>>) -> Pipeline {
    let raters = raters
        .into_iter()
        .map(|rater| rater as Arc<dyn ModelClient>)
        .collect();
    Pipeline::new(primary, raters, catalog(), PipelineSettings::default())
}

fn user_prompts(messages: &[ChatMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter(|message| message.role == Role::User)
        .map(|message| message.content.as_str())
        .collect()
}

#[tokio::test]
async fn accepted_session_runs_to_completion() {
    let primary = ScriptedClient::new(&[
        PHONE_CASE,
        INTENTS,
        PHONE_CASE,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
    ]);
    let rater = ScriptedClient::new(&[
        r#"{"bundle1": {"intent1": [3, 3, 2], "intent2": [3, 2, 2]}}"#,
        r#"{"bundle1": {"intent1": [3, 3, 2], "intent2": [3, 2, 2]}}"#,
        r#"{"bundle1": {"intent1": [3, 3, 2], "intent2": [3, 2, 2]}}"#,
    ]);
    let pipeline = pipeline(primary.clone(), vec![rater.clone()]);

    let record = pipeline.run_session(&pairing("t1")).await;

    let bundles = record.bundles().expect("completed session");
    assert_eq!(bundles.len(), 1);
    assert_eq!(primary.calls(), 6);
    assert_eq!(primary.remaining(), 0);

    let feedback = record.feedback.as_ref().unwrap();
    assert_eq!(feedback.verdict, FeedbackVerdict::Accepted);
    assert!(!feedback.engaged());
    assert_eq!(feedback.reports.len(), 1);

    assert_eq!(record.related.len(), 1);
    assert_eq!(record.related[0].intent, "protect a new phone");
    assert_eq!(record.related[0].ground_truth_intent, "phone protection");

    let sheet = record.rating.as_ref().unwrap();
    assert_eq!(rater.calls(), RATING_ATTEMPTS);
    assert_eq!(sheet.attempts, 3);
    assert_eq!(sheet.bundles[0].generated, ScoreVector::new(9, 9, 6));
    assert_eq!(sheet.bundles[0].reference, ScoreVector::new(9, 6, 6));
    assert!(sheet.low_score_notes().is_empty());

    let test = record.test.as_ref().unwrap();
    assert_eq!(test.rules, RULES);
    assert!(test.intents.is_ok());
}

#[tokio::test]
async fn unchanged_readjustment_stops_self_correction_early() {
    let primary = ScriptedClient::new(&[
        PHONE_CASE,
        INTENTS,
        PHONE_CASE,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
    ]);
    let pipeline = pipeline(primary.clone(), Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;

    assert_eq!(record.self_correction_calls, 2);
    assert_eq!(record.self_correction.len(), 6);
    assert!(record.bundles().is_some());
    // Without a rater the rating stage is skipped entirely.
    assert!(record.rating.is_none());
}

#[tokio::test]
async fn changed_readjustment_runs_every_round() {
    let primary = ScriptedClient::new(&[
        PHONE_CHARGER,
        r#"{"bundle1": "charge a phone"}"#,
        PHONE_CASE,
        INTENTS,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
    ]);
    let pipeline = pipeline(primary.clone(), Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;

    assert_eq!(record.self_correction_calls, 3);
    assert_eq!(record.self_correction.len(), 8);
    assert_eq!(
        record.parsed.as_ref().unwrap().value["bundle1"],
        serde_json::json!(["product1", "product2"])
    );
    assert_eq!(record.related[0].intent, "protect a new phone");
    assert!(record.bundles().is_some());
}

#[tokio::test]
async fn hallucinated_products_stop_the_session() {
    let hallucinated = r#"{"bundle1": ["product1", "product5"]}"#;
    let primary = ScriptedClient::new(&[hallucinated, INTENTS, hallucinated]);
    let pipeline = pipeline(primary.clone(), Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;

    assert_eq!(record.outcome, SessionOutcome::Hallucinated);
    let feedback = record.feedback.as_ref().unwrap();
    assert_eq!(feedback.verdict, FeedbackVerdict::Hallucinated);
    assert_eq!(feedback.corrections, 0);
    assert!(record.test.is_none());
    assert_eq!(primary.calls(), 3);
}

#[tokio::test]
async fn unparseable_bundles_exclude_the_session() {
    let sentinel = failure_sentinel("connection refused");
    let primary = ScriptedClient::new(&[
        "I could not find any bundles.",
        INTENTS,
        sentinel.as_str(),
        INTENTS,
    ]);
    let pipeline = pipeline(primary.clone(), Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;

    match &record.outcome {
        SessionOutcome::Excluded(exclusion) => assert_eq!(exclusion.stage, Stage::Parse),
        other => panic!("expected exclusion, got {:?}", other),
    }
    assert!(record.feedback.is_none());
    assert_eq!(primary.calls(), 4);
}

#[tokio::test]
async fn feedback_corrections_stay_on_their_own_branch() {
    let primary = ScriptedClient::new(&[
        PHONE_CHARGER,
        INTENTS,
        PHONE_CHARGER,
        PHONE_CASE,
        INTENTS,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
    ]);
    let pipeline = pipeline(primary.clone(), Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;

    let feedback = record.feedback.as_ref().unwrap();
    assert_eq!(feedback.verdict, FeedbackVerdict::Accepted);
    assert_eq!(feedback.corrections, 1);
    assert_eq!(feedback.reports.len(), 2);
    assert!(!feedback.reports[0].is_success());
    assert!(feedback.reports[1].is_success());

    // The self-correction branch never sees the feedback prompt.
    assert_eq!(record.self_correction.len(), 6);
    assert!(user_prompts(&record.self_correction.messages())
        .iter()
        .all(|prompt| !prompt.starts_with("Based on the bundles you provided")));

    // Intent regeneration extends the feedback branch.
    let intents = record.intents.as_ref().unwrap();
    assert_eq!(intents.len(), feedback.conversation.len() + 2);
    let regeneration = primary.history(4);
    assert!(user_prompts(&regeneration)
        .iter()
        .any(|prompt| prompt.starts_with("Based on the bundles you provided")));

    let test = record.test.as_ref().unwrap();
    assert_eq!(test.conversation.len(), intents.len() + 6);
    assert!(record.bundles().is_some());
}

#[tokio::test]
async fn feedback_stops_at_the_iteration_bound() {
    let primary = ScriptedClient::new(&[
        PHONE_CHARGER,
        INTENTS,
        PHONE_CHARGER,
        PHONE_CHARGER,
        PHONE_CHARGER,
        INTENTS,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
    ]);
    let settings = PipelineSettings {
        feedback_iterations: 2,
        ..PipelineSettings::default()
    };
    let pipeline = Pipeline::new(primary.clone(), Vec::new(), catalog(), settings);

    let record = pipeline.run_session(&pairing("t1")).await;

    let feedback = record.feedback.as_ref().unwrap();
    assert_eq!(feedback.verdict, FeedbackVerdict::Exhausted);
    assert_eq!(feedback.corrections, 2);
    assert_eq!(feedback.reports.len(), 2);
    assert!(feedback
        .reports
        .iter()
        .all(|report| report.contains(ErrorCode::UncoveredGroundTruth)));

    // An exhausted loop still regenerates intents and reaches the test stage,
    // but the uncovered candidate relates to nothing.
    assert!(record.related.is_empty());
    assert!(record.rating.is_none());
    assert!(record.bundles().is_some());
    assert_eq!(primary.calls(), 9);
    assert_eq!(primary.remaining(), 0);
}

#[tokio::test]
async fn unparseable_correction_is_reported_as_empty() {
    let primary = ScriptedClient::new(&[
        PHONE_CHARGER,
        INTENTS,
        PHONE_CHARGER,
        "Sorry, let me think about that again.",
        PHONE_CASE,
        INTENTS,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
    ]);
    let pipeline = pipeline(primary.clone(), Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;

    let feedback = record.feedback.as_ref().unwrap();
    assert_eq!(feedback.verdict, FeedbackVerdict::Accepted);
    assert_eq!(feedback.corrections, 2);
    let codes: Vec<Vec<u8>> = feedback
        .reports
        .iter()
        .map(|report| report.codes().map(|code| code.as_u8()).collect())
        .collect();
    assert_eq!(codes, vec![vec![6], vec![1], vec![0]]);

    // The second correction is asked on top of the unusable reply.
    let second = primary.history(4);
    assert_eq!(second[second.len() - 2].role, Role::Assistant);
    assert_eq!(
        second[second.len() - 2].content,
        "Sorry, let me think about that again."
    );

    assert_eq!(record.related.len(), 1);
    assert!(record.bundles().is_some());
    assert_eq!(primary.calls(), 9);
}

#[tokio::test]
async fn low_rated_intents_are_corrected_before_the_test() {
    let primary = ScriptedClient::new(&[
        PHONE_CASE,
        INTENTS,
        PHONE_CASE,
        r#"{"bundle1": "keep a new phone safe from drops"}"#,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
    ]);
    let low = r#"{"bundle1": {"intent1": [1, 1, 1], "intent2": [3, 3, 2]}}"#;
    let rater = ScriptedClient::new(&[low, "not a rating", low]);
    let pipeline = pipeline(primary.clone(), vec![rater]);

    let record = pipeline.run_session(&pairing("t1")).await;

    let sheet = record.rating.as_ref().unwrap();
    assert_eq!(sheet.attempts, 2);
    assert_eq!(sheet.bundles[0].samples, 2);
    assert_eq!(sheet.low_score_notes().len(), 1);

    assert_eq!(primary.calls(), 7);
    let correction = primary.history(3);
    let last = correction.last().unwrap();
    assert!(last
        .content
        .contains("please improve the intent in terms of naturalness and coverage and motivation"));
    assert!(record.bundles().is_some());
}

#[tokio::test]
async fn unparseable_test_bundles_exclude_the_session() {
    let primary = ScriptedClient::new(&[
        PHONE_CASE,
        INTENTS,
        PHONE_CASE,
        RULES,
        "no bundles in this one",
        TEST_INTENTS,
    ]);
    let pipeline = pipeline(primary, Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;

    match &record.outcome {
        SessionOutcome::Excluded(exclusion) => {
            assert_eq!(exclusion.stage, Stage::TestGeneration)
        }
        other => panic!("expected exclusion, got {:?}", other),
    }
    assert!(record.test.is_some());
}

#[tokio::test]
async fn stage_entries_follow_the_outcome() {
    let hallucinated = r#"{"bundle1": ["product4", "product5"]}"#;
    let primary = ScriptedClient::new(&[hallucinated, INTENTS, hallucinated]);
    let pipeline = pipeline(primary, Vec::new());

    let record = pipeline.run_session(&pairing("t1")).await;
    let entries = record.stage_entries().unwrap();
    let kinds: Vec<Artifact> = entries.iter().map(|(artifact, _)| *artifact).collect();

    assert_eq!(
        kinds,
        vec![
            Artifact::SelfCorrection,
            Artifact::Parsed,
            Artifact::Feedback,
            Artifact::Hallucinated
        ]
    );
    assert_eq!(entries[0].1["calls"], 2);
    assert_eq!(entries[3].1["reference_session"], "ref");
}

#[tokio::test]
async fn batch_summary_counts_outcomes() {
    let hallucinated = r#"{"bundle1": ["product1", "product5"]}"#;
    let primary = ScriptedClient::new(&[
        PHONE_CASE,
        INTENTS,
        PHONE_CASE,
        RULES,
        TEST_BUNDLES,
        TEST_INTENTS,
        hallucinated,
        INTENTS,
        hallucinated,
    ]);
    let settings = PipelineSettings {
        concurrency: 1,
        ..PipelineSettings::default()
    };
    let pipeline = Pipeline::new(primary, Vec::new(), catalog(), settings);

    let mut finished = Vec::new();
    let summary = pipeline
        .run_batch(&[pairing("t1"), pairing("t2")], |record| {
            finished.push(record.test_id);
            async { anyhow::Ok(()) }
        })
        .await
        .unwrap();

    assert_eq!(
        summary,
        BatchSummary {
            sessions: 2,
            completed: 1,
            hallucinated: 1,
            excluded: 0,
        }
    );
    assert_eq!(finished, vec!["t1", "t2"]);
}

#[tokio::test]
async fn failing_sink_stops_the_batch() {
    let primary = ScriptedClient::new(&[]);
    let pipeline = Pipeline::new(primary, Vec::new(), catalog(), PipelineSettings::default());

    let result = pipeline
        .run_batch(&[pairing("t1")], |_| async {
            Err::<(), _>(anyhow::anyhow!("disk full"))
        })
        .await;

    assert_eq!(result.unwrap_err().to_string(), "disk full");
}

async fn persist(store: Arc<ArtifactStore>, record: SessionRecord) -> anyhow::Result<()> {
    let entries = record.stage_entries()?;
    tokio::task::spawn_blocking(move || store.record_many(&record.test_id, &entries)).await?
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn records_are_persisted_off_the_async_workers() {
    let hallucinated = r#"{"bundle1": ["product1", "product5"]}"#;
    // Identical replies keep the interleaved sessions independent of order.
    let primary = ScriptedClient::new(&[hallucinated; 6]);
    let settings = PipelineSettings {
        concurrency: 2,
        ..PipelineSettings::default()
    };
    let pipeline = Pipeline::new(primary, Vec::new(), catalog(), settings);
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArtifactStore::new(dir.path()));

    let summary = pipeline
        .run_batch(&[pairing("t1"), pairing("t2")], |record| {
            persist(Arc::clone(&store), record)
        })
        .await
        .unwrap();

    assert_eq!(summary.hallucinated, 2);
    let stopped = store
        .load_typed::<serde_json::Value>(Artifact::Hallucinated)
        .unwrap();
    assert_eq!(stopped.keys().collect::<Vec<_>>(), vec!["t1", "t2"]);
}
