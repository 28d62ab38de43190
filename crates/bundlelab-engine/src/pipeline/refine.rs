use super::rating::rate_intents;
use super::record::{
    Exclusion, FeedbackTranscript, FeedbackVerdict, SessionOutcome, SessionRecord, TestTranscript,
};
use super::{Pipeline, Stage};
use crate::llm::prompts::{
    bundle_detection_prompt, bundle_feedback_prompt, intent_correction_prompt,
    intent_rating_prompt, intent_regeneration_prompt, self_correction_prompt,
    test_detection_prompt, RULES_SUMMARY_PROMPT, SELF_CORRECTION_ROUNDS, TEST_INTENT_PROMPT,
};
use crate::llm::{is_failure_sentinel, parse, Schema};
use bundlelab_core::bundle::CandidateShape;
use bundlelab_core::classify::classify;
use bundlelab_core::conversation::Conversation;
use bundlelab_core::matcher::{match_bundles, IntentIndex};
use bundlelab_core::session::{GroundTruthBundle, Session, SessionPairing};
use tracing::Instrument;

/// Index of the bundle re-adjustment round among the self-correction rounds.
const READJUST_ROUND: usize = 1;

struct SelfCorrection {
    conversation: Conversation,
    /// Reply to the re-adjustment round.
    bundle_reply: String,
    /// Latest intent reply: round three, or round one after an early stop.
    intent_reply: String,
    calls: usize,
}

struct FeedbackResult {
    transcript: FeedbackTranscript,
    candidate: CandidateShape,
}

fn excluded(stage: Stage, reason: impl Into<String>) -> SessionOutcome {
    let reason = reason.into();
    tracing::warn!(%stage, %reason, "session excluded");
    SessionOutcome::Excluded(Exclusion { stage, reason })
}

impl Pipeline {
    /// Run one pairing through every stage. Never fails: problems end up in
    /// the record's outcome.
    pub async fn run_session(&self, pairing: &SessionPairing) -> SessionRecord {
        let span = tracing::debug_span!(
            "session",
            test = %pairing.test_id,
            reference = %pairing.reference.id
        );
        let mut record = SessionRecord::new(&pairing.test_id, &pairing.reference.id);
        record.outcome = self.refine(pairing, &mut record).instrument(span).await;
        record
    }

    /// Send one prompt on top of `conversation` and return the extended
    /// branch together with the reply.
    async fn exchange(&self, conversation: &Conversation, prompt: String) -> (Conversation, String) {
        let turn = conversation.ask(prompt);
        let messages = turn.messages();
        let reply = self.primary.send(&messages).await;
        if is_failure_sentinel(&reply) {
            tracing::warn!(
                model = self.primary.model_id(),
                %reply,
                "model call failed, continuing with the sentinel reply"
            );
        }
        (turn.answer(reply.clone()), reply)
    }

    async fn refine(&self, pairing: &SessionPairing, record: &mut SessionRecord) -> SessionOutcome {
        let session = &pairing.reference;
        let truth = pairing.reference_truth.as_slice();
        let parse_options = self.settings.parse;

        let corrected = self.self_correct(session).await;
        record.self_correction = corrected.conversation.clone();
        record.self_correction_calls = corrected.calls;

        tracing::debug!(stage = %Stage::Parse, "parsing self-corrected bundles");
        let parsed = parse(&corrected.bundle_reply, Schema::Bundle, parse_options);
        let parsed_ok = parsed.is_ok();
        let candidate = parsed.as_candidate();
        record.parsed = Some(parsed);
        if !parsed_ok {
            return excluded(Stage::Parse, "self-corrected bundles did not parse");
        }

        let feedback = self
            .feedback_loop(&corrected.conversation, candidate, session, truth)
            .await;
        let verdict = feedback.transcript.verdict;
        let engaged = feedback.transcript.engaged();
        let feedback_branch = feedback.transcript.conversation.clone();
        let candidate = feedback.candidate;
        record.feedback = Some(feedback.transcript);
        if verdict == FeedbackVerdict::Hallucinated {
            tracing::warn!(stage = %Stage::FeedbackLoop, "hallucinated products, stopping session");
            return SessionOutcome::Hallucinated;
        }

        let (intent_branch, intent_reply) = if engaged {
            tracing::debug!(stage = %Stage::IntentGeneration, "regenerating intents");
            self.exchange(&feedback_branch, intent_regeneration_prompt())
                .await
        } else {
            tracing::debug!(
                stage = %Stage::IntentGeneration,
                "feedback never engaged, keeping self-correction intents"
            );
            (corrected.conversation.clone(), corrected.intent_reply)
        };
        record.intents = Some(intent_branch.clone());

        let intents = parse(&intent_reply, Schema::Intent, parse_options);
        let index = IntentIndex::new(intents.intent_texts());
        let mapping = candidate.into_mapping().unwrap_or_default();
        record.related = match_bundles(&mapping, &index, session, truth);

        let mut test_base = intent_branch;
        if record.related.is_empty() {
            tracing::debug!(stage = %Stage::IntentRating, "no related bundles, skipping rating");
        } else if self.raters.is_empty() {
            tracing::debug!(stage = %Stage::IntentRating, "no raters configured, skipping rating");
        } else {
            tracing::debug!(
                stage = %Stage::IntentRating,
                bundles = record.related.len(),
                raters = self.raters.len(),
                "rating intents"
            );
            let prompt = intent_rating_prompt(&record.related, &self.catalog);
            let sheet = rate_intents(&self.raters, &prompt, &record.related, parse_options).await;
            let notes = sheet.low_score_notes();
            record.rating_prompt = Some(prompt);
            record.rating = Some(sheet);
            if !notes.is_empty() {
                tracing::debug!(flagged = notes.len(), "correcting low-scored intents");
                let (corrected_intents, _) = self
                    .exchange(&test_base, intent_correction_prompt(&notes))
                    .await;
                test_base = corrected_intents;
                record.intents = Some(test_base.clone());
            }
        }

        tracing::debug!(stage = %Stage::TestGeneration, test = %pairing.test.id, "detecting held-out bundles");
        let (conversation, rules) = self
            .exchange(&test_base, RULES_SUMMARY_PROMPT.to_string())
            .await;
        let (conversation, bundle_reply) = self
            .exchange(&conversation, test_detection_prompt(&pairing.test))
            .await;
        let (conversation, intent_reply) = self
            .exchange(&conversation, TEST_INTENT_PROMPT.to_string())
            .await;

        let bundles = parse(&bundle_reply, Schema::Bundle, parse_options);
        let bundles_ok = bundles.is_ok();
        let mapping = bundles.as_candidate().into_mapping().unwrap_or_default();
        record.test = Some(TestTranscript {
            conversation,
            rules,
            bundles,
            intents: parse(&intent_reply, Schema::Intent, parse_options),
        });
        if !bundles_ok {
            return excluded(Stage::TestGeneration, "held-out bundles did not parse");
        }

        tracing::debug!(stage = %Stage::Done, bundles = mapping.len(), "session complete");
        SessionOutcome::Completed { bundles: mapping }
    }

    /// Initial detection plus the three fixed self-correction rounds.
    ///
    /// When the re-adjusted bundles come back identical to the initial reply
    /// the last round is skipped.
    async fn self_correct(&self, session: &Session) -> SelfCorrection {
        tracing::debug!(stage = %Stage::Init, items = session.len(), "detecting bundles");
        let (mut conversation, init_reply) = self
            .exchange(&Conversation::new(), bundle_detection_prompt(session))
            .await;

        let mut bundle_reply = init_reply.clone();
        let mut intent_reply = String::new();
        let mut calls = 0;
        for round in 0..SELF_CORRECTION_ROUNDS {
            tracing::debug!(stage = %Stage::SelfCorrect, round, "self-correction round");
            let (next, reply) = self
                .exchange(&conversation, self_correction_prompt(round))
                .await;
            conversation = next;
            calls += 1;

            if round == READJUST_ROUND {
                let unchanged = reply == init_reply;
                bundle_reply = reply;
                if unchanged {
                    tracing::debug!(stage = %Stage::SelfCorrect, "bundles unchanged, stopping early");
                    break;
                }
            } else {
                intent_reply = reply;
            }
        }

        SelfCorrection {
            conversation,
            bundle_reply,
            intent_reply,
            calls,
        }
    }

    /// Classify and correct the candidate until it passes, hallucinates or
    /// the iteration bound runs out.
    async fn feedback_loop(
        &self,
        base: &Conversation,
        mut candidate: CandidateShape,
        session: &Session,
        truth: &[GroundTruthBundle],
    ) -> FeedbackResult {
        let mut conversation = base.clone();
        let mut reports = Vec::new();
        let mut corrections = 0;
        let mut verdict = FeedbackVerdict::Exhausted;

        for iteration in 0..self.settings.feedback_iterations {
            let report = classify(&candidate, truth, session);
            if report.is_success() {
                reports.push(report);
                verdict = FeedbackVerdict::Accepted;
                break;
            }
            if report.is_hallucination() {
                reports.push(report);
                verdict = FeedbackVerdict::Hallucinated;
                break;
            }

            let codes: Vec<u8> = report.codes().map(|code| code.as_u8()).collect();
            tracing::debug!(stage = %Stage::FeedbackLoop, iteration, ?codes, "sending feedback");
            let prompt = bundle_feedback_prompt(&report);
            reports.push(report);
            let (next, reply) = self.exchange(&conversation, prompt).await;
            conversation = next;
            corrections += 1;
            candidate = parse(&reply, Schema::Bundle, self.settings.parse).as_candidate();
        }

        FeedbackResult {
            transcript: FeedbackTranscript {
                conversation,
                reports,
                verdict,
                corrections,
            },
            candidate,
        }
    }
}
