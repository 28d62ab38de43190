//! Error types shared by the domain model.

use crate::protocol::Role;
use thiserror::Error;

/// Batch-level evaluation failures.
///
/// Per-session problems never surface here; they are recorded as session
/// outcomes instead. The only hard stop is an evaluation with nothing left
/// to score.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("No valid bundles: every session was empty or contained only single-item bundles")]
    NoValidBundles,
}

/// A persisted transcript that does not follow the user/assistant alternation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("message {index} has role '{found}', expected '{expected}'")]
    OutOfOrder {
        index: usize,
        expected: Role,
        found: Role,
    },
    #[error("conversation ends with an unanswered user message")]
    Unanswered,
}
