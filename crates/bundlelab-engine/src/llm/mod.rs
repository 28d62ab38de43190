pub mod client;
pub mod models;
pub mod parse;
pub mod prompts;

pub use client::{is_failure_sentinel, ChatClient, FAILURE_SENTINEL_PREFIX};
pub use models::Usage;
pub use parse::{parse, ParseOptions, ParseOutcome, ParseStatus, Schema};
