//! Model orchestration for bundlelab: the chat client, the structured output
//! parser, prompt construction, the per-session refinement pipeline and the
//! evaluation lab.

pub mod lab;
pub mod llm;
pub mod pipeline;
