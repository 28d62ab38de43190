//! Core domain model and contracts for bundle discovery runs.
//!
//! Nothing in this crate talks to the network or the filesystem. The engine
//! reaches models through [`protocol::ModelClient`] and everything else here is
//! pure data plus the classification, matching and scoring rules.

pub mod bundle;
pub mod classify;
pub mod conversation;
pub mod error;
pub mod matcher;
pub mod metrics;
pub mod protocol;
pub mod rating;
pub mod session;

pub use protocol::*;
