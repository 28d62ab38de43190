//! Run bookkeeping and offline evaluation of persisted bundles.

pub mod evaluation;

pub use evaluation::{evaluate, is_no_valid_bundles, load_predictions, RunReport};
