//! Harness gate
//!
//! Compares a candidate run's metrics against a baseline run and a frozen
//! benchmark snapshot. Every check is computed even after one fails, so the
//! result lists every failing metric at once.

mod benchmark;
mod evaluator;

pub use benchmark::{build_snapshot, ensure_snapshot};
pub use evaluator::HarnessEvaluator;
