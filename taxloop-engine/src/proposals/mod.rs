//! Proposal generation
//!
//! Turns QA failures and confusion hotlist entries into typed rule-change or
//! threshold-change proposals, scored by confidence and expected impact.

mod generator;

pub use generator::{generate_proposals, GeneratorInput, THRESHOLD_STEP};
