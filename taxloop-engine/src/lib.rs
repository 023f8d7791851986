//! taxloop-engine - Classification and Self-Improvement Engine
//!
//! Classifies product listings into a versioned taxonomy and continuously
//! improves the taxonomy's match rules through a safety-gated control loop:
//! QA feedback and confusion signals are mined into proposals, applied
//! transactionally, validated on a biased canary subset against a benchmark
//! baseline, and rolled back on regression.
//!
//! Component layering (leaf-first):
//! - `taxonomy` - versioned store of category rules and attribute policies
//! - `engine`   - multi-signal decision engine (one product -> one assignment)
//! - `quality`  - run metrics and the confusion hotlist
//! - `proposals` - mines QA failures and confusion into typed proposals
//! - `apply`    - transactional apply/rollback of proposals
//! - `harness`  - candidate-vs-baseline regression gate
//! - `canary`   - deterministic biased subset selection
//! - `orchestrator` - batch state machine, polling worker, stale sweep

pub mod apply;
pub mod canary;
pub mod db;
pub mod engine;
pub mod harness;
pub mod models;
pub mod orchestrator;
pub mod proposals;
pub mod quality;
pub mod services;
pub mod taxonomy;

pub use taxloop_common::{Error, Result};
