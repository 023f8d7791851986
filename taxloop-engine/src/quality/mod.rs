//! Quality aggregation
//!
//! Single reduction pass over a completed run's assignments: per-run quality
//! metrics and the ranked confusion hotlist. Runs only after every
//! per-product result is available; proposal generation reads its output.

mod confusion;
mod metrics;

pub use confusion::{mine_hotlist, ConfusionEntry, Hotlist};
pub use metrics::{compute_run_metrics, is_gate_passing};
