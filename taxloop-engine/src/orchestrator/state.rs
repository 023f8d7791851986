//! Batch and run state machines
//!
//! Explicit finite-state-machine types with a total transition predicate.
//! "Latest attempt per sequence" is a pure projection over run rows, never
//! mutated in place.

use crate::models::RunMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch loop type: cheap canary validation or full-catalog loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Canary,
    Full,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::Canary => "canary",
            LoopType::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "canary" => Some(LoopType::Canary),
            "full" => Some(LoopType::Full),
            _ => None,
        }
    }
}

/// Batch lifecycle: queued -> running -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::CompletedWithFailures => "completed_with_failures",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BatchStatus::Queued),
            "running" => Some(BatchStatus::Running),
            "completed" => Some(BatchStatus::Completed),
            "completed_with_failures" => Some(BatchStatus::CompletedWithFailures),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::CompletedWithFailures
                | BatchStatus::Failed
                | BatchStatus::Cancelled
        )
    }

    /// Total transition predicate. Every (from, to) pair has an answer.
    pub fn can_transition(from: BatchStatus, to: BatchStatus) -> bool {
        use BatchStatus::*;
        match (from, to) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Completed)
            | (Running, CompletedWithFailures)
            | (Running, Failed)
            | (Running, Cancelled)
            // Stale-recovery requeue
            | (Running, Queued) => true,
            _ => false,
        }
    }
}

/// Run lifecycle within a batch loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Per-batch summary counters, stored as the batch's `summary` JSON column.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub loops_succeeded: u32,
    pub loops_failed: u32,
    pub proposals_applied: u32,
    pub rollbacks: u32,
}

/// One self-improvement batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfImprovementBatch {
    pub batch_id: Uuid,
    pub store_id: String,
    pub loop_type: LoopType,
    pub loop_count: u32,
    pub retry_limit: u32,
    pub structural_cap: u32,
    pub auto_apply: bool,
    pub status: BatchStatus,
    pub failure_reason: Option<String>,
    pub summary: BatchSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One run: a single loop attempt within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfImprovementRun {
    pub run_id: Uuid,
    pub batch_id: Uuid,
    pub store_id: String,
    pub sequence_no: u32,
    pub attempt_no: u32,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub metrics: Option<RunMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Latest attempt per sequence, as a pure projection: the input may contain
/// any number of attempts per sequence in any order.
pub fn latest_attempts(runs: &[SelfImprovementRun]) -> Vec<&SelfImprovementRun> {
    let mut latest: Vec<&SelfImprovementRun> = Vec::new();
    for run in runs {
        match latest
            .iter_mut()
            .find(|existing| existing.sequence_no == run.sequence_no)
        {
            Some(existing) => {
                if run.attempt_no > existing.attempt_no {
                    *existing = run;
                }
            }
            None => latest.push(run),
        }
    }
    latest.sort_by_key(|run| run.sequence_no);
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_predicate_is_total_and_correct() {
        use BatchStatus::*;
        let all = [Queued, Running, Completed, CompletedWithFailures, Failed, Cancelled];
        for from in all {
            for to in all {
                let allowed = BatchStatus::can_transition(from, to);
                // Terminal states never transition out
                if from.is_terminal() {
                    assert!(!allowed, "{:?} -> {:?} must be forbidden", from, to);
                }
            }
        }
        assert!(BatchStatus::can_transition(Queued, Running));
        assert!(BatchStatus::can_transition(Running, Queued));
        assert!(BatchStatus::can_transition(Queued, Cancelled));
        assert!(!BatchStatus::can_transition(Queued, Completed));
        assert!(!BatchStatus::can_transition(Cancelled, Running));
    }

    fn run(sequence_no: u32, attempt_no: u32, status: RunStatus) -> SelfImprovementRun {
        SelfImprovementRun {
            run_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            store_id: "store-1".into(),
            sequence_no,
            attempt_no,
            status,
            failure_reason: None,
            metrics: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn latest_attempt_projection() {
        let runs = vec![
            run(0, 1, RunStatus::Failed),
            run(0, 2, RunStatus::Succeeded),
            run(1, 1, RunStatus::Succeeded),
            run(2, 2, RunStatus::Failed),
            run(2, 1, RunStatus::Succeeded),
        ];
        let latest = latest_attempts(&runs);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].attempt_no, 2);
        assert_eq!(latest[0].status, RunStatus::Succeeded);
        assert_eq!(latest[1].attempt_no, 1);
        // Highest attempt wins even when an earlier attempt succeeded
        assert_eq!(latest[2].attempt_no, 2);
        assert_eq!(latest[2].status, RunStatus::Failed);
    }
}
