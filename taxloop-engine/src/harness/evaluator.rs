//! Candidate-vs-baseline evaluation

use crate::db;
use crate::models::{HarnessResult, MetricScore, RunMetrics};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use taxloop_common::config::HarnessConfig;
use taxloop_common::{Error, Result};
use tracing::info;
use uuid::Uuid;

pub struct HarnessEvaluator {
    pool: SqlitePool,
    store_id: String,
    config: HarnessConfig,
}

impl HarnessEvaluator {
    pub fn new(pool: SqlitePool, store_id: impl Into<String>, config: HarnessConfig) -> Self {
        Self {
            pool,
            store_id: store_id.into(),
            config,
        }
    }

    /// Evaluate the candidate run. Baseline defaults to the most recent
    /// succeeded run other than the candidate; the snapshot defaults to the
    /// latest and is rebuilt when undersized. The result is persisted.
    pub async fn evaluate(
        &self,
        candidate_run_id: Uuid,
        baseline_run_id: Option<Uuid>,
        snapshot_id: Option<Uuid>,
    ) -> Result<HarnessResult> {
        let candidate = self.run_metrics(candidate_run_id).await?;

        let baseline_run_id = match baseline_run_id {
            Some(id) => id,
            None => self.default_baseline(candidate_run_id).await?,
        };
        let baseline = self.run_metrics(baseline_run_id).await?;

        let snapshot = super::ensure_snapshot(
            &self.pool,
            &self.store_id,
            snapshot_id,
            self.config.min_benchmark_sample_size,
        )
        .await?;

        let result = self.compare(
            candidate_run_id,
            &candidate,
            baseline_run_id,
            &baseline,
            snapshot.snapshot_id,
            snapshot.sample.len(),
        );

        db::harness_runs::insert(&self.pool, &result).await?;
        info!(
            harness_run_id = %result.harness_run_id,
            passed = result.passed,
            failed = ?result.failed_metrics,
            "Harness evaluation complete"
        );
        Ok(result)
    }

    /// Pure comparison: every check runs, every failure is collected.
    fn compare(
        &self,
        candidate_run_id: Uuid,
        candidate: &RunMetrics,
        baseline_run_id: Uuid,
        baseline: &RunMetrics,
        snapshot_id: Uuid,
        snapshot_size: usize,
    ) -> HarnessResult {
        let mut scores = HashMap::new();
        let mut failed_metrics = Vec::new();

        let mut delta_check =
            |name: &str, baseline_value: f64, candidate_value: f64, min_delta: f64| {
                let delta = candidate_value - baseline_value;
                scores.insert(
                    name.to_string(),
                    MetricScore {
                        baseline: baseline_value,
                        candidate: candidate_value,
                        delta,
                    },
                );
                if delta < min_delta {
                    failed_metrics.push(name.to_string());
                }
            };

        delta_check(
            "accuracy_l1",
            baseline.accuracy_l1,
            candidate.accuracy_l1,
            self.config.min_accuracy_delta_l1,
        );
        delta_check(
            "accuracy_l2",
            baseline.accuracy_l2,
            candidate.accuracy_l2,
            self.config.min_accuracy_delta_l2,
        );
        delta_check(
            "accuracy_l3",
            baseline.accuracy_l3,
            candidate.accuracy_l3,
            self.config.min_accuracy_delta_l3,
        );

        // Absolute ceilings on the candidate alone
        scores.insert(
            "fallback_category_rate".to_string(),
            MetricScore {
                baseline: baseline.fallback_category_rate,
                candidate: candidate.fallback_category_rate,
                delta: candidate.fallback_category_rate - baseline.fallback_category_rate,
            },
        );
        if candidate.fallback_category_rate > self.config.max_fallback_rate {
            failed_metrics.push("fallback_category_rate".to_string());
        }

        scores.insert(
            "needs_review_rate".to_string(),
            MetricScore {
                baseline: baseline.needs_review_rate,
                candidate: candidate.needs_review_rate,
                delta: candidate.needs_review_rate - baseline.needs_review_rate,
            },
        );
        if candidate.needs_review_rate > self.config.max_needs_review_rate {
            failed_metrics.push("needs_review_rate".to_string());
        }

        scores.insert(
            "auto_accepted_rate".to_string(),
            MetricScore {
                baseline: baseline.auto_accepted_rate,
                candidate: candidate.auto_accepted_rate,
                delta: candidate.auto_accepted_rate - baseline.auto_accepted_rate,
            },
        );
        if candidate.auto_accepted_rate < self.config.min_auto_accepted_rate {
            failed_metrics.push("auto_accepted_rate".to_string());
        }

        scores.insert(
            "benchmark_sample_size".to_string(),
            MetricScore {
                baseline: self.config.min_benchmark_sample_size as f64,
                candidate: snapshot_size as f64,
                delta: snapshot_size as f64 - self.config.min_benchmark_sample_size as f64,
            },
        );
        if snapshot_size < self.config.min_benchmark_sample_size {
            failed_metrics.push("benchmark_sample_size".to_string());
        }

        HarnessResult {
            harness_run_id: Uuid::new_v4(),
            store_id: self.store_id.clone(),
            candidate_run_id,
            baseline_run_id,
            snapshot_id,
            passed: failed_metrics.is_empty(),
            scores,
            failed_metrics,
            created_at: Utc::now(),
        }
    }

    async fn default_baseline(&self, candidate_run_id: Uuid) -> Result<Uuid> {
        let latest = db::runs::latest_non_failed(&self.pool, &self.store_id).await?;
        match latest {
            Some(run) if run.run_id != candidate_run_id => Ok(run.run_id),
            _ => {
                // Fall back to the next-most-recent succeeded run
                let all = sqlx::query_scalar::<_, String>(
                    "SELECT run_id FROM runs WHERE store_id = ? AND status = 'succeeded'
                     AND run_id != ? ORDER BY created_at DESC, run_id DESC LIMIT 1",
                )
                .bind(&self.store_id)
                .bind(candidate_run_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
                let raw = all.ok_or_else(|| {
                    Error::NotFound(format!(
                        "No baseline run available for store {}",
                        self.store_id
                    ))
                })?;
                db::parse_uuid(&raw, "run_id")
            }
        }
    }

    async fn run_metrics(&self, run_id: Uuid) -> Result<RunMetrics> {
        let run = db::runs::get(&self.pool, run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run not found: {}", run_id)))?;
        run.metrics
            .ok_or_else(|| Error::InvalidInput(format!("Run {} has no recorded metrics", run_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(l1: f64, fallback: f64, review: f64) -> RunMetrics {
        RunMetrics {
            total: 100,
            auto_accepted_rate: 1.0 - review,
            needs_review_rate: review,
            fallback_category_rate: fallback,
            accuracy_l1: l1,
            accuracy_l2: l1 + 0.05,
            accuracy_l3: l1 + 0.10,
            labeled: 100,
        }
    }

    fn evaluator() -> HarnessEvaluator {
        // compare() never touches the pool
        let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        HarnessEvaluator::new(pool, "store-1", HarnessConfig::default())
    }

    #[tokio::test]
    async fn all_failures_collected_without_short_circuit() {
        let e = evaluator();
        let baseline = metrics(0.90, 0.05, 0.20);
        // Candidate regresses accuracy badly and blows both ceilings
        let candidate = metrics(0.50, 0.50, 0.90);

        let result = e.compare(
            Uuid::new_v4(),
            &candidate,
            Uuid::new_v4(),
            &baseline,
            Uuid::new_v4(),
            100,
        );
        assert!(!result.passed);
        for name in [
            "accuracy_l1",
            "accuracy_l2",
            "accuracy_l3",
            "fallback_category_rate",
            "needs_review_rate",
        ] {
            assert!(
                result.failed_metrics.contains(&name.to_string()),
                "missing failure: {}",
                name
            );
        }
        // Every score is still fully computed
        assert_eq!(result.scores.len(), 7);
    }

    #[tokio::test]
    async fn auto_accept_floor_fails_gate_when_configured() {
        let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        let config = HarnessConfig {
            min_auto_accepted_rate: 0.5,
            ..HarnessConfig::default()
        };
        let e = HarnessEvaluator::new(pool, "store-1", config);
        let baseline = metrics(0.90, 0.05, 0.20);
        let candidate = metrics(0.90, 0.05, 0.35); // auto rate 0.65, still above floor

        let result = e.compare(
            Uuid::new_v4(),
            &candidate,
            Uuid::new_v4(),
            &baseline,
            Uuid::new_v4(),
            100,
        );
        assert!(result.passed, "failed: {:?}", result.failed_metrics);

        let mut candidate = metrics(0.90, 0.05, 0.36); // within the review ceiling
        candidate.auto_accepted_rate = 0.40; // below the floor
        let result = e.compare(
            Uuid::new_v4(),
            &candidate,
            Uuid::new_v4(),
            &baseline,
            Uuid::new_v4(),
            100,
        );
        assert!(!result.passed);
        assert_eq!(result.failed_metrics, vec!["auto_accepted_rate"]);
    }

    #[tokio::test]
    async fn passes_within_tolerances() {
        let e = evaluator();
        let baseline = metrics(0.90, 0.05, 0.20);
        let candidate = metrics(0.895, 0.06, 0.22); // within -0.01 delta and ceilings

        let result = e.compare(
            Uuid::new_v4(),
            &candidate,
            Uuid::new_v4(),
            &baseline,
            Uuid::new_v4(),
            100,
        );
        assert!(result.passed, "failed: {:?}", result.failed_metrics);
    }

    #[tokio::test]
    async fn undersized_benchmark_fails_gate() {
        let e = evaluator();
        let baseline = metrics(0.90, 0.05, 0.20);
        let candidate = metrics(0.90, 0.05, 0.20);

        let result = e.compare(
            Uuid::new_v4(),
            &candidate,
            Uuid::new_v4(),
            &baseline,
            Uuid::new_v4(),
            10,
        );
        assert!(!result.passed);
        assert_eq!(result.failed_metrics, vec!["benchmark_sample_size"]);
    }
}
