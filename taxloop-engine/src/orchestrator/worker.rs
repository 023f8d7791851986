//! Self-improvement worker
//!
//! Polls for queued batches, claims one atomically, and drives its loop
//! iterations. Each iteration runs the staged pipeline: propose, gated
//! apply, subset classification, quality aggregation, harness evaluation,
//! then keep-or-rollback. Every stage runs under the configured stage
//! timeout, and cancellation is honored at loop boundaries.

use crate::apply::{ApplyGate, ApplyManager, ApplyReport, RollbackTarget};
use crate::canary;
use crate::db;
use crate::engine::DecisionEngine;
use crate::harness::HarnessEvaluator;
use crate::models::{Product, QaCorrection, RunMetrics};
use crate::orchestrator::state::{
    latest_attempts, BatchStatus, LoopType, RunStatus, SelfImprovementBatch, SelfImprovementRun,
};
use crate::proposals::{generate_proposals, GeneratorInput};
use crate::quality::{compute_run_metrics, mine_hotlist};
use crate::services::{Completer, Embedder};
use crate::taxonomy::TaxonomyStore;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use taxloop_common::config::EngineConfig;
use taxloop_common::runlog::{LogLevel, RunLogWriter};
use taxloop_common::{Error, Result};
use tracing::{error, info, warn};

pub struct Worker {
    pool: SqlitePool,
    config: EngineConfig,
    completer: Arc<dyn Completer>,
    embedder: Arc<dyn Embedder>,
}

impl Worker {
    pub fn new(
        pool: SqlitePool,
        config: EngineConfig,
        completer: Arc<dyn Completer>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            pool,
            config,
            completer,
            embedder,
        }
    }

    /// Poll loop: claim and process batches until the task is aborted.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Worker started"
        );
        loop {
            match db::batches::claim_next_queued(&self.pool).await {
                Ok(Some(batch)) => {
                    info!(batch_id = %batch.batch_id, store_id = %batch.store_id, "Claimed batch");
                    if let Err(e) = self.run_batch(batch).await {
                        error!("Batch processing failed: {}", e);
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
                Err(e) => {
                    error!("Batch claim failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                }
            }
        }
    }

    /// Drive every loop iteration of one claimed batch to a terminal state.
    pub async fn run_batch(&self, batch: SelfImprovementBatch) -> Result<()> {
        let mut summary = batch.summary;
        let runlog = RunLogWriter::new(self.pool.clone(), batch.store_id.clone());

        for sequence_no in 0..batch.loop_count {
            // Cancellation and external transitions are honored here, at the
            // loop boundary; a running stage always finishes or times out.
            let Some(current) = db::batches::get(&self.pool, batch.batch_id).await? else {
                return Err(Error::NotFound(format!("Batch vanished: {}", batch.batch_id)));
            };
            if current.status == BatchStatus::Cancelled {
                info!(batch_id = %batch.batch_id, "Batch cancelled; stopping");
                return Ok(());
            }
            if current.status != BatchStatus::Running {
                warn!(
                    batch_id = %batch.batch_id,
                    status = current.status.as_str(),
                    "Batch no longer running; stopping"
                );
                return Ok(());
            }

            let runs = db::runs::list_for_batch(&self.pool, batch.batch_id).await?;
            let prior = latest_attempts(&runs)
                .into_iter()
                .find(|run| run.sequence_no == sequence_no)
                .cloned();
            if let Some(prior) = &prior {
                if prior.status == RunStatus::Succeeded {
                    continue; // finished on an earlier claim of this batch
                }
            }

            let mut attempt_no = prior.map(|run| run.attempt_no).unwrap_or(0);
            let mut succeeded = false;
            while attempt_no < batch.retry_limit.max(1) {
                attempt_no += 1;
                let Some(run) = db::runs::claim(
                    &self.pool,
                    batch.batch_id,
                    &batch.store_id,
                    sequence_no,
                    attempt_no,
                )
                .await?
                else {
                    // Another replica holds this attempt; leave the sequence
                    // to it.
                    return Ok(());
                };

                db::batches::heartbeat(&self.pool, batch.batch_id).await?;
                runlog
                    .append(
                        LogLevel::Info,
                        "loop",
                        "attempt_started",
                        Some(batch.batch_id),
                        Some(run.run_id),
                        Some(serde_json::json!({ "sequence_no": sequence_no, "attempt_no": attempt_no })),
                    )
                    .await;
                match self.run_loop(&batch, &run, &mut summary, &runlog).await {
                    Ok(metrics) => {
                        db::runs::finish(
                            &self.pool,
                            run.run_id,
                            RunStatus::Succeeded,
                            None,
                            Some(&metrics),
                        )
                        .await?;
                        runlog
                            .append(
                                LogLevel::Info,
                                "loop",
                                "attempt_succeeded",
                                Some(batch.batch_id),
                                Some(run.run_id),
                                None,
                            )
                            .await;
                        succeeded = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            run_id = %run.run_id,
                            sequence_no,
                            attempt_no,
                            "Loop attempt failed: {}",
                            e
                        );
                        db::runs::finish(
                            &self.pool,
                            run.run_id,
                            RunStatus::Failed,
                            Some(&e.to_string()),
                            None,
                        )
                        .await?;
                        runlog
                            .append(
                                LogLevel::Warn,
                                "loop",
                                "attempt_failed",
                                Some(batch.batch_id),
                                Some(run.run_id),
                                Some(serde_json::json!({ "reason": e.to_string() })),
                            )
                            .await;
                    }
                }
            }

            if succeeded {
                summary.loops_succeeded += 1;
            } else {
                summary.loops_failed += 1;
            }
            db::batches::update_summary(&self.pool, batch.batch_id, &summary).await?;
        }

        let terminal = if summary.loops_failed == 0 {
            BatchStatus::Completed
        } else if summary.loops_succeeded > 0 {
            BatchStatus::CompletedWithFailures
        } else {
            BatchStatus::Failed
        };
        let reason = (terminal == BatchStatus::Failed)
            .then(|| format!("All {} loop(s) failed", summary.loops_failed));

        let moved = db::batches::transition(
            &self.pool,
            batch.batch_id,
            BatchStatus::Running,
            terminal,
            reason.as_deref(),
        )
        .await?;
        if !moved {
            warn!(
                batch_id = %batch.batch_id,
                "Batch moved out of running externally; skipping finalization"
            );
        } else {
            info!(
                batch_id = %batch.batch_id,
                status = terminal.as_str(),
                loops_succeeded = summary.loops_succeeded,
                loops_failed = summary.loops_failed,
                proposals_applied = summary.proposals_applied,
                rollbacks = summary.rollbacks,
                "Batch finished"
            );
        }
        Ok(())
    }

    /// One loop iteration. Returns the run's metrics on success; any stage
    /// error or timeout fails this attempt only.
    async fn run_loop(
        &self,
        batch: &SelfImprovementBatch,
        run: &SelfImprovementRun,
        summary: &mut crate::orchestrator::state::BatchSummary,
        runlog: &RunLogWriter,
    ) -> Result<RunMetrics> {
        let store = TaxonomyStore::new(self.pool.clone(), batch.store_id.clone());
        let apply_manager = ApplyManager::new(store.clone());

        // Propose: mine new proposals from accumulated QA signal
        let proposed = self
            .stage("propose", self.propose(batch, run, &store))
            .await?;
        db::runs::heartbeat(&self.pool, run.run_id).await?;

        // Apply, gated by the most recent harness verdict. A manual-review
        // batch leaves everything proposed.
        let apply_report = if batch.auto_apply {
            let latest = db::harness_runs::latest(&self.pool, &batch.store_id).await?;
            let gate = latest
                .as_ref()
                .map(ApplyGate::Latest)
                .unwrap_or(ApplyGate::Bootstrap);
            self.stage(
                "apply",
                apply_manager.apply_learning_proposals(gate, batch.structural_cap),
            )
            .await?
        } else {
            info!(batch_id = %batch.batch_id, "auto_apply disabled; leaving proposals pending");
            ApplyReport::default()
        };
        db::runs::heartbeat(&self.pool, run.run_id).await?;

        // Classify the loop's subset under the (possibly just-changed) head
        let (assignments, metrics) = self
            .stage("classify", self.classify_subset(batch, run, &store))
            .await?;
        db::runs::set_metrics(&self.pool, run.run_id, &metrics).await?;
        db::runs::heartbeat(&self.pool, run.run_id).await?;

        // Aggregate quality: hotlist for the next loop's canary bias
        let corrections = db::corrections::list_for_store(&self.pool, &batch.store_id).await?;
        let hotlist = mine_hotlist(&run.run_id.to_string(), &assignments, &corrections);
        canary::store_hotlist(
            &self.pool,
            &batch.store_id,
            &self.config.output_dir,
            &hotlist,
        )
        .await?;
        db::canary_state::upsert(
            &self.pool,
            &batch.store_id,
            Some(&run.run_id.to_string()),
            None,
        )
        .await?;
        db::runs::heartbeat(&self.pool, run.run_id).await?;

        // Evaluate and keep or roll back this loop's applied changes
        let evaluator = HarnessEvaluator::new(
            self.pool.clone(),
            batch.store_id.clone(),
            self.config.harness,
        );
        match self
            .stage("evaluate", evaluator.evaluate(run.run_id, None, None))
            .await
        {
            Ok(result) if result.passed => {
                summary.proposals_applied += apply_report.applied;
                info!(
                    run_id = %run.run_id,
                    proposed,
                    applied = apply_report.applied,
                    "Loop passed evaluation"
                );
                Ok(metrics)
            }
            Ok(result) => {
                let reason = format!(
                    "evaluation failed: {}",
                    result.failed_metrics.join(", ")
                );
                for _ in 0..apply_report.applied {
                    apply_manager
                        .rollback(RollbackTarget::LatestApplied, &reason)
                        .await?;
                    summary.rollbacks += 1;
                }
                runlog
                    .append(
                        LogLevel::Warn,
                        "evaluate",
                        "changes_rolled_back",
                        Some(batch.batch_id),
                        Some(run.run_id),
                        Some(serde_json::json!({
                            "failed_metrics": result.failed_metrics,
                            "rolled_back": apply_report.applied,
                            "reason": reason,
                        })),
                    )
                    .await;
                Err(Error::Internal(format!(
                    "Evaluation failed ({}); rolled back {} change(s)",
                    result.failed_metrics.join(", "),
                    apply_report.applied
                )))
            }
            Err(Error::NotFound(_)) => {
                // First loop ever: no baseline run exists yet. Keep the
                // changes and let the next loop evaluate against this one.
                summary.proposals_applied += apply_report.applied;
                info!(run_id = %run.run_id, "No baseline available; keeping changes");
                Ok(metrics)
            }
            Err(e) => Err(e),
        }
    }

    async fn propose(
        &self,
        batch: &SelfImprovementBatch,
        run: &SelfImprovementRun,
        store: &TaxonomyStore,
    ) -> Result<usize> {
        let (_, doc) = store.load_current().await?;

        let corrections = db::corrections::list_for_store(&self.pool, &batch.store_id).await?;
        let corrected_pairs = self.pair_corrections(&batch.store_id, corrections).await?;

        let hotlist_path =
            canary::resolve_hotlist_path(&self.pool, &batch.store_id, &self.config.output_dir)
                .await?;
        let hotlist = match &hotlist_path {
            Some(path) => Some(canary::load_hotlist(path)?),
            None => None,
        };

        let failed_gate_metrics = db::harness_runs::latest(&self.pool, &batch.store_id)
            .await?
            .map(|result| result.failed_metrics)
            .unwrap_or_default();

        let proposals = generate_proposals(&GeneratorInput {
            store_id: &batch.store_id,
            batch_id: Some(batch.batch_id),
            run_id: Some(run.run_id),
            doc: &doc,
            corrections: &corrected_pairs,
            hotlist: hotlist.as_ref(),
            failed_gate_metrics: &failed_gate_metrics,
            max_proposals: self.config.max_proposals_per_run,
        });
        db::proposals::insert_all(&self.pool, &proposals).await?;
        info!(
            run_id = %run.run_id,
            proposals = proposals.len(),
            "Proposal generation complete"
        );
        Ok(proposals.len())
    }

    /// Join corrections with their product rows; corrections whose product
    /// is gone are dropped.
    async fn pair_corrections(
        &self,
        store_id: &str,
        corrections: Vec<QaCorrection>,
    ) -> Result<Vec<(QaCorrection, Product)>> {
        let skus: Vec<String> = corrections.iter().map(|c| c.sku.clone()).collect();
        let products = db::catalog::get_many(&self.pool, store_id, &skus).await?;
        let by_sku: HashMap<String, Product> =
            products.into_iter().map(|p| (p.sku.clone(), p)).collect();

        Ok(corrections
            .into_iter()
            .filter_map(|correction| {
                by_sku
                    .get(&correction.sku)
                    .cloned()
                    .map(|product| (correction, product))
            })
            .collect())
    }

    async fn classify_subset(
        &self,
        batch: &SelfImprovementBatch,
        run: &SelfImprovementRun,
        store: &TaxonomyStore,
    ) -> Result<(Vec<crate::models::CategoryAssignment>, RunMetrics)> {
        let products = match batch.loop_type {
            LoopType::Canary => {
                let build = canary::build_subset(
                    &self.pool,
                    &batch.store_id,
                    &self.config.output_dir,
                    &self.config.canary,
                    &run.run_id.to_string(),
                )
                .await?;
                build.products
            }
            LoopType::Full => db::catalog::list_for_store(&self.pool, &batch.store_id).await?,
        };

        let labels: HashMap<String, String> = products
            .iter()
            .filter_map(|p| p.label.clone().map(|label| (p.sku.clone(), label)))
            .collect();

        let (_, doc) = store.load_current().await?;
        let fallback_slug = doc.fallback_slug.clone();
        let engine = DecisionEngine::new(self.config.decision);
        let assignments = engine
            .classify_batch(
                products,
                Arc::new(doc),
                self.embedder.as_ref(),
                self.completer.as_ref(),
                self.config.classify_concurrency,
            )
            .await?;
        db::assignments::insert_all(&self.pool, run.run_id, &assignments).await?;

        let metrics = compute_run_metrics(&assignments, &labels, &fallback_slug);
        Ok((assignments, metrics))
    }

    async fn stage<T, F>(&self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(Duration::from_secs(self.config.stage_timeout_secs), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Internal(format!(
                "Stage '{}' timed out after {}s",
                name, self.config.stage_timeout_secs
            ))),
        }
    }
}
