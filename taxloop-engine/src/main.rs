//! taxloop - Classification and Self-Improvement Engine CLI
//!
//! One binary, subcommand per operation: a long-running worker (poll loop
//! plus stale sweep), batch management (enqueue/cancel/status), one-shot
//! evaluation and rollback, canary subset construction, and one-shot
//! catalog classification.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use taxloop_common::config::EngineConfig;
use taxloop_common::db::init_database;
use taxloop_common::runlog::RunLogWriter;

use taxloop_engine::apply::{ApplyManager, RollbackTarget};
use taxloop_engine::canary;
use taxloop_engine::db;
use taxloop_engine::engine::DecisionEngine;
use taxloop_engine::harness::HarnessEvaluator;
use taxloop_engine::models::{read_products_jsonl, QaCorrection};
use taxloop_engine::orchestrator::{self, state, Worker};
use taxloop_engine::quality::compute_run_metrics;
use taxloop_engine::services::{
    Completer, Embedder, HttpCompleter, HttpEmbedder, NullCompleter, NullEmbedder, RetryPolicy,
};
use taxloop_engine::taxonomy::{TaxonomyDoc, TaxonomyStore};

#[derive(Parser, Debug)]
#[command(name = "taxloop")]
#[command(about = "Product classification engine with a safety-gated self-improvement loop")]
#[command(version)]
struct Args {
    /// Config file path (TOML); defaults to ~/.config/taxloop/taxloop.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the self-improvement worker: batch poll loop plus stale sweep
    Worker,
    /// Enqueue a self-improvement batch
    Enqueue {
        #[arg(long)]
        store: String,
        /// Loop type: canary or full
        #[arg(long, default_value = "canary")]
        loop_type: String,
        /// Number of loop iterations
        #[arg(long, default_value = "1")]
        loops: u32,
        /// Retry budget per loop iteration
        #[arg(long, default_value = "2")]
        retry_limit: u32,
        /// Leave generated proposals pending instead of auto-applying
        #[arg(long)]
        no_auto_apply: bool,
    },
    /// Cancel a batch (queued: immediate; running: at the next loop boundary)
    Cancel {
        #[arg(long)]
        batch: Uuid,
    },
    /// Show all batches, or one batch with its runs
    Status {
        #[arg(long)]
        batch: Option<Uuid>,
    },
    /// Evaluate a candidate run against a baseline and the benchmark
    Evaluate {
        #[arg(long)]
        store: String,
        #[arg(long)]
        candidate: Uuid,
        /// Defaults to the most recent succeeded run
        #[arg(long)]
        baseline: Option<Uuid>,
        /// Defaults to the latest snapshot (rebuilt when undersized)
        #[arg(long)]
        snapshot: Option<Uuid>,
    },
    /// Roll back an applied change (defaults to the latest applied)
    Rollback {
        #[arg(long)]
        store: String,
        #[arg(long)]
        change: Option<Uuid>,
        /// Audit reason, recorded in the change metadata
        #[arg(long)]
        reason: String,
    },
    /// Build a canary subset file and selection report
    BuildSubset {
        #[arg(long)]
        store: String,
        /// Optional JSON-lines catalog to load (upsert) before selecting
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        sample_size: Option<usize>,
        #[arg(long)]
        fixed_ratio: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// One-shot classification of the full catalog, recorded as a run
    Classify {
        #[arg(long)]
        store: String,
    },
    /// Load (upsert) catalog products from a JSON-lines file
    LoadCatalog {
        #[arg(long)]
        store: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Seed a store's initial taxonomy document from a JSON file
    InitTaxonomy {
        #[arg(long)]
        store: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Record a QA correction for a classified product
    Correct {
        #[arg(long)]
        store: String,
        #[arg(long)]
        sku: String,
        #[arg(long)]
        predicted: String,
        #[arg(long)]
        corrected: String,
        #[arg(long)]
        run: Option<Uuid>,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taxloop=info,taxloop_engine=info,taxloop_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let pool = init_database(&config.database_path)
        .await
        .context("Failed to open database")?;

    match args.command {
        Command::Worker => run_worker(pool, config).await,
        Command::Enqueue {
            store,
            loop_type,
            loops,
            retry_limit,
            no_auto_apply,
        } => {
            let loop_type = state::LoopType::parse(&loop_type)
                .with_context(|| format!("Unknown loop type: {}", loop_type))?;
            let batch = orchestrator::enqueue_batch(
                &pool,
                &store,
                loop_type,
                loops,
                retry_limit,
                config.max_structural_changes_per_loop,
                !no_auto_apply,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(())
        }
        Command::Cancel { batch } => {
            let cancelled = orchestrator::cancel_batch(&pool, batch).await?;
            if cancelled {
                println!("Batch {} cancelled", batch);
            } else {
                println!("Batch {} is already terminal", batch);
            }
            Ok(())
        }
        Command::Status { batch } => show_status(&pool, batch).await,
        Command::Evaluate {
            store,
            candidate,
            baseline,
            snapshot,
        } => {
            let evaluator = HarnessEvaluator::new(pool, store, config.harness);
            let result = evaluator.evaluate(candidate, baseline, snapshot).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Rollback {
            store,
            change,
            reason,
        } => {
            let manager = ApplyManager::new(TaxonomyStore::new(pool, store));
            let target = change
                .map(RollbackTarget::Change)
                .unwrap_or(RollbackTarget::LatestApplied);
            let rolled_back = manager.rollback(target, &reason).await?;
            println!("{}", serde_json::to_string_pretty(&rolled_back)?);
            Ok(())
        }
        Command::BuildSubset {
            store,
            input,
            sample_size,
            fixed_ratio,
            seed,
        } => {
            if let Some(path) = input {
                let products = read_products_jsonl(&path)?;
                db::catalog::upsert_all(&pool, &store, &products).await?;
                println!("Loaded {} products into store {}", products.len(), store);
            }
            let mut canary_config = config.canary;
            if let Some(size) = sample_size {
                canary_config.sample_size = size;
            }
            if let Some(ratio) = fixed_ratio {
                canary_config.fixed_ratio = ratio;
            }
            if let Some(seed) = seed {
                canary_config.seed = seed;
            }
            let tag = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
            let build = canary::build_subset(
                &pool,
                &store,
                &config.output_dir,
                &canary_config,
                &tag,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&build.report)?);
            println!("Subset: {}", build.subset_path.display());
            println!("Report: {}", build.report_path.display());
            Ok(())
        }
        Command::Classify { store } => classify_once(&pool, &config, &store).await,
        Command::LoadCatalog { store, file } => {
            let products = read_products_jsonl(&file)?;
            db::catalog::upsert_all(&pool, &store, &products).await?;
            println!("Loaded {} products into store {}", products.len(), store);
            Ok(())
        }
        Command::InitTaxonomy { store, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Cannot read {}", file.display()))?;
            let doc: TaxonomyDoc = serde_json::from_str(&content)
                .with_context(|| format!("Invalid taxonomy document: {}", file.display()))?;
            let version = TaxonomyStore::new(pool, store).initialize(&doc).await?;
            println!("Initialized taxonomy at version {}", version);
            Ok(())
        }
        Command::Correct {
            store,
            sku,
            predicted,
            corrected,
            run,
            notes,
        } => {
            let correction = QaCorrection {
                correction_id: Uuid::new_v4(),
                store_id: store,
                run_id: run,
                sku,
                predicted_slug: predicted,
                corrected_slug: corrected,
                notes,
                created_at: chrono::Utc::now(),
            };
            db::corrections::insert(&pool, &correction).await?;
            println!("Recorded correction {}", correction.correction_id);
            Ok(())
        }
    }
}

fn build_services(config: &EngineConfig) -> (Arc<dyn Completer>, Arc<dyn Embedder>) {
    let retry = RetryPolicy::from(config.retry);
    let completer: Arc<dyn Completer> = match &config.completion_url {
        Some(url) => Arc::new(HttpCompleter::new(url.clone(), retry)),
        None => Arc::new(NullCompleter),
    };
    let embedder: Arc<dyn Embedder> = match &config.embedding_url {
        Some(url) => Arc::new(HttpEmbedder::new(url.clone(), retry)),
        None => Arc::new(NullEmbedder),
    };
    (completer, embedder)
}

async fn run_worker(pool: SqlitePool, config: EngineConfig) -> Result<()> {
    let (completer, embedder) = build_services(&config);
    let worker = Worker::new(pool.clone(), config.clone(), completer, embedder);

    let sweeper = tokio::spawn(orchestrator::run_sweeper(
        pool.clone(),
        config.sweep_interval_secs,
        config.stale_timeout_secs,
    ));
    let retention = tokio::spawn(run_log_retention(pool.clone(), config.runlog_retention_days));

    tokio::select! {
        result = worker.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }
    sweeper.abort();
    retention.abort();
    Ok(())
}

/// Daily run-log retention sweep. The writer's store scoping does not apply
/// to expiry, which trims the whole table.
async fn run_log_retention(pool: SqlitePool, retention_days: i64) {
    let writer = RunLogWriter::new(pool, "retention");
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
    loop {
        ticker.tick().await;
        match writer.expire_older_than(retention_days).await {
            Ok(deleted) if deleted > 0 => info!(deleted, "Expired run-log rows"),
            Ok(_) => {}
            Err(e) => tracing::warn!("Run-log retention sweep failed: {}", e),
        }
    }
}

async fn show_status(pool: &SqlitePool, batch_id: Option<Uuid>) -> Result<()> {
    match batch_id {
        Some(batch_id) => {
            let batch = db::batches::get(pool, batch_id)
                .await?
                .with_context(|| format!("Batch not found: {}", batch_id))?;
            let runs = db::runs::list_for_batch(pool, batch_id).await?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            for run in runs {
                println!("{}", serde_json::to_string_pretty(&run)?);
            }
        }
        None => {
            for batch in db::batches::list_all(pool).await? {
                println!(
                    "{}  {}  {}  loops={} ok={} failed={} applied={} rollbacks={}",
                    batch.batch_id,
                    batch.loop_type.as_str(),
                    batch.status.as_str(),
                    batch.loop_count,
                    batch.summary.loops_succeeded,
                    batch.summary.loops_failed,
                    batch.summary.proposals_applied,
                    batch.summary.rollbacks,
                );
            }
        }
    }
    Ok(())
}

/// One-shot full-catalog classification. Recorded as a single-loop batch so
/// the run can serve as a harness baseline or candidate later.
async fn classify_once(pool: &SqlitePool, config: &EngineConfig, store_id: &str) -> Result<()> {
    let products = db::catalog::list_for_store(pool, store_id).await?;
    if products.is_empty() {
        anyhow::bail!("No catalog products loaded for store {}", store_id);
    }

    let batch = orchestrator::enqueue_batch(
        pool,
        store_id,
        state::LoopType::Full,
        1,
        1,
        0,
        false,
    )
    .await?;
    db::batches::transition(
        pool,
        batch.batch_id,
        state::BatchStatus::Queued,
        state::BatchStatus::Running,
        None,
    )
    .await?;
    let run = db::runs::claim(pool, batch.batch_id, store_id, 0, 1)
        .await?
        .context("Failed to claim classification run")?;

    let store = TaxonomyStore::new(pool.clone(), store_id);
    let (version, doc) = store.load_current().await?;
    let fallback_slug = doc.fallback_slug.clone();
    let labels: std::collections::HashMap<String, String> = products
        .iter()
        .filter_map(|p| p.label.clone().map(|label| (p.sku.clone(), label)))
        .collect();

    let (completer, embedder) = build_services(config);
    let engine = DecisionEngine::new(config.decision);
    let assignments = engine
        .classify_batch(
            products,
            Arc::new(doc),
            embedder.as_ref(),
            completer.as_ref(),
            config.classify_concurrency,
        )
        .await?;
    db::assignments::insert_all(pool, run.run_id, &assignments).await?;

    let metrics = compute_run_metrics(&assignments, &labels, &fallback_slug);
    db::runs::finish(
        pool,
        run.run_id,
        state::RunStatus::Succeeded,
        None,
        Some(&metrics),
    )
    .await?;
    db::batches::transition(
        pool,
        batch.batch_id,
        state::BatchStatus::Running,
        state::BatchStatus::Completed,
        None,
    )
    .await?;

    info!(run_id = %run.run_id, taxonomy_version = %version, "Classification run complete");
    println!("run_id: {}", run.run_id);
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
