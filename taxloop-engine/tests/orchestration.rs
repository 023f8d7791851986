//! Orchestrator integration tests: claims, cancellation, stale recovery,
//! and a full worker pass over a small catalog.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use taxloop_common::config::EngineConfig;
use taxloop_common::db::init::init_memory_database;
use taxloop_engine::db;
use taxloop_engine::models::Product;
use taxloop_engine::orchestrator::state::{BatchStatus, LoopType, RunStatus};
use taxloop_engine::orchestrator::{self, sweep_once, Worker};
use taxloop_engine::services::{NullCompleter, NullEmbedder};
use taxloop_engine::taxonomy::{CategoryDef, CategoryRule, TaxonomyDoc, TaxonomyStore};

const STORE: &str = "store-1";

async fn pool() -> SqlitePool {
    init_memory_database().await.unwrap()
}

async fn enqueue(pool: &SqlitePool) -> uuid::Uuid {
    orchestrator::enqueue_batch(pool, STORE, LoopType::Canary, 2, 2, 1, true)
        .await
        .unwrap()
        .batch_id
}

#[tokio::test]
async fn batch_claim_is_exclusive_and_ordered() {
    let pool = pool().await;
    let first = enqueue(&pool).await;
    let second = enqueue(&pool).await;

    let claimed = db::batches::claim_next_queued(&pool).await.unwrap().unwrap();
    assert_eq!(claimed.batch_id, first);
    assert_eq!(claimed.status, BatchStatus::Running);

    let claimed = db::batches::claim_next_queued(&pool).await.unwrap().unwrap();
    assert_eq!(claimed.batch_id, second);

    assert!(db::batches::claim_next_queued(&pool).await.unwrap().is_none());
}

#[tokio::test]
async fn run_claim_is_unique_per_attempt() {
    let pool = pool().await;
    let batch_id = enqueue(&pool).await;

    let run = db::runs::claim(&pool, batch_id, STORE, 0, 1).await.unwrap();
    assert!(run.is_some());

    // Same (batch, sequence, attempt): the second claimer loses
    let run = db::runs::claim(&pool, batch_id, STORE, 0, 1).await.unwrap();
    assert!(run.is_none());

    // Next attempt is a fresh claim
    let run = db::runs::claim(&pool, batch_id, STORE, 0, 2).await.unwrap();
    assert!(run.is_some());
}

#[tokio::test]
async fn cancel_terminal_batches_is_rejected() {
    let pool = pool().await;
    let batch_id = enqueue(&pool).await;

    assert!(orchestrator::cancel_batch(&pool, batch_id).await.unwrap());
    let batch = db::batches::get(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);

    // Already terminal
    assert!(!orchestrator::cancel_batch(&pool, batch_id).await.unwrap());
}

#[tokio::test]
async fn stale_sweep_requeues_batches_and_fails_runs() {
    let pool = pool().await;
    let batch_id = enqueue(&pool).await;
    db::batches::claim_next_queued(&pool).await.unwrap().unwrap();
    let run = db::runs::claim(&pool, batch_id, STORE, 0, 1)
        .await
        .unwrap()
        .unwrap();

    // Fresh work is left alone
    let report = sweep_once(&pool, 900).await.unwrap();
    assert_eq!(report.runs_failed, 0);
    assert_eq!(report.batches_requeued, 0);

    // Backdate the heartbeats past the stale cutoff
    sqlx::query("UPDATE batches SET updated_at = '2000-01-01T00:00:00+00:00'")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE runs SET updated_at = '2000-01-01T00:00:00+00:00'")
        .execute(&pool)
        .await
        .unwrap();

    let report = sweep_once(&pool, 900).await.unwrap();
    assert_eq!(report.runs_failed, 1);
    assert_eq!(report.batches_requeued, 1);

    let batch = db::batches::get(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Queued);
    let run = db::runs::get(&pool, run.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    // The requeued batch is claimable again
    assert!(db::batches::claim_next_queued(&pool).await.unwrap().is_some());
}

fn taxonomy() -> TaxonomyDoc {
    TaxonomyDoc {
        categories: vec![
            CategoryDef {
                slug: "pens".into(),
                name: "Pens".into(),
                description: String::new(),
                synonyms: vec![],
                attribute_policies: vec![],
                prototype_embedding: vec![],
            },
            CategoryDef {
                slug: "notebooks".into(),
                name: "Notebooks".into(),
                description: String::new(),
                synonyms: vec![],
                attribute_policies: vec![],
                prototype_embedding: vec![],
            },
            CategoryDef {
                slug: "other".into(),
                name: "Other".into(),
                description: String::new(),
                synonyms: vec![],
                attribute_policies: vec![],
                prototype_embedding: vec![],
            },
        ],
        rules: vec![
            CategoryRule {
                slug: "pens".into(),
                include_any: vec!["pen".into(), "ballpoint".into()],
                ..Default::default()
            },
            CategoryRule {
                slug: "notebooks".into(),
                include_any: vec!["notebook".into(), "journal".into()],
                ..Default::default()
            },
        ],
        fallback_slug: "other".into(),
    }
}

fn labeled_catalog(n: usize) -> Vec<Product> {
    (0..n)
        .map(|i| {
            let (title, label) = if i % 2 == 0 {
                (format!("ballpoint pen {}", i), "pens")
            } else {
                (format!("dotted journal notebook {}", i), "notebooks")
            };
            Product {
                sku: format!("sku-{:04}", i),
                title,
                description: String::new(),
                brand: None,
                attributes: HashMap::new(),
                label: Some(label.into()),
            }
        })
        .collect()
}

#[tokio::test]
async fn worker_drives_batch_to_completion() {
    let pool = pool().await;
    let out = tempfile::tempdir().unwrap();

    TaxonomyStore::new(pool.clone(), STORE)
        .initialize(&taxonomy())
        .await
        .unwrap();
    db::catalog::upsert_all(&pool, STORE, &labeled_catalog(60))
        .await
        .unwrap();

    let mut config = EngineConfig::default();
    config.output_dir = out.path().to_path_buf();
    config.canary.sample_size = 40;

    let batch_id = orchestrator::enqueue_batch(&pool, STORE, LoopType::Canary, 1, 1, 1, true)
        .await
        .unwrap()
        .batch_id;
    let claimed = db::batches::claim_next_queued(&pool).await.unwrap().unwrap();
    assert_eq!(claimed.batch_id, batch_id);

    let worker = Worker::new(
        pool.clone(),
        config,
        Arc::new(NullCompleter),
        Arc::new(NullEmbedder),
    );
    worker.run_batch(claimed).await.unwrap();

    let batch = db::batches::get(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.summary.loops_succeeded, 1);
    assert_eq!(batch.summary.loops_failed, 0);

    let runs = db::runs::list_for_batch(&pool, batch_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Succeeded);

    // Clean lexical matches on a fully labeled subset classify perfectly
    let metrics = runs[0].metrics.as_ref().unwrap();
    assert_eq!(metrics.total, 40);
    assert_eq!(metrics.labeled, 40);
    assert!((metrics.accuracy_l1 - 1.0).abs() < 1e-9);

    // The loop left a hotlist behind for the next canary bias
    let state = db::canary_state::get(&pool, STORE).await.unwrap().unwrap();
    assert_eq!(state.last_run_id.as_deref(), Some(runs[0].run_id.to_string().as_str()));
    assert!(state.last_hotlist_path.is_some());

    let assignments = db::assignments::list_for_run(&pool, runs[0].run_id)
        .await
        .unwrap();
    assert_eq!(assignments.len(), 40);
}

#[tokio::test]
async fn cancelled_batch_stops_at_loop_boundary() {
    let pool = pool().await;
    let out = tempfile::tempdir().unwrap();

    TaxonomyStore::new(pool.clone(), STORE)
        .initialize(&taxonomy())
        .await
        .unwrap();
    db::catalog::upsert_all(&pool, STORE, &labeled_catalog(60))
        .await
        .unwrap();

    let mut config = EngineConfig::default();
    config.output_dir = out.path().to_path_buf();

    let batch_id = orchestrator::enqueue_batch(&pool, STORE, LoopType::Canary, 3, 1, 1, true)
        .await
        .unwrap()
        .batch_id;
    let claimed = db::batches::claim_next_queued(&pool).await.unwrap().unwrap();
    // Cancelled before the worker starts: no loop runs at all
    orchestrator::cancel_batch(&pool, batch_id).await.unwrap();

    let worker = Worker::new(
        pool.clone(),
        config,
        Arc::new(NullCompleter),
        Arc::new(NullEmbedder),
    );
    worker.run_batch(claimed).await.unwrap();

    let batch = db::batches::get(&pool, batch_id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert!(db::runs::list_for_batch(&pool, batch_id).await.unwrap().is_empty());
}
