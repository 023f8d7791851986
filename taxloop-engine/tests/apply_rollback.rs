//! Apply/rollback manager integration tests against an in-memory store.

use chrono::Utc;
use sqlx::SqlitePool;
use taxloop_common::db::init::init_memory_database;
use taxloop_common::Error;
use taxloop_engine::apply::{ApplyGate, ApplyManager, ApplyReport, RollbackTarget};
use taxloop_engine::db;
use taxloop_engine::models::{
    HarnessResult, Proposal, ProposalKind, ProposalPayload, ProposalStatus, RuleAction, RuleField,
};
use taxloop_engine::taxonomy::{CategoryDef, CategoryRule, TaxonomyDoc, TaxonomyStore};
use uuid::Uuid;

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
                slug: "markers".into(),
                name: "Markers".into(),
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
        rules: vec![CategoryRule {
            slug: "pens".into(),
            include_any: vec!["pen".into()],
            ..Default::default()
        }],
        fallback_slug: "other".into(),
    }
}

async fn setup() -> (SqlitePool, TaxonomyStore, ApplyManager) {
    let pool = init_memory_database().await.unwrap();
    let store = TaxonomyStore::new(pool.clone(), "store-1");
    store.initialize(&taxonomy()).await.unwrap();
    let manager = ApplyManager::new(store.clone());
    (pool, store, manager)
}

fn term_add_proposal(target_slug: &str, term: &str) -> Proposal {
    Proposal {
        proposal_id: Uuid::new_v4(),
        store_id: "store-1".into(),
        batch_id: None,
        run_id: None,
        kind: ProposalKind::RuleTermAdd,
        status: ProposalStatus::Proposed,
        confidence: 0.8,
        expected_impact: 3.0,
        payload: ProposalPayload {
            target_slug: target_slug.into(),
            field: RuleField::IncludeAny,
            action: RuleAction::Add,
            value: serde_json::json!(term),
            reason: "test".into(),
        },
        provenance: "test".into(),
        created_at: Utc::now(),
    }
}

fn structural_proposal(impact: f64) -> Proposal {
    let mut proposal = term_add_proposal("pens", "unused");
    proposal.kind = ProposalKind::TaxonomyMerge;
    proposal.expected_impact = impact;
    proposal.confidence = 0.3;
    proposal
}

fn failed_gate() -> HarnessResult {
    HarnessResult {
        harness_run_id: Uuid::new_v4(),
        store_id: "store-1".into(),
        candidate_run_id: Uuid::new_v4(),
        baseline_run_id: Uuid::new_v4(),
        snapshot_id: Uuid::new_v4(),
        passed: false,
        scores: Default::default(),
        failed_metrics: vec!["accuracy_l1".into()],
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn apply_then_rollback_restores_byte_identical_content() {
    let (pool, store, manager) = setup().await;

    let (version_before, _) = store.load_current().await.unwrap();
    let content_before = store.version_content(&version_before).await.unwrap();

    let proposal = term_add_proposal("pens", "ballpoint");
    db::proposals::insert(&pool, &proposal).await.unwrap();
    let change = manager.apply_proposal(&proposal).await.unwrap();

    let (head_after_apply, doc_after_apply) = store.load_current().await.unwrap();
    assert_eq!(head_after_apply, change.version_after);
    assert_ne!(head_after_apply, version_before);
    assert!(doc_after_apply
        .rule("pens")
        .unwrap()
        .include_any
        .iter()
        .any(|t| t == "ballpoint"));
    let stored = db::proposals::get(&pool, proposal.proposal_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ProposalStatus::Applied);

    let rolled_back = manager
        .rollback(RollbackTarget::Change(change.change_id), "operator request")
        .await
        .unwrap();
    assert!(rolled_back.rolled_back_at.is_some());
    // The audit reason lands in the change metadata
    assert_eq!(
        rolled_back.metadata["rollback_reason"],
        serde_json::json!("operator request")
    );

    let (head_after_rollback, _) = store.load_current().await.unwrap();
    assert_eq!(head_after_rollback, version_before);
    let content_after = store.version_content(&head_after_rollback).await.unwrap();
    assert_eq!(content_before, content_after);

    let stored = db::proposals::get(&pool, proposal.proposal_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ProposalStatus::RolledBack);

    // A second rollback of the same change is a conflict, never a no-op
    let again = manager
        .rollback(RollbackTarget::Change(change.change_id), "operator request")
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn stale_parent_version_is_rejected() {
    let (pool, store, manager) = setup().await;
    let (genesis_head, _) = store.load_current().await.unwrap();

    let first = term_add_proposal("pens", "fountain");
    db::proposals::insert(&pool, &first).await.unwrap();
    manager.apply_proposal(&first).await.unwrap();

    // Writing against the pre-apply head must fail the compare-and-set
    let doc_json = serde_json::to_string(&taxonomy()).unwrap();
    let mut tx = pool.begin().await.unwrap();
    let result = store
        .put_version_tx(&mut tx, &genesis_head, "stale-proposal", &doc_json)
        .await;
    assert!(matches!(result, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn structural_cap_limits_one_loop() {
    let (pool, _store, manager) = setup().await;

    // Impact ordering puts both structural probes ahead of the term add
    db::proposals::insert(&pool, &structural_proposal(9.0))
        .await
        .unwrap();
    db::proposals::insert(&pool, &structural_proposal(8.0))
        .await
        .unwrap();
    db::proposals::insert(&pool, &term_add_proposal("pens", "gel"))
        .await
        .unwrap();

    let report = manager
        .apply_learning_proposals(ApplyGate::Bootstrap, 1)
        .await
        .unwrap();
    assert_eq!(report.applied, 2); // one structural + the term add
    assert_eq!(report.skipped_structural, 1);
    assert_eq!(report.rejected, 0);

    // The over-cap structural proposal stays proposed for a later loop
    let pending = db::proposals::list_pending(&pool, "store-1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].kind.is_structural());
}

#[tokio::test]
async fn failed_gate_short_circuits_apply_pass() {
    let (pool, store, manager) = setup().await;
    let (head_before, _) = store.load_current().await.unwrap();

    db::proposals::insert(&pool, &term_add_proposal("pens", "stylus"))
        .await
        .unwrap();

    let gate = failed_gate();
    let report = manager
        .apply_learning_proposals(ApplyGate::Latest(&gate), 5)
        .await
        .unwrap();
    assert_eq!(report, ApplyReport::default());

    // Nothing moved: proposal pending, head untouched
    let pending = db::proposals::list_pending(&pool, "store-1").await.unwrap();
    assert_eq!(pending.len(), 1);
    let (head_after, _) = store.load_current().await.unwrap();
    assert_eq!(head_after, head_before);
}

#[tokio::test]
async fn passing_gate_allows_apply_pass() {
    let (pool, _store, manager) = setup().await;

    db::proposals::insert(&pool, &term_add_proposal("pens", "quill"))
        .await
        .unwrap();

    let mut gate = failed_gate();
    gate.passed = true;
    gate.failed_metrics.clear();

    let report = manager
        .apply_learning_proposals(ApplyGate::Latest(&gate), 1)
        .await
        .unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.rejected, 0);
}

#[tokio::test]
async fn invalid_proposal_is_rejected_alone() {
    let (pool, _store, manager) = setup().await;

    db::proposals::insert(&pool, &term_add_proposal("ghost-slug", "pen"))
        .await
        .unwrap();
    db::proposals::insert(&pool, &term_add_proposal("pens", "rollerball"))
        .await
        .unwrap();

    let report = manager
        .apply_learning_proposals(ApplyGate::Bootstrap, 1)
        .await
        .unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.rejected, 1);

    let pending = db::proposals::list_pending(&pool, "store-1").await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn structural_apply_chains_identical_document() {
    let (pool, store, manager) = setup().await;
    let (version_before, _) = store.load_current().await.unwrap();
    let content_before = store.version_content(&version_before).await.unwrap();

    let proposal = structural_proposal(5.0);
    db::proposals::insert(&pool, &proposal).await.unwrap();
    let change = manager.apply_proposal(&proposal).await.unwrap();

    // New version, same content: the change is reversible like any other
    assert_ne!(change.version_after, version_before);
    let content_after = store.version_content(&change.version_after).await.unwrap();
    assert_eq!(content_before, content_after);
    assert_eq!(change.metadata["synthetic"], serde_json::json!(true));
}
