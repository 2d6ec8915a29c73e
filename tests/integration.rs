// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for index-sync.
//!
//! In-memory tests run by default. Tests against a real cluster use
//! testcontainers and are ignored.
//!
//! # Running Tests
//! ```bash
//! # Run all integration tests (requires Docker)
//! cargo test --test integration -- --ignored
//! ```
//!
//! # Test Organization
//! - `sync_*` - merge-diff runs end to end
//! - `copy_*` - producer/worker runs
//! - `es_*` - against Elasticsearch in a container

mod common;

use common::*;
use index_sync::config::{SyncConfig, SyncMode};
use index_sync::diff::{DiffEngine, DiffState};
use index_sync::store::memory::MemoryStore;
use index_sync::store::{ScrollRequest, StoreAdapter};
use index_sync::{BulkPipeline, ClusterConfig, IngestTransform, Migrator, RunState};
use serde_json::json;
use std::sync::Arc;
use testcontainers::clients::Cli;

// =============================================================================
// Sync mode
// =============================================================================

#[tokio::test]
async fn sync_applies_minimal_change_set() {
    let source = store_with(&[("id1", json!({"a": 1})), ("id2", json!({"a": 2})), ("id3", json!({"a": 3}))]).await;
    let target = store_with(&[("id1", json!({"a": 1})), ("id2", json!({"a": 99})), ("id4", json!({"a": 4}))]).await;

    let migrator = Migrator::new(memory_config(SyncMode::Sync, 10))
        .unwrap()
        .with_stores(source.clone(), target.clone());
    let report = migrator.run().await.unwrap();

    assert_eq!(report.upserts, 2);
    assert_eq!(report.deletes, 1);
    assert_eq!(report.diff.as_ref().map(|d| d.unchanged), Some(1));
    assert_eq!(contents(&target).await, contents(&source).await);
    // One bulk request carried all three changes.
    assert_eq!(target.bulk_calls().await, 1);
}

#[tokio::test]
async fn sync_unreadable_target_becomes_full_reinsert() {
    let source = Arc::new(MemoryStore::new());
    for i in 0..25 {
        source.insert(INDEX, "doc", &format!("doc-{:02}", i), json!({ "n": i })).await;
    }
    let target = Arc::new(MemoryStore::new());
    target.fail_scroll_open(true);

    let report = Migrator::new(memory_config(SyncMode::Sync, 20))
        .unwrap()
        .with_stores(source.clone(), target.clone())
        .run()
        .await
        .unwrap();

    let diff = report.diff.unwrap();
    assert!(diff.target_fallback);
    assert_eq!(diff.source_pages, 2);
    assert_eq!(report.upserts, 25);
    assert_eq!(report.deletes, 0);
    assert_eq!(target.count(INDEX).await, 25);
}

#[tokio::test]
async fn sync_deletes_everything_when_source_empty() {
    let source = store_with(&[]).await;
    let target = store_with(&[("a", json!({})), ("b", json!({})), ("c", json!({}))]).await;

    let report = Migrator::new(memory_config(SyncMode::Sync, 2))
        .unwrap()
        .with_stores(source, target.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.deletes, 3);
    assert_eq!(target.count(INDEX).await, 0);
}

#[tokio::test]
async fn sync_preserves_routing_and_old_type_on_six() {
    let source = Arc::new(MemoryStore::new());
    source
        .insert_raw_hit(
            INDEX,
            "r1",
            json!({"_index": INDEX, "_type": "product", "_id": "r1", "_routing": "shard-a", "_source": {"v": 1}}),
        )
        .await;
    let target = Arc::new(MemoryStore::new());

    Migrator::new(memory_config(SyncMode::Sync, 10))
        .unwrap()
        .with_stores(source, target.clone())
        .run()
        .await
        .unwrap();

    let doc = target.get(INDEX, "r1").await.unwrap();
    assert_eq!(doc.doc_type, "product");
    assert_eq!(doc.routing.as_deref(), Some("shard-a"));
}

#[tokio::test]
async fn sync_diff_state_reaches_done() {
    let source = store_with(&[("x", json!({}))]).await;
    let target = store_with(&[]).await;
    let pipeline = BulkPipeline::new(target.clone(), 1 << 20, "sync");
    let mut engine = DiffEngine::new(
        source,
        target,
        ScrollRequest::new(INDEX, 5),
        ScrollRequest::new(INDEX, 5),
        IngestTransform::passthrough(),
        pipeline,
    );
    assert_eq!(engine.state(), DiffState::Init);
    engine.run().await.unwrap();
    assert_eq!(engine.state(), DiffState::Done);
}

// =============================================================================
// Copy mode
// =============================================================================

#[tokio::test]
async fn copy_writes_every_document_and_restores_settings() {
    let source = Arc::new(MemoryStore::new());
    for i in 0..100 {
        source.insert(INDEX, "doc", &format!("{:03}", i), json!({ "n": i })).await;
    }
    let target = Arc::new(MemoryStore::new());
    target
        .update_index_settings(INDEX, json!({ "index": { "refresh_interval": "10s" } }))
        .await
        .unwrap();

    let mut config = memory_config(SyncMode::Copy, 9);
    config.bulk.workers = 4;
    config.scan.slices = 3;
    let migrator = Migrator::new(config).unwrap().with_stores(source.clone(), target.clone());
    let mut states = migrator.state_receiver();

    let report = migrator.run().await.unwrap();
    assert_eq!(report.source_docs, 100);
    assert_eq!(report.items_written, 100);
    assert_eq!(report.workers.len(), 4);
    assert_eq!(contents(&target).await, contents(&source).await);
    assert_eq!(*states.borrow_and_update(), RunState::Completed);

    let settings = target.index_settings(INDEX).await.unwrap();
    assert_eq!(settings[INDEX]["settings"]["index"]["refresh_interval"], json!("10s"));
}

#[tokio::test]
async fn copy_renames_fields_and_redirects_index() {
    let source = store_with(&[("a", json!({"old": 1, "keep": true}))]).await;
    let target = Arc::new(MemoryStore::new());

    let mut config = memory_config(SyncMode::Copy, 10);
    config.transform.target_index = Some("archive".into());
    config.transform.rename_fields = Some("old:new".into());
    Migrator::new(config)
        .unwrap()
        .with_stores(source, target.clone())
        .run()
        .await
        .unwrap();

    let doc = target.get("archive", "a").await.unwrap();
    assert_eq!(doc.source.get("new"), Some(&json!(1)));
    assert!(doc.source.get("old").is_none());
    assert_eq!(target.count(INDEX).await, 0);
}

#[tokio::test]
async fn copy_then_sync_is_noop() {
    let source = Arc::new(MemoryStore::new());
    for i in 0..30 {
        source.insert(INDEX, "doc", &format!("k{:02}", i), json!({ "n": i, "tags": ["x", i] })).await;
    }
    let target = Arc::new(MemoryStore::new());

    Migrator::new(memory_config(SyncMode::Copy, 8))
        .unwrap()
        .with_stores(source.clone(), target.clone())
        .run()
        .await
        .unwrap();
    let calls = target.bulk_calls().await;

    let report = Migrator::new(memory_config(SyncMode::Sync, 8))
        .unwrap()
        .with_stores(source, target.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.upserts + report.deletes, 0);
    assert_eq!(target.bulk_calls().await, calls);
}

// =============================================================================
// Against Elasticsearch
// =============================================================================

fn es_config(source: &str, target: &str, mode: SyncMode) -> SyncConfig {
    let mut config = SyncConfig {
        mode,
        source: ClusterConfig::for_testing(source, "items"),
        target: ClusterConfig::for_testing(target, "items"),
        ..Default::default()
    };
    config.scan.doc_buffer_count = 7;
    config.bulk.idle_timeout = "200ms".into();
    config
}

#[tokio::test]
#[ignore] // Requires Docker
async fn es_sync_converges_target() {
    let docker = Cli::default();
    let source_node = elasticsearch_container(&docker, "7.17.10");
    let target_node = elasticsearch_container(&docker, "7.17.10");
    let source_url = elasticsearch_url(&source_node);
    let target_url = elasticsearch_url(&target_node);

    let source_docs: Vec<_> = (0..40).map(|i| (format!("i{:03}", i), json!({ "n": i }))).collect();
    let target_docs: Vec<_> = (20..60).map(|i| (format!("i{:03}", i), json!({ "n": i % 7 }))).collect();
    seed_documents(&source_url, "items", &source_docs).await;
    seed_documents(&target_url, "items", &target_docs).await;

    let report = Migrator::new(es_config(&source_url, &target_url, SyncMode::Sync))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(report.deletes, 20);
    assert_eq!(fetch_all(&target_url, "items").await, fetch_all(&source_url, "items").await);

    let again = Migrator::new(es_config(&source_url, &target_url, SyncMode::Sync))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(again.upserts + again.deletes, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn es_copy_into_empty_cluster() {
    let docker = Cli::default();
    let source_node = elasticsearch_container(&docker, "7.17.10");
    let target_node = elasticsearch_container(&docker, "7.17.10");
    let source_url = elasticsearch_url(&source_node);
    let target_url = elasticsearch_url(&target_node);

    let docs: Vec<_> = (0..25).map(|i| (format!("c{:02}", i), json!({ "n": i }))).collect();
    seed_documents(&source_url, "items", &docs).await;

    let mut config = es_config(&source_url, &target_url, SyncMode::Copy);
    config.bulk.workers = 2;
    config.scan.slices = 2;
    let report = Migrator::new(config).unwrap().run().await.unwrap();
    assert_eq!(report.source_docs, 25);
    assert_eq!(fetch_all(&target_url, "items").await, fetch_all(&source_url, "items").await);
}
