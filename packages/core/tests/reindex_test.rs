//! Integration tests for the full re-index
//!
//! Tests cover:
//! - Exclusion rules during a rebuild
//! - Busy-state rejection and concurrent triggers
//! - Commit cadence
//! - Failure recording in the state log

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use treemirror_core::db::{MirrorTable, NodePersister, SyncStateStore};
use treemirror_core::services::{ReindexOutcome, TriggerResult};
use treemirror_core::tree::{ContentTree, InMemoryTree, TreeError, TreeNode};
use treemirror_core::{ConnectionInfo, NodeKey, SyncConfig, SyncEngine, SyncState};

/// Test helper: engine over `tree` with a fresh mirror database
async fn create_test_env(
    tree: Arc<dyn ContentTree>,
    config: SyncConfig,
) -> Result<(SyncEngine, TempDir)> {
    let temp_dir = TempDir::new()?;
    let config = SyncConfig {
        connection: ConnectionInfo::local(temp_dir.path().join("mirror.db")),
        ..config
    };
    let engine = SyncEngine::new(config, tree).await?;
    Ok((engine, temp_dir))
}

fn four_node_tree() -> Result<InMemoryTree> {
    Ok(InMemoryTree::from_json_str(
        r#"{
            "path": "/content",
            "type": "sling:Folder",
            "children": [
                { "name": "a", "type": "cq:Page",
                  "children": [ { "name": "b", "properties": { "text": "hello" } } ] },
                { "name": "x", "properties": { "secret": "hidden" } }
            ]
        }"#,
    )?)
}

/// Source tree that cannot be reached
struct UnreachableTree;

#[async_trait]
impl ContentTree for UnreachableTree {
    async fn get_node(&self, _path: &str) -> Result<Option<Arc<dyn TreeNode>>, TreeError> {
        Err(TreeError::Unavailable("repository offline".to_string()))
    }

    async fn nodes_modified_since(
        &self,
        _since: DateTime<Utc>,
    ) -> Result<Vec<Arc<dyn TreeNode>>, TreeError> {
        Err(TreeError::Unavailable("repository offline".to_string()))
    }
}

// =========================================================================
// Path Filter Tests
// =========================================================================

#[tokio::test]
async fn test_excluded_subtree_is_never_written() -> Result<()> {
    let config = SyncConfig {
        include_paths: vec!["/content".to_string()],
        exclude_paths: vec!["/content/x".to_string()],
        ..SyncConfig::default()
    };
    let (engine, _temp_dir) = create_test_env(Arc::new(four_node_tree()?), config).await?;

    let outcome = engine.reindexer().run().await;
    assert!(outcome.is_completed(), "re-index should complete: {:?}", outcome);

    let db = engine.database();
    assert_eq!(db.count_rows(MirrorTable::Node).await?, 3);
    assert_eq!(db.count_rows(MirrorTable::Property).await?, 1);

    let conn = db.connect()?;
    let under_x = NodePersister::new().list_under(&conn, "/content/x").await?;
    assert!(under_x.is_empty(), "no rows under an excluded path");
    Ok(())
}

#[tokio::test]
async fn test_exclude_prefix_covers_sibling_names() -> Result<()> {
    let tree = InMemoryTree::from_json_str(
        r#"{
            "path": "/content",
            "children": [
                { "name": "a" },
                { "name": "x" },
                { "name": "xy", "properties": { "text": "also hidden" } }
            ]
        }"#,
    )?;
    let config = SyncConfig {
        exclude_paths: vec!["/content/x".to_string()],
        ..SyncConfig::default()
    };
    let (engine, _temp_dir) = create_test_env(Arc::new(tree), config).await?;
    assert!(engine.reindexer().run().await.is_completed());

    let db = engine.database();
    assert_eq!(db.count_rows(MirrorTable::Node).await?, 2);
    assert_eq!(db.count_rows(MirrorTable::Property).await?, 0);

    let conn = db.connect()?;
    let xy = NodePersister::new()
        .load(&conn, &NodeKey::new("/content/xy", ""))
        .await?;
    assert!(xy.is_none(), "plain prefix match excludes /content/xy");
    Ok(())
}

#[tokio::test]
async fn test_parent_links_follow_the_tree() -> Result<()> {
    let (engine, _temp_dir) =
        create_test_env(Arc::new(four_node_tree()?), SyncConfig::default()).await?;
    assert!(engine.reindexer().run().await.is_completed());

    let conn = engine.database().connect()?;
    let persister = NodePersister::new();
    let root = persister
        .load(&conn, &NodeKey::new("/content", ""))
        .await?
        .expect("root row");
    let a = persister
        .load(&conn, &NodeKey::new("/content/a", ""))
        .await?
        .expect("page row");
    let b = persister
        .load(&conn, &NodeKey::new("/content/a/b", ""))
        .await?
        .expect("child row");

    assert_eq!(root.parent_id, None);
    assert_eq!(a.parent_id, Some(root.id));
    assert_eq!(b.parent_id, Some(a.id));
    assert_eq!(a.node.node_type, "cq:Page");
    Ok(())
}

// =========================================================================
// State Gating Tests
// =========================================================================

#[tokio::test]
async fn test_reindex_rejected_while_reindexing() -> Result<()> {
    let (engine, _temp_dir) =
        create_test_env(Arc::new(four_node_tree()?), SyncConfig::default()).await?;
    let state = engine.state_store();
    state.start_reindex().await?;
    let records_before = engine.database().count_rows(MirrorTable::SynchState).await?;

    let outcome = engine.reindexer().run().await;

    assert_eq!(outcome, ReindexOutcome::Rejected(SyncState::Reindexing));
    assert_eq!(state.current_state().await?, SyncState::Reindexing);
    assert_eq!(
        engine.database().count_rows(MirrorTable::SynchState).await?,
        records_before
    );
    assert_eq!(engine.database().count_rows(MirrorTable::Node).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_triggers_start_one_job() -> Result<()> {
    let (engine, _temp_dir) =
        create_test_env(Arc::new(four_node_tree()?), SyncConfig::default()).await?;

    let (first, second) = tokio::join!(engine.trigger_reindex(), engine.trigger_reindex());
    let results = [first?, second?];

    let accepted: Vec<_> = results.into_iter().filter(|r| r.is_accepted()).collect();
    assert_eq!(accepted.len(), 1, "exactly one trigger may win");

    for result in accepted {
        if let TriggerResult::Accepted(job) = result {
            assert!(job.await?.is_completed());
        }
    }
    assert_eq!(engine.database().count_rows(MirrorTable::Node).await?, 4);
    Ok(())
}

#[tokio::test]
async fn test_busy_flag_transitions() -> Result<()> {
    let (engine, _temp_dir) =
        create_test_env(Arc::new(four_node_tree()?), SyncConfig::default()).await?;
    let state: &SyncStateStore = engine.state_store();

    assert!(!state.is_busy().await?);
    state.start_update("/content/a").await?;
    assert!(state.is_busy().await?);
    state.finished().await?;
    assert!(!state.is_busy().await?);

    state.start_reindex().await?;
    assert!(state.is_busy().await?);
    state.finished_with_error("boom").await?;
    assert!(!state.is_busy().await?);

    let latest = state.latest().await?.expect("latest record");
    assert!(latest.is_error());
    assert_eq!(latest.message, "Error: boom");
    Ok(())
}

// =========================================================================
// Commit Cadence Tests
// =========================================================================

#[tokio::test]
async fn test_commit_cadence_over_a_larger_tree() -> Result<()> {
    let tree = InMemoryTree::new();
    tree.insert_node("/content", "sling:Folder", None, vec![])?;
    for i in 0..9 {
        tree.insert_node(&format!("/content/n{}", i), "nt:unstructured", None, vec![])?;
    }
    let config = SyncConfig {
        commit_threshold: 3,
        ..SyncConfig::default()
    };
    let (engine, _temp_dir) = create_test_env(Arc::new(tree), config).await?;

    let ReindexOutcome::Completed(report) = engine.reindexer().run().await else {
        panic!("expected a completed re-index");
    };

    // 10 nodes, threshold 3: floor(10 / 3) intermediate commits plus one final
    assert_eq!(report.walk.visited, 10);
    assert_eq!(report.walk.intermediate_commits, 3);
    assert_eq!(report.walk.final_commits, 1);
    Ok(())
}

// =========================================================================
// Failure Tests
// =========================================================================

#[tokio::test]
async fn test_unreachable_tree_records_error() -> Result<()> {
    let (engine, _temp_dir) =
        create_test_env(Arc::new(UnreachableTree), SyncConfig::default()).await?;

    let outcome = engine.reindexer().run().await;
    assert!(matches!(outcome, ReindexOutcome::Failed(_)));

    let status = engine.status().await?;
    assert!(!status.busy);
    let latest = status.latest.expect("latest record");
    assert!(latest.is_error());
    assert!(latest.message.contains("repository offline"));
    // A failed re-index is no baseline for periodic updates
    assert!(status.last_checkpoint.is_none());
    Ok(())
}
