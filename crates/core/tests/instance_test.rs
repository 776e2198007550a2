//! Instance lifecycle: fail-closed spawning, tamper-evident lineage chains,
//! and retention pruning.

use sqlx::SqlitePool;
use std::sync::Arc;

use spica_core::db::{init_db, SqliteDataStore};
use spica_core::instance::{InstanceManagerConfig, SpicaInstanceManager};
use spica_shared::model::InstanceState;
use spica_shared::{OptimizerStore, SpicaId};

const KEY: &[u8] = b"an-hmac-key-for-integration-tests";

async fn setup_store() -> Arc<dyn OptimizerStore> {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    init_db(&pool, "sqlite::memory:").await.unwrap();
    Arc::new(SqliteDataStore::new(pool))
}

async fn manager(signing_key: Option<Vec<u8>>, dir: &tempfile::TempDir) -> SpicaInstanceManager {
    let mgr = SpicaInstanceManager::new(
        setup_store().await,
        InstanceManagerConfig {
            data_dir: dir.path().to_path_buf(),
            signing_key,
            prune_after_days: 14,
            min_instances: 3,
        },
    );
    mgr.init().await.unwrap();
    mgr
}

#[tokio::test]
async fn test_spawn_without_key_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(None, &dir).await;
    let err = mgr
        .spawn(serde_json::json!({"threads": 4}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("signing key unavailable"));
}

#[tokio::test]
async fn test_spawn_writes_manifest_and_signed_root() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(Some(KEY.to_vec()), &dir).await;

    let (instance, _) = mgr.spawn(serde_json::json!({"threads": 4})).await.unwrap();
    assert_eq!(instance.state, InstanceState::Spawned);
    assert_eq!(instance.lineage_chain.len(), 1);
    assert!(instance.lineage_chain[0].parent_hash.is_empty());

    let manifest = dir
        .path()
        .join("manifests")
        .join(format!("{}.json", instance.instance_id));
    assert!(manifest.exists());

    let (valid, total) = mgr.verify_lineage(instance.instance_id).await.unwrap();
    assert_eq!((valid, total), (1, 1));
}

#[tokio::test]
async fn test_config_updates_extend_a_verifiable_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(Some(KEY.to_vec()), &dir).await;

    let (instance, _) = mgr.spawn(serde_json::json!({"threads": 2})).await.unwrap();
    let id = instance.instance_id;
    mgr.update_config(id, serde_json::json!({"threads": 4}))
        .await
        .unwrap();
    let updated = mgr
        .update_config(id, serde_json::json!({"threads": 8}))
        .await
        .unwrap();

    assert_eq!(updated.lineage_chain.len(), 3);
    assert_eq!(updated.state, InstanceState::Retained);
    // Each link binds to its predecessor.
    for pair in updated.lineage_chain.windows(2) {
        assert_eq!(pair[1].parent_hash, pair[0].entry_hash);
    }
    let (valid, total) = mgr.verify_lineage(id).await.unwrap();
    assert_eq!((valid, total), (3, 3));
}

#[tokio::test]
async fn test_tampered_entry_invalidates_the_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store().await;
    let mgr = SpicaInstanceManager::new(
        store.clone(),
        InstanceManagerConfig {
            data_dir: dir.path().to_path_buf(),
            signing_key: Some(KEY.to_vec()),
            prune_after_days: 14,
            min_instances: 3,
        },
    );
    mgr.init().await.unwrap();

    let (instance, _) = mgr.spawn(serde_json::json!({"v": 1})).await.unwrap();
    let id = instance.instance_id;
    mgr.update_config(id, serde_json::json!({"v": 2})).await.unwrap();
    mgr.update_config(id, serde_json::json!({"v": 3})).await.unwrap();

    // Corrupt the middle entry behind the manager's back.
    let key = format!("instance:{id}");
    let mut raw = store.get_json("core.instance", &key).await.unwrap().unwrap();
    raw["lineage_chain"][1]["entry_hash"] = serde_json::json!("forged");
    store.set_json("core.instance", &key, raw).await.unwrap();

    let (valid, total) = mgr.verify_lineage(id).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(valid, 1);

    // A corrupt chain refuses further configuration changes.
    let err = mgr
        .update_config(id, serde_json::json!({"v": 4}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("valid only through entry 1"));
}

#[tokio::test]
async fn test_prune_respects_floor_and_age() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(Some(KEY.to_vec()), &dir).await;

    for i in 0..5 {
        mgr.spawn(serde_json::json!({"n": i})).await.unwrap();
    }
    // All five are brand new; nothing is older than the retention window.
    let events = mgr.prune_stale().await.unwrap();
    assert!(events.is_empty());
    let alive = mgr
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.state != InstanceState::Pruned)
        .count();
    assert_eq!(alive, 5);
}

#[tokio::test]
async fn test_prune_drops_stale_instances_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store().await;
    let mgr = SpicaInstanceManager::new(
        store.clone(),
        InstanceManagerConfig {
            data_dir: dir.path().to_path_buf(),
            signing_key: Some(KEY.to_vec()),
            prune_after_days: 14,
            min_instances: 3,
        },
    );
    mgr.init().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let (instance, _) = mgr.spawn(serde_json::json!({"n": i})).await.unwrap();
        ids.push(instance.instance_id);
    }
    // Age the first three past the retention window.
    for id in ids.iter().take(3) {
        let key = format!("instance:{id}");
        let mut raw = store.get_json("core.instance", &key).await.unwrap().unwrap();
        raw["created_at"] = serde_json::json!("2020-01-01T00:00:00Z");
        store.set_json("core.instance", &key, raw).await.unwrap();
    }

    let events = mgr.prune_stale().await.unwrap();
    // Three are stale, but the floor of three live instances caps it at two.
    assert_eq!(events.len(), 2);
    let alive = mgr
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.state != InstanceState::Pruned)
        .count();
    assert_eq!(alive, 3);
}

#[tokio::test]
async fn test_telemetry_appends_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(Some(KEY.to_vec()), &dir).await;
    let (instance, _) = mgr.spawn(serde_json::json!({})).await.unwrap();

    mgr.append_telemetry(instance.instance_id, &serde_json::json!({"tick": 1}))
        .await
        .unwrap();
    mgr.append_telemetry(instance.instance_id, &serde_json::json!({"tick": 2}))
        .await
        .unwrap();

    let path = dir.path().join(&instance.telemetry_ref);
    let content = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(lines[1]).unwrap()["tick"],
        2
    );
}
