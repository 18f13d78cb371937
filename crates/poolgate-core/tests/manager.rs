mod support;

use std::sync::Arc;

use poolgate_common::SystemSettings;
use poolgate_core::{Cipher, GroupManager, INVALIDATE_CHANNEL};
use poolgate_storage::{CatalogSnapshot, Storage};
use poolgate_store::{MemoryStore, SharedStore, Store};

use support::{StubStorage, group_row};

#[tokio::test]
async fn snapshot_swaps_atomically_on_invalidate_and_broadcasts() {
    let cipher = Cipher::new(support::MASTER_KEY);
    let storage = StubStorage::seeded(
        CatalogSnapshot {
            groups: vec![group_row(1, "alpha")],
            sub_groups: Vec::new(),
            hub_access_keys: Vec::new(),
        },
        Vec::new(),
    );
    let store: SharedStore = Arc::new(MemoryStore::new());
    let mut invalidations = store.subscribe(INVALIDATE_CHANNEL).await.unwrap();

    let manager = GroupManager::load(
        storage.clone() as Arc<dyn Storage>,
        store.clone(),
        &cipher,
        SystemSettings::default(),
    )
    .await
    .unwrap();

    let before = manager.snapshot();
    assert!(before.by_name.contains_key("alpha"));
    assert!(!before.by_name.contains_key("beta"));

    // Catalog changes behind the manager's back; readers keep the old
    // snapshot until an invalidation lands.
    storage
        .catalog
        .lock()
        .unwrap()
        .groups
        .push(group_row(2, "beta"));
    assert!(manager.by_name("beta").is_none());

    manager.invalidate(&cipher).await.unwrap();
    assert!(manager.by_name("beta").is_some());
    // The old snapshot handle is still intact for in-flight readers.
    assert!(!before.by_name.contains_key("beta"));

    // Peers sharing the store hear about it.
    let message = invalidations.recv().await.unwrap();
    assert_eq!(message, "reload");
}

#[tokio::test]
async fn model_pool_indexes_test_model_redirects_and_customs() {
    let cipher = Cipher::new(support::MASTER_KEY);
    let mut row = group_row(1, "alpha");
    row.model_redirect_map = serde_json::json!({
        "alias": {"targets": [
            {"model": "real-model", "weight": 100, "enabled": true},
            {"model": "dead-model", "weight": 100, "enabled": false},
        ]}
    });
    row.custom_models = serde_json::json!(["extra-model"]);
    let storage = StubStorage::seeded(
        CatalogSnapshot {
            groups: vec![row],
            sub_groups: Vec::new(),
            hub_access_keys: Vec::new(),
        },
        Vec::new(),
    );
    let store: SharedStore = Arc::new(MemoryStore::new());

    let manager = GroupManager::load(
        storage as Arc<dyn Storage>,
        store,
        &cipher,
        SystemSettings::default(),
    )
    .await
    .unwrap();

    let snapshot = manager.snapshot();
    for model in ["gpt-4", "alias", "real-model", "extra-model"] {
        assert!(
            snapshot.model_pool.contains_key(model),
            "model {model} missing from pool"
        );
    }
    assert!(!snapshot.model_pool.contains_key("dead-model"));
}

#[tokio::test]
async fn undecryptable_hub_key_is_skipped_not_fatal() {
    let cipher = Cipher::new(support::MASTER_KEY);
    let other = Cipher::new("a-different-master");
    let storage = StubStorage::seeded(
        CatalogSnapshot {
            groups: Vec::new(),
            sub_groups: Vec::new(),
            hub_access_keys: vec![
                poolgate_storage::HubAccessKeyRow {
                    id: 1,
                    name: "good".to_string(),
                    key_value: cipher.encrypt("hub-token").unwrap(),
                    key_hash: poolgate_core::fingerprint("hub-token"),
                    allowed_models: None,
                    enabled: true,
                },
                poolgate_storage::HubAccessKeyRow {
                    id: 2,
                    name: "stale".to_string(),
                    key_value: other.encrypt("old-token").unwrap(),
                    key_hash: poolgate_core::fingerprint("old-token"),
                    allowed_models: None,
                    enabled: true,
                },
            ],
        },
        Vec::new(),
    );
    let store: SharedStore = Arc::new(MemoryStore::new());

    let manager = GroupManager::load(
        storage as Arc<dyn Storage>,
        store,
        &cipher,
        SystemSettings::default(),
    )
    .await
    .unwrap();

    let snapshot = manager.snapshot();
    assert!(
        snapshot
            .hub_keys_by_hash
            .contains_key(&poolgate_core::fingerprint("hub-token"))
    );
    assert!(
        !snapshot
            .hub_keys_by_hash
            .contains_key(&poolgate_core::fingerprint("old-token"))
    );
}
