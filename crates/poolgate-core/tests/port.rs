mod support;

use std::sync::Arc;

use poolgate_core::{Cipher, port};
use poolgate_storage::{CatalogSnapshot, Storage, SubGroupRow};

use support::{StubStorage, group_row, key_row};

fn cipher() -> Cipher {
    Cipher::new(support::MASTER_KEY)
}

#[tokio::test]
async fn bulk_import_dedups_within_group() {
    let storage = StubStorage::seeded(CatalogSnapshot::default(), Vec::new());
    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let cipher = cipher();

    let outcome = port::import_keys(&storage_dyn, &cipher, 1, "sk-a\nsk-b,sk-a")
        .await
        .unwrap();
    assert_eq!(outcome.added, 2);
    assert_eq!(outcome.duplicates, 0);

    // A second import of overlapping material only adds the new key.
    let outcome = port::import_keys(&storage_dyn, &cipher, 1, "sk-b sk-c")
        .await
        .unwrap();
    assert_eq!(outcome.added, 1);
    assert_eq!(outcome.duplicates, 1);

    let rows = storage.keys.lock().unwrap();
    assert_eq!(rows.len(), 3);
    // Values are encrypted at rest and decrypt back to the originals.
    let plains: Vec<String> = rows
        .iter()
        .map(|row| cipher.decrypt(&row.key_value).unwrap())
        .collect();
    assert_eq!(plains, vec!["sk-a", "sk-b", "sk-c"]);
}

#[tokio::test]
async fn export_import_round_trips_group_keys_and_members() {
    let cipher = cipher();
    let mut member = group_row(1, "member");
    member.model_group_priority = 9;
    let mut agg = group_row(2, "bundle");
    agg.group_type = "aggregate".to_string();
    agg.model_redirect_map = serde_json::json!({
        "quick": {"targets": [{"model": "gpt-4o", "weight": 100, "enabled": true}]}
    });
    let catalog = CatalogSnapshot {
        groups: vec![member, agg],
        sub_groups: vec![SubGroupRow {
            group_id: 2,
            sub_group_id: 1,
            weight: 7,
        }],
        hub_access_keys: Vec::new(),
    };
    let keys = vec![key_row(&cipher, 1, 2, "sk-x"), key_row(&cipher, 2, 2, "sk-y")];
    let source = StubStorage::seeded(catalog, keys);
    let source_dyn: Arc<dyn Storage> = source.clone();

    let export = port::export_group(&source_dyn, &cipher, "bundle").await.unwrap();
    assert_eq!(export.keys, vec!["sk-x", "sk-y"]);
    assert_eq!(export.sub_groups.len(), 1);
    assert_eq!(export.sub_groups[0].name, "member");
    assert_eq!(export.model_redirect_rules["quick"], "gpt-4o*100");

    // Import into an empty catalog that still knows the member group.
    let fresh = StubStorage::seeded(
        CatalogSnapshot {
            groups: vec![group_row(10, "member")],
            sub_groups: Vec::new(),
            hub_access_keys: Vec::new(),
        },
        Vec::new(),
    );
    let fresh_dyn: Arc<dyn Storage> = fresh.clone();
    let new_id = port::import_group(&fresh_dyn, &cipher, &export).await.unwrap();

    let catalog = fresh.catalog.lock().unwrap();
    let imported = catalog.groups.iter().find(|g| g.id == new_id).unwrap();
    assert_eq!(imported.name, "bundle");
    assert_eq!(imported.group_type, "aggregate");
    assert_eq!(
        imported.model_redirect_map,
        serde_json::json!({
            "quick": {"targets": [{"model": "gpt-4o", "weight": 100, "enabled": true}]}
        })
    );
    assert_eq!(catalog.sub_groups.len(), 1);
    assert_eq!(catalog.sub_groups[0].sub_group_id, 10);
    assert_eq!(catalog.sub_groups[0].weight, 7);
    drop(catalog);

    let keys = fresh.keys.lock().unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.group_id == new_id));
    let plains: Vec<String> = keys
        .iter()
        .map(|k| cipher.decrypt(&k.key_value).unwrap())
        .collect();
    assert_eq!(plains, vec!["sk-x", "sk-y"]);
}

#[tokio::test]
async fn import_renames_on_collision_with_shared_suffix() {
    let cipher = cipher();
    let catalog = CatalogSnapshot {
        groups: vec![group_row(1, "taken")],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    let source = StubStorage::seeded(catalog.clone(), Vec::new());
    let source_dyn: Arc<dyn Storage> = source.clone();
    let export = port::export_group(&source_dyn, &cipher, "taken").await.unwrap();

    let target = StubStorage::seeded(catalog, Vec::new());
    let target_dyn: Arc<dyn Storage> = target.clone();
    let new_id = port::import_group(&target_dyn, &cipher, &export).await.unwrap();

    let guard = target.catalog.lock().unwrap();
    let imported = guard.groups.iter().find(|g| g.id == new_id).unwrap();
    assert_ne!(imported.name, "taken");
    let suffix = imported.name.strip_prefix("taken-").unwrap();
    assert_eq!(suffix.len(), 6);
    // display_name receives the same suffix.
    assert_eq!(imported.display_name, format!("taken-{suffix}"));
}
