use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;

use poolgate_common::{GroupId, SystemSettings};
use poolgate_storage::Storage;
use poolgate_store::SharedStore;

use crate::cipher::Cipher;
use crate::group::Group;

pub const INVALIDATE_CHANNEL: &str = "groups:invalidate";

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Storage(#[from] poolgate_storage::StorageError),
}

/// Decrypted hub access key, indexed by fingerprint for O(1) admission.
#[derive(Debug, Clone)]
pub struct HubKeyEntry {
    pub id: i64,
    pub name: String,
    pub allowed_models: Option<HashSet<String>>,
    pub enabled: bool,
}

/// Immutable, fully-derived view of the group catalog. Swapped atomically on
/// invalidation; readers clone the `Arc` and never observe a half-built map.
#[derive(Default)]
pub struct GroupSnapshot {
    pub by_name: HashMap<String, Arc<Group>>,
    pub by_id: HashMap<GroupId, Arc<Group>>,
    pub hub_keys_by_hash: HashMap<String, Arc<HubKeyEntry>>,
    /// model → groups offering it, in catalog order.
    pub model_pool: HashMap<String, Vec<GroupId>>,
}

pub struct GroupManager {
    storage: Arc<dyn Storage>,
    store: SharedStore,
    defaults: ArcSwap<SystemSettings>,
    snapshot: ArcSwap<GroupSnapshot>,
}

impl GroupManager {
    pub async fn load(
        storage: Arc<dyn Storage>,
        store: SharedStore,
        cipher: &Cipher,
        defaults: SystemSettings,
    ) -> Result<Self, ManagerError> {
        let manager = Self {
            storage,
            store,
            defaults: ArcSwap::from_pointee(defaults),
            snapshot: ArcSwap::from_pointee(GroupSnapshot::default()),
        };
        manager.reload(cipher).await?;
        Ok(manager)
    }

    pub fn snapshot(&self) -> Arc<GroupSnapshot> {
        self.snapshot.load_full()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Group>> {
        self.snapshot.load().by_name.get(name).cloned()
    }

    pub fn by_id(&self, id: GroupId) -> Option<Arc<Group>> {
        self.snapshot.load().by_id.get(&id).cloned()
    }

    pub fn defaults(&self) -> SystemSettings {
        self.defaults.load().as_ref().clone()
    }

    pub fn set_defaults(&self, defaults: SystemSettings) {
        self.defaults.store(Arc::new(defaults));
    }

    /// Rebuild the snapshot from storage and swap it in.
    pub async fn reload(&self, cipher: &Cipher) -> Result<(), ManagerError> {
        let catalog = self.storage.load_catalog().await?;
        let defaults = self.defaults.load_full();

        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        let mut model_pool: HashMap<String, Vec<GroupId>> = HashMap::new();

        for row in &catalog.groups {
            let group = Arc::new(Group::from_row(row, &catalog.sub_groups, &defaults));
            for model in group.offered_models() {
                let groups = model_pool.entry(model).or_default();
                if !groups.contains(&group.id) {
                    groups.push(group.id);
                }
            }
            by_name.insert(group.name.clone(), group.clone());
            by_id.insert(group.id, group);
        }

        let mut hub_keys_by_hash = HashMap::new();
        for row in &catalog.hub_access_keys {
            // Stored encrypted; the fingerprint column is the lookup key, so
            // a decrypt failure only loses this one entry.
            if cipher.decrypt(&row.key_value).is_err() {
                tracing::warn!(hub_key_id = row.id, "hub access key decrypt failed, skipping");
                continue;
            }
            hub_keys_by_hash.insert(
                row.key_hash.clone(),
                Arc::new(HubKeyEntry {
                    id: row.id,
                    name: row.name.clone(),
                    allowed_models: row
                        .allowed_models
                        .as_ref()
                        .map(|models| models.iter().cloned().collect()),
                    enabled: row.enabled,
                }),
            );
        }

        self.snapshot.store(Arc::new(GroupSnapshot {
            by_name,
            by_id,
            hub_keys_by_hash,
            model_pool,
        }));
        Ok(())
    }

    /// Local reload plus a broadcast so peers sharing the store converge.
    pub async fn invalidate(&self, cipher: &Cipher) -> Result<(), ManagerError> {
        self.reload(cipher).await?;
        if let Err(err) = self.store.publish(INVALIDATE_CHANNEL, "reload").await {
            tracing::warn!(error = %err, "group invalidation broadcast failed");
        }
        Ok(())
    }
}
