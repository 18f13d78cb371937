use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use poolgate_common::{GroupId, KeyId};
use poolgate_storage::{KeyStatus, Storage};
use poolgate_store::SharedStore;

use crate::cipher::Cipher;
use crate::classify::ErrorClass;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] poolgate_store::StoreError),
    #[error(transparent)]
    Storage(#[from] poolgate_storage::StorageError),
    #[error("key {0} cannot be decrypted")]
    Cipher(KeyId),
}

/// A decrypted credential handed to the proxy executor for one attempt.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub id: KeyId,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailureOutcome {
    pub failure_count: i64,
    pub blacklisted: bool,
}

fn active_key(group_id: GroupId) -> String {
    format!("active:{group_id}")
}

fn invalid_key(group_id: GroupId) -> String {
    format!("invalid:{group_id}")
}

fn failures_key(group_id: GroupId, key_id: KeyId) -> String {
    format!("failures:{group_id}:{key_id}")
}

fn values_key(group_id: GroupId) -> String {
    format!("keyvals:{group_id}")
}

/// Per-group credential rotation and quarantine.
///
/// The active partition is a rotating list in the store (selection = one
/// atomic head→tail rotation), the invalid partition is a set, and failure
/// counters are plain store counters so peers sharing a store see the same
/// state. Structural moves (blacklist, restore) serialize on a per-group
/// mutex.
pub struct KeyProvider {
    store: SharedStore,
    storage: Arc<dyn Storage>,
    cipher: Arc<Cipher>,
    group_locks: Mutex<HashMap<GroupId, Arc<Mutex<()>>>>,
}

impl KeyProvider {
    pub fn new(store: SharedStore, storage: Arc<dyn Storage>, cipher: Arc<Cipher>) -> Self {
        Self {
            store,
            storage,
            cipher,
            group_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn group_lock(&self, group_id: GroupId) -> Arc<Mutex<()>> {
        let mut locks = self.group_locks.lock().await;
        locks.entry(group_id).or_default().clone()
    }

    /// One-shot reconciliation of the store partitions from the persistent
    /// catalog. Existing order is discarded; rows arrive in id order.
    pub async fn load_group_keys(&self, group_id: GroupId) -> Result<(), PoolError> {
        let rows = self.storage.load_group_keys(group_id).await?;
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        self.store.del(&active_key(group_id)).await?;
        self.store.del(&invalid_key(group_id)).await?;
        self.store.del(&values_key(group_id)).await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            values.push((row.id.to_string(), row.key_value.clone()));
            match row.status {
                KeyStatus::Active => {
                    self.store
                        .list_push_back(&active_key(group_id), &row.id.to_string())
                        .await?;
                }
                KeyStatus::Invalid => {
                    self.store
                        .sadd(&invalid_key(group_id), &row.id.to_string())
                        .await?;
                }
            }
            if row.failure_count > 0 {
                self.store
                    .set(
                        &failures_key(group_id, row.id),
                        &row.failure_count.to_string(),
                        None,
                    )
                    .await?;
            }
        }
        self.store.hset_multi(&values_key(group_id), &values).await?;
        Ok(())
    }

    /// Rotating-FIFO selection. Returns `None` when the active partition is
    /// empty; never blocks and never touches the invalid partition.
    pub async fn next(&self, group_id: GroupId) -> Result<Option<SelectedKey>, PoolError> {
        let Some(id_raw) = self.store.list_rotate(&active_key(group_id)).await? else {
            return Ok(None);
        };
        let Ok(key_id) = id_raw.parse::<KeyId>() else {
            // A corrupt member would otherwise rotate forever; drop it.
            self.store.list_remove(&active_key(group_id), &id_raw).await?;
            return Ok(None);
        };

        let Some(sealed) = self.store.hget(&values_key(group_id), &id_raw).await? else {
            return Err(PoolError::Cipher(key_id));
        };
        let value = self
            .cipher
            .decrypt(&sealed)
            .map_err(|_| PoolError::Cipher(key_id))?;

        let storage = self.storage.clone();
        tokio::spawn(async move {
            let _ = storage.touch_key_used(key_id).await;
        });

        Ok(Some(SelectedKey { id: key_id, value }))
    }

    /// Reset the failure counter after a successful attempt.
    pub async fn on_success(&self, group_id: GroupId, key_id: KeyId) -> Result<(), PoolError> {
        let counter = failures_key(group_id, key_id);
        if self.store.get(&counter).await?.is_some() {
            self.store.del(&counter).await?;
        }
        Ok(())
    }

    /// Apply one classified failure. Uncounted and ignorable outcomes leave
    /// the key untouched; counted outcomes advance the counter and cross into
    /// quarantine at the group's blacklist threshold.
    pub async fn on_failure(
        &self,
        group_id: GroupId,
        key_id: KeyId,
        class: ErrorClass,
        blacklist_threshold: u32,
    ) -> Result<FailureOutcome, PoolError> {
        if !class.counts_against_key() {
            return Ok(FailureOutcome::default());
        }

        let count = self
            .store
            .incr_by(&failures_key(group_id, key_id), 1)
            .await?;
        if count < blacklist_threshold as i64 {
            return Ok(FailureOutcome {
                failure_count: count,
                blacklisted: false,
            });
        }

        self.quarantine(group_id, key_id, count).await?;
        Ok(FailureOutcome {
            failure_count: count,
            blacklisted: true,
        })
    }

    /// Move a key into the invalid partition. Idempotent.
    pub async fn quarantine(
        &self,
        group_id: GroupId,
        key_id: KeyId,
        failure_count: i64,
    ) -> Result<(), PoolError> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let member = key_id.to_string();
        self.store.list_remove(&active_key(group_id), &member).await?;
        self.store.sadd(&invalid_key(group_id), &member).await?;

        // Status persistence is best-effort and off the hot path.
        let storage = self.storage.clone();
        tokio::spawn(async move {
            if let Err(err) = storage
                .set_key_status(key_id, KeyStatus::Invalid, failure_count)
                .await
            {
                tracing::warn!(key_id, error = %err, "failed to persist key quarantine");
            }
        });
        Ok(())
    }

    /// Move one quarantined key back into rotation and reset its counter.
    pub async fn restore_key(&self, group_id: GroupId, key_id: KeyId) -> Result<(), PoolError> {
        let lock = self.group_lock(group_id).await;
        let _guard = lock.lock().await;

        let member = key_id.to_string();
        self.store.srem(&invalid_key(group_id), &member).await?;
        self.store.list_push_back(&active_key(group_id), &member).await?;
        self.store.del(&failures_key(group_id, key_id)).await?;
        self.storage
            .set_key_status(key_id, KeyStatus::Active, 0)
            .await?;
        Ok(())
    }

    /// Move every quarantined key of the group back into rotation.
    pub async fn restore_group(&self, group_id: GroupId) -> Result<u64, PoolError> {
        let members = {
            let lock = self.group_lock(group_id).await;
            let _guard = lock.lock().await;

            let members = self.store.smembers(&invalid_key(group_id)).await?;
            for member in &members {
                self.store.srem(&invalid_key(group_id), member).await?;
                self.store.list_push_back(&active_key(group_id), member).await?;
                if let Ok(key_id) = member.parse::<KeyId>() {
                    self.store.del(&failures_key(group_id, key_id)).await?;
                }
            }
            members
        };
        let changed = self
            .storage
            .set_group_key_statuses(group_id, KeyStatus::Invalid, KeyStatus::Active)
            .await?;
        Ok(changed.max(members.len() as u64))
    }

    /// Drop the group's quarantined keys entirely (store and catalog).
    pub async fn clear_invalid(&self, group_id: GroupId) -> Result<u64, PoolError> {
        {
            let lock = self.group_lock(group_id).await;
            let _guard = lock.lock().await;
            let members = self.store.smembers(&invalid_key(group_id)).await?;
            for member in &members {
                self.store.srem(&invalid_key(group_id), member).await?;
            }
        }
        let deleted = self
            .storage
            .delete_group_keys(group_id, Some(KeyStatus::Invalid))
            .await?;
        Ok(deleted)
    }

    pub async fn active_count(&self, group_id: GroupId) -> Result<u64, PoolError> {
        Ok(self.store.list_len(&active_key(group_id)).await?)
    }

    pub async fn invalid_count(&self, group_id: GroupId) -> Result<u64, PoolError> {
        Ok(self.store.scard(&invalid_key(group_id)).await?)
    }

    pub async fn failure_count(&self, group_id: GroupId, key_id: KeyId) -> Result<i64, PoolError> {
        Ok(self
            .store
            .get(&failures_key(group_id, key_id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}
