use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use poolgate_common::{GlobalConfig, KeyId};
use poolgate_storage::{RequestLogSink, Storage};
use poolgate_store::SharedStore;

use crate::cipher::{Cipher, fingerprint};
use crate::keypool::KeyProvider;
use crate::manager::GroupManager;
use crate::upstream::UpstreamClient;
use crate::weight::WeightEngine;

/// Process-wide state. Only the store handle and this struct are shared;
/// everything else hangs off it.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub store: SharedStore,
    pub storage: Arc<dyn Storage>,
    pub cipher: Arc<Cipher>,
    pub manager: GroupManager,
    pub keys: KeyProvider,
    pub weights: WeightEngine,
    pub client: Arc<dyn UpstreamClient>,
    pub log_sink: RequestLogSink,
    global_proxy_key_hashes: ArcSwap<HashSet<String>>,
    key_semaphores: Mutex<HashMap<KeyId, Arc<Semaphore>>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        global: GlobalConfig,
        store: SharedStore,
        storage: Arc<dyn Storage>,
        cipher: Arc<Cipher>,
        manager: GroupManager,
        keys: KeyProvider,
        weights: WeightEngine,
        client: Arc<dyn UpstreamClient>,
        log_sink: RequestLogSink,
    ) -> Self {
        let hashes = global
            .global_proxy_keys
            .iter()
            .map(|token| fingerprint(token))
            .collect();
        Self {
            global: ArcSwap::from_pointee(global),
            store,
            storage,
            cipher,
            manager,
            keys,
            weights,
            client,
            log_sink,
            global_proxy_key_hashes: ArcSwap::from_pointee(hashes),
            key_semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_global_proxy_key(&self, token: &str) -> bool {
        self.global_proxy_key_hashes
            .load()
            .contains(&fingerprint(token))
    }

    pub fn apply_global_config(&self, config: GlobalConfig) {
        let hashes = config
            .global_proxy_keys
            .iter()
            .map(|token| fingerprint(token))
            .collect();
        self.global_proxy_key_hashes.store(Arc::new(hashes));
        self.global.store(Arc::new(config));
    }

    /// Per-key concurrency permit. `cap == 0` disables the cap. The permit is
    /// held for the whole attempt, including a streamed response.
    pub async fn key_permit(&self, key_id: KeyId, cap: u32) -> Option<OwnedSemaphorePermit> {
        if cap == 0 {
            return None;
        }
        let semaphore = {
            let mut guard = self.key_semaphores.lock().await;
            guard
                .entry(key_id)
                .or_insert_with(|| Arc::new(Semaphore::new(cap as usize)))
                .clone()
        };
        semaphore.acquire_owned().await.ok()
    }
}
