#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::watch;

use poolgate_channel::UpstreamRequest;
use poolgate_common::{GlobalConfig, GroupId, KeyId, SystemSettings};
use poolgate_core::{
    AppState, Cipher, GroupManager, KeyProvider, TransportError, UpstreamBody, UpstreamClient,
    UpstreamResponse, WeightEngine, fingerprint,
};
use poolgate_storage::{
    ApiKeyRow, CatalogSnapshot, GroupInsert, GroupRow, HourlyStatDelta, HubAccessKeyRow,
    InsertKeysOutcome, KeyStatus, LogSinkConfig, NewApiKey, RequestLogInsert, RequestLogSink,
    Storage, StorageResult, SubGroupRow,
};
use poolgate_store::MemoryStore;

pub const MASTER_KEY: &str = "test-master";

/// In-memory Storage double. Only the methods the engine exercises are
/// meaningfully implemented; catalog and keys are seeded by the test.
#[derive(Default)]
pub struct StubStorage {
    pub catalog: Mutex<CatalogSnapshot>,
    pub keys: Mutex<Vec<ApiKeyRow>>,
    pub status_updates: Mutex<Vec<(KeyId, KeyStatus, i64)>>,
    pub logs: Mutex<Vec<RequestLogInsert>>,
}

impl StubStorage {
    pub fn seeded(catalog: CatalogSnapshot, keys: Vec<ApiKeyRow>) -> Arc<Self> {
        Arc::new(Self {
            catalog: Mutex::new(catalog),
            keys: Mutex::new(keys),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Storage for StubStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_system_settings(&self) -> StorageResult<Option<SystemSettings>> {
        Ok(None)
    }

    async fn upsert_system_settings(&self, _settings: &SystemSettings) -> StorageResult<()> {
        Ok(())
    }

    async fn load_catalog(&self) -> StorageResult<CatalogSnapshot> {
        Ok(self.catalog.lock().unwrap().clone())
    }

    async fn load_group_keys(&self, group_id: GroupId) -> StorageResult<Vec<ApiKeyRow>> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn set_key_status(
        &self,
        key_id: KeyId,
        status: KeyStatus,
        failure_count: i64,
    ) -> StorageResult<()> {
        self.status_updates
            .lock()
            .unwrap()
            .push((key_id, status, failure_count));
        if let Some(row) = self.keys.lock().unwrap().iter_mut().find(|k| k.id == key_id) {
            row.status = status;
            row.failure_count = failure_count;
        }
        Ok(())
    }

    async fn set_group_key_statuses(
        &self,
        group_id: GroupId,
        from: KeyStatus,
        to: KeyStatus,
    ) -> StorageResult<u64> {
        let mut changed = 0;
        for row in self.keys.lock().unwrap().iter_mut() {
            if row.group_id == group_id && row.status == from {
                row.status = to;
                row.failure_count = 0;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn touch_key_used(&self, _key_id: KeyId) -> StorageResult<()> {
        Ok(())
    }

    async fn insert_keys(
        &self,
        group_id: GroupId,
        keys: &[NewApiKey],
    ) -> StorageResult<InsertKeysOutcome> {
        let mut guard = self.keys.lock().unwrap();
        let mut outcome = InsertKeysOutcome::default();
        for key in keys {
            let duplicate = guard
                .iter()
                .any(|k| k.group_id == group_id && k.key_hash == key.key_hash);
            if duplicate {
                outcome.duplicates += 1;
                continue;
            }
            let id = guard.iter().map(|k| k.id).max().unwrap_or(0) + 1;
            guard.push(ApiKeyRow {
                id,
                group_id,
                key_value: key.key_value.clone(),
                key_hash: key.key_hash.clone(),
                status: KeyStatus::Active,
                failure_count: 0,
                last_used_at: None,
                notes: key.notes.clone(),
            });
            outcome.added += 1;
        }
        Ok(outcome)
    }

    async fn delete_group_keys(
        &self,
        group_id: GroupId,
        status: Option<KeyStatus>,
    ) -> StorageResult<u64> {
        let mut guard = self.keys.lock().unwrap();
        let before = guard.len();
        guard.retain(|k| {
            k.group_id != group_id || status.map(|s| k.status != s).unwrap_or(false)
        });
        Ok((before - guard.len()) as u64)
    }

    async fn group_name_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self
            .catalog
            .lock()
            .unwrap()
            .groups
            .iter()
            .any(|g| g.name == name))
    }

    async fn insert_group(&self, group: GroupInsert) -> StorageResult<GroupId> {
        let mut guard = self.catalog.lock().unwrap();
        let id = guard.groups.iter().map(|g| g.id).max().unwrap_or(0) + 1;
        guard.groups.push(GroupRow {
            id,
            name: group.name,
            display_name: group.display_name,
            enabled: group.enabled,
            group_type: group.group_type,
            channel_type: group.channel_type,
            upstreams: group.upstreams,
            test_model: group.test_model,
            validation_endpoint: group.validation_endpoint,
            param_overrides: group.param_overrides,
            config_json: group.config_json,
            header_rules: group.header_rules,
            path_redirects: group.path_redirects,
            model_redirect_map: group.model_redirect_map,
            model_redirect_strict: group.model_redirect_strict,
            proxy_keys: group.proxy_keys,
            model_group_priority: group.model_group_priority,
            weight: group.weight,
            custom_models: group.custom_models,
            cc_support: group.cc_support,
            sort: group.sort,
            parent_group_id: None,
            bound_site_id: None,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        });
        Ok(id)
    }

    async fn insert_sub_groups(
        &self,
        group_id: GroupId,
        members: &[(GroupId, i64)],
    ) -> StorageResult<()> {
        let mut guard = self.catalog.lock().unwrap();
        for (sub_group_id, weight) in members {
            guard.sub_groups.push(SubGroupRow {
                group_id,
                sub_group_id: *sub_group_id,
                weight: *weight,
            });
        }
        Ok(())
    }

    async fn find_group_id_by_name(&self, name: &str) -> StorageResult<Option<GroupId>> {
        Ok(self
            .catalog
            .lock()
            .unwrap()
            .groups
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.id))
    }

    async fn append_request_logs(&self, rows: &[RequestLogInsert]) -> StorageResult<()> {
        self.logs.lock().unwrap().extend(rows.iter().cloned());
        Ok(())
    }

    async fn add_hourly_stats(&self, _rows: &[HourlyStatDelta]) -> StorageResult<()> {
        Ok(())
    }
}

/// Scripted upstream. Each `send` pops the next step; requests are recorded
/// for assertions.
#[derive(Default)]
pub struct MockClient {
    pub script: Mutex<VecDeque<Result<(u16, &'static str), TransportError>>>,
    /// Streamed responses, consumed before the buffered script when the
    /// request asks for a stream.
    pub stream_script: Mutex<VecDeque<(u16, &'static str, Vec<&'static str>)>>,
    pub requests: Mutex<Vec<UpstreamRequest>>,
}

impl MockClient {
    pub fn scripted(
        steps: Vec<Result<(u16, &'static str), TransportError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    /// Script one streamed 200 with the given content type and frames.
    pub fn streaming(content_type: &'static str, frames: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            stream_script: Mutex::new(vec![(200, content_type, frames)].into()),
            ..Default::default()
        })
    }
}

impl UpstreamClient for MockClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let is_stream = req.is_stream;
            self.requests.lock().unwrap().push(req);

            if is_stream
                && let Some((status, content_type, frames)) =
                    self.stream_script.lock().unwrap().pop_front()
            {
                let (tx, rx) = tokio::sync::mpsc::channel(16);
                tokio::spawn(async move {
                    for frame in frames {
                        if tx.send(Bytes::from_static(frame.as_bytes())).await.is_err() {
                            break;
                        }
                        // Let the consumer observe chunk boundaries.
                        tokio::task::yield_now().await;
                    }
                });
                return Ok(UpstreamResponse {
                    status,
                    headers: vec![("content-type".to_string(), content_type.to_string())],
                    body: UpstreamBody::Stream(rx),
                });
            }

            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((200, "{}")));
            step.map(|(status, body)| UpstreamResponse {
                status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: UpstreamBody::Full(Bytes::from_static(body.as_bytes())),
            })
        })
    }
}

pub fn group_row(id: GroupId, name: &str) -> GroupRow {
    GroupRow {
        id,
        name: name.to_string(),
        display_name: name.to_string(),
        enabled: true,
        group_type: "standard".to_string(),
        channel_type: "openai".to_string(),
        upstreams: serde_json::json!([{"url": "https://up.example.com", "weight": 1}]),
        test_model: "gpt-4".to_string(),
        validation_endpoint: None,
        param_overrides: serde_json::json!({}),
        config_json: serde_json::json!({}),
        header_rules: serde_json::json!([]),
        path_redirects: serde_json::json!([]),
        model_redirect_map: serde_json::json!({}),
        model_redirect_strict: false,
        proxy_keys: serde_json::json!(["proxy-token"]),
        model_group_priority: 10,
        weight: 50,
        custom_models: serde_json::json!([]),
        cc_support: false,
        sort: 0,
        parent_group_id: None,
        bound_site_id: None,
        updated_at: OffsetDateTime::UNIX_EPOCH,
    }
}

pub fn key_row(cipher: &Cipher, id: KeyId, group_id: GroupId, plain: &str) -> ApiKeyRow {
    ApiKeyRow {
        id,
        group_id,
        key_value: cipher.encrypt(plain).unwrap(),
        key_hash: fingerprint(plain),
        status: KeyStatus::Active,
        failure_count: 0,
        last_used_at: None,
        notes: None,
    }
}

pub struct TestHarness {
    pub state: Arc<AppState>,
    pub storage: Arc<StubStorage>,
    pub client: Arc<MockClient>,
    pub shutdown: watch::Sender<bool>,
}

pub async fn build_state(
    catalog: CatalogSnapshot,
    keys: Vec<ApiKeyRow>,
    client: Arc<MockClient>,
) -> TestHarness {
    let cipher = Arc::new(Cipher::new(MASTER_KEY));
    let store: poolgate_store::SharedStore = Arc::new(MemoryStore::new());
    let storage = StubStorage::seeded(catalog, keys);
    let storage_dyn: Arc<dyn Storage> = storage.clone();

    let manager = GroupManager::load(
        storage_dyn.clone(),
        store.clone(),
        &cipher,
        SystemSettings::default(),
    )
    .await
    .unwrap();

    let provider = KeyProvider::new(store.clone(), storage_dyn.clone(), cipher.clone());
    let group_ids: Vec<GroupId> = manager.snapshot().by_id.keys().copied().collect();
    for group_id in group_ids {
        provider.load_group_keys(group_id).await.unwrap();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sink, _handle) = RequestLogSink::spawn(
        storage_dyn.clone(),
        LogSinkConfig::default(),
        shutdown_rx,
    );

    let global = GlobalConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        dsn: "sqlite::memory:".to_string(),
        store_url: None,
        master_key: MASTER_KEY.to_string(),
        global_proxy_keys: Vec::new(),
        proxy: None,
    };

    let state = Arc::new(AppState::new(
        global,
        store.clone(),
        storage_dyn,
        cipher,
        manager,
        provider,
        WeightEngine::new(store),
        client.clone(),
        sink,
    ));

    TestHarness {
        state,
        storage,
        client,
        shutdown: shutdown_tx,
    }
}
