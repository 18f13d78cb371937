use async_trait::async_trait;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use poolgate_common::{GroupId, KeyId, SystemSettings};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Invalid,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Invalid => "invalid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(KeyStatus::Active),
            "invalid" => Some(KeyStatus::Invalid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: GroupId,
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub group_type: String,
    pub channel_type: String,
    pub upstreams: JsonValue,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    pub param_overrides: JsonValue,
    pub config_json: JsonValue,
    pub header_rules: JsonValue,
    pub path_redirects: JsonValue,
    pub model_redirect_map: JsonValue,
    pub model_redirect_strict: bool,
    pub proxy_keys: JsonValue,
    pub model_group_priority: i32,
    pub weight: i32,
    pub custom_models: JsonValue,
    pub cc_support: bool,
    pub sort: i32,
    pub parent_group_id: Option<GroupId>,
    pub bound_site_id: Option<i64>,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct SubGroupRow {
    pub group_id: GroupId,
    pub sub_group_id: GroupId,
    pub weight: i64,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: KeyId,
    pub group_id: GroupId,
    pub key_value: String,
    pub key_hash: String,
    pub status: KeyStatus,
    pub failure_count: i64,
    pub last_used_at: Option<OffsetDateTime>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HubAccessKeyRow {
    pub id: i64,
    pub name: String,
    pub key_value: String,
    pub key_hash: String,
    pub allowed_models: Option<Vec<String>>,
    pub enabled: bool,
}

/// Everything the group manager materializes a snapshot from.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub groups: Vec<GroupRow>,
    pub sub_groups: Vec<SubGroupRow>,
    pub hub_access_keys: Vec<HubAccessKeyRow>,
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub key_value: String,
    pub key_hash: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InsertKeysOutcome {
    pub added: u64,
    pub duplicates: u64,
}

/// Group fields for import; ids and timestamps are assigned by storage.
#[derive(Debug, Clone)]
pub struct GroupInsert {
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub group_type: String,
    pub channel_type: String,
    pub upstreams: JsonValue,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    pub param_overrides: JsonValue,
    pub config_json: JsonValue,
    pub header_rules: JsonValue,
    pub path_redirects: JsonValue,
    pub model_redirect_map: JsonValue,
    pub model_redirect_strict: bool,
    pub proxy_keys: JsonValue,
    pub model_group_priority: i32,
    pub weight: i32,
    pub custom_models: JsonValue,
    pub cc_support: bool,
    pub sort: i32,
}

#[derive(Debug, Clone)]
pub struct RequestLogInsert {
    pub at: OffsetDateTime,
    pub group_id: Option<GroupId>,
    pub key_id: Option<KeyId>,
    pub request_type: &'static str,
    pub attempt: i32,
    pub success: bool,
    pub status_code: Option<i32>,
    pub latency_ms: i64,
    pub model: Option<String>,
    pub upstream_url: Option<String>,
    pub error_class: Option<&'static str>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HourlyStatDelta {
    pub group_id: GroupId,
    pub hour: OffsetDateTime,
    pub success_count: i64,
    pub failure_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/// Storage is used for:
/// - bootstrap and cache reloads (catalog reads)
/// - key pool reconciliation and status persistence
/// - the async request-log sink (batch appends)
///
/// The request hot path never reads the DB; it reads in-memory snapshots and
/// the store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0). Runs once at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_system_settings(&self) -> StorageResult<Option<SystemSettings>>;
    async fn upsert_system_settings(&self, settings: &SystemSettings) -> StorageResult<()>;

    async fn load_catalog(&self) -> StorageResult<CatalogSnapshot>;

    // Keys
    async fn load_group_keys(&self, group_id: GroupId) -> StorageResult<Vec<ApiKeyRow>>;
    async fn set_key_status(
        &self,
        key_id: KeyId,
        status: KeyStatus,
        failure_count: i64,
    ) -> StorageResult<()>;
    /// Move every key of the group currently in `from` to `to`, resetting
    /// failure counts. Returns the number of rows changed.
    async fn set_group_key_statuses(
        &self,
        group_id: GroupId,
        from: KeyStatus,
        to: KeyStatus,
    ) -> StorageResult<u64>;
    async fn touch_key_used(&self, key_id: KeyId) -> StorageResult<()>;
    async fn insert_keys(
        &self,
        group_id: GroupId,
        keys: &[NewApiKey],
    ) -> StorageResult<InsertKeysOutcome>;
    async fn delete_group_keys(
        &self,
        group_id: GroupId,
        status: Option<KeyStatus>,
    ) -> StorageResult<u64>;

    // Groups (import path only; admin CRUD lives outside the core)
    async fn group_name_exists(&self, name: &str) -> StorageResult<bool>;
    async fn insert_group(&self, group: GroupInsert) -> StorageResult<GroupId>;
    async fn insert_sub_groups(
        &self,
        group_id: GroupId,
        members: &[(GroupId, i64)],
    ) -> StorageResult<()>;
    async fn find_group_id_by_name(&self, name: &str) -> StorageResult<Option<GroupId>>;

    // Request logs
    async fn append_request_logs(&self, rows: &[RequestLogInsert]) -> StorageResult<()>;
    async fn add_hourly_stats(&self, rows: &[HourlyStatDelta]) -> StorageResult<()>;
}
