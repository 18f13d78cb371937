use serde::{Deserialize, Serialize};

mod config;

pub use config::{EffectiveConfig, GroupConfigPatch, SystemSettings};

/// Stable database identity of a group.
pub type GroupId = i64;
/// Stable database identity of an upstream credential.
pub type KeyId = i64;

pub fn new_trace_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Shared store URL (redis://...). None selects the in-process store.
    pub store_url: Option<String>,
    /// Master key the cipher service derives its AEAD key from.
    pub master_key: String,
    /// Tokens accepted by every group's proxy endpoint in addition to the
    /// group's own proxy keys.
    pub global_proxy_keys: Vec<String>,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub store_url: Option<String>,
    pub master_key: Option<String>,
    pub global_proxy_keys: Option<Vec<String>>,
    pub proxy: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.store_url.is_some() {
            self.store_url = other.store_url;
        }
        if other.master_key.is_some() {
            self.master_key = other.master_key;
        }
        if other.global_proxy_keys.is_some() {
            self.global_proxy_keys = other.global_proxy_keys;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3001),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            store_url: self.store_url,
            master_key: self
                .master_key
                .ok_or(GlobalConfigError::MissingField("master_key"))?,
            global_proxy_keys: self.global_proxy_keys.unwrap_or_default(),
            proxy: self.proxy,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            store_url: value.store_url,
            master_key: Some(value.master_key),
            global_proxy_keys: Some(value.global_proxy_keys),
            proxy: value.proxy,
        }
    }
}
