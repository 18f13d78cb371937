use serde::{Deserialize, Serialize};

/// Process-wide request-path defaults. Groups may override any field through
/// their `config_json` patch; the merged result is an [`EffectiveConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Consecutive counted failures before a key is quarantined.
    pub blacklist_threshold: u32,
    /// Retries after the first attempt inside the proxy executor.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_request_size_kb: u64,
    /// Minimum health score a group must hold to stay hub-selectable.
    pub health_threshold: f64,
    /// Total wall-time budget across all attempts of one request.
    pub request_timeout_ms: u64,
    /// 0 disables the per-key concurrency cap.
    pub max_concurrency_per_key: u32,
    pub connect_timeout_ms: u64,
    pub response_header_timeout_ms: u64,
    pub key_validation_interval_secs: u64,
    pub weight_decay_interval_secs: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            blacklist_threshold: 3,
            max_retries: 3,
            retry_delay_ms: 500,
            max_request_size_kb: 4096,
            health_threshold: 0.5,
            request_timeout_ms: 600_000,
            max_concurrency_per_key: 0,
            connect_timeout_ms: 5_000,
            response_header_timeout_ms: 60_000,
            key_validation_interval_secs: 1_800,
            weight_decay_interval_secs: 60,
        }
    }
}

/// The settings actually applied to one group's requests.
pub type EffectiveConfig = SystemSettings;

/// Per-group override patch parsed from `groups.config_json`. Unknown fields
/// are rejected so admin typos surface at write time instead of silently
/// falling back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfigPatch {
    pub blacklist_threshold: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_request_size_kb: Option<u64>,
    pub health_threshold: Option<f64>,
    pub request_timeout_ms: Option<u64>,
    pub max_concurrency_per_key: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub response_header_timeout_ms: Option<u64>,
    pub key_validation_interval_secs: Option<u64>,
    pub weight_decay_interval_secs: Option<u64>,
}

impl GroupConfigPatch {
    pub fn apply(&self, base: &SystemSettings) -> EffectiveConfig {
        let mut out = base.clone();
        if let Some(v) = self.blacklist_threshold {
            out.blacklist_threshold = v;
        }
        if let Some(v) = self.max_retries {
            out.max_retries = v;
        }
        if let Some(v) = self.retry_delay_ms {
            out.retry_delay_ms = v;
        }
        if let Some(v) = self.max_request_size_kb {
            out.max_request_size_kb = v;
        }
        if let Some(v) = self.health_threshold {
            out.health_threshold = v;
        }
        if let Some(v) = self.request_timeout_ms {
            out.request_timeout_ms = v;
        }
        if let Some(v) = self.max_concurrency_per_key {
            out.max_concurrency_per_key = v;
        }
        if let Some(v) = self.connect_timeout_ms {
            out.connect_timeout_ms = v;
        }
        if let Some(v) = self.response_header_timeout_ms {
            out.response_header_timeout_ms = v;
        }
        if let Some(v) = self.key_validation_interval_secs {
            out.key_validation_interval_secs = v;
        }
        if let Some(v) = self.weight_decay_interval_secs {
            out.weight_decay_interval_secs = v;
        }
        out
    }
}
