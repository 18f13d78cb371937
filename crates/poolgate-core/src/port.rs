//! Catalog portability: bulk key import, group export/import, and the
//! string-map codec for model-redirect rules.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

use poolgate_common::GroupId;
use poolgate_storage::{GroupInsert, InsertKeysOutcome, NewApiKey, Storage};

use crate::cipher::{Cipher, fingerprint};
use crate::group::{ModelRedirectRule, RedirectTarget};

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error(transparent)]
    Storage(#[from] poolgate_storage::StorageError),
    #[error("group {0} not found")]
    GroupNotFound(String),
    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// Split a pasted blob into candidate key values: newline/comma/whitespace
/// separated, trimmed, order-preserving dedup.
pub fn parse_key_blob(blob: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    blob.split(['\n', '\r', ',', ' ', '\t'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_string()))
        .map(str::to_string)
        .collect()
}

/// Encrypt and insert keys parsed from a text blob. Duplicates (by
/// fingerprint within the group) are skipped by the storage layer.
pub async fn import_keys(
    storage: &Arc<dyn Storage>,
    cipher: &Cipher,
    group_id: GroupId,
    blob: &str,
) -> Result<InsertKeysOutcome, PortError> {
    let mut rows = Vec::new();
    for key in parse_key_blob(blob) {
        let sealed = cipher
            .encrypt(&key)
            .map_err(|err| PortError::Cipher(err.to_string()))?;
        rows.push(NewApiKey {
            key_value: sealed,
            key_hash: fingerprint(&key),
            notes: None,
        });
    }
    Ok(storage.insert_keys(group_id, &rows).await?)
}

/// Self-contained group document. Keys travel decrypted so the document can
/// move between deployments with different master keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupExport {
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub group_type: String,
    pub channel_type: String,
    pub upstreams: serde_json::Value,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    pub param_overrides: serde_json::Value,
    pub config_json: serde_json::Value,
    pub header_rules: serde_json::Value,
    pub path_redirects: serde_json::Value,
    pub model_redirect_rules: HashMap<String, String>,
    pub model_redirect_strict: bool,
    pub proxy_keys: serde_json::Value,
    pub model_group_priority: i32,
    pub weight: i32,
    pub custom_models: serde_json::Value,
    pub cc_support: bool,
    pub keys: Vec<String>,
    /// Aggregate membership by member group name.
    pub sub_groups: Vec<ExportedSubGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedSubGroup {
    pub name: String,
    pub weight: i64,
}

pub async fn export_group(
    storage: &Arc<dyn Storage>,
    cipher: &Cipher,
    name: &str,
) -> Result<GroupExport, PortError> {
    let catalog = storage.load_catalog().await?;
    let row = catalog
        .groups
        .iter()
        .find(|g| g.name == name)
        .ok_or_else(|| PortError::GroupNotFound(name.to_string()))?;

    let mut keys = Vec::new();
    for key_row in storage.load_group_keys(row.id).await? {
        let plain = cipher
            .decrypt(&key_row.key_value)
            .map_err(|err| PortError::Cipher(err.to_string()))?;
        keys.push(plain);
    }

    let by_id: HashMap<GroupId, &str> = catalog
        .groups
        .iter()
        .map(|g| (g.id, g.name.as_str()))
        .collect();
    let sub_groups = catalog
        .sub_groups
        .iter()
        .filter(|s| s.group_id == row.id)
        .filter_map(|s| {
            by_id.get(&s.sub_group_id).map(|name| ExportedSubGroup {
                name: (*name).to_string(),
                weight: s.weight,
            })
        })
        .collect();

    let rules: HashMap<String, ModelRedirectRule> =
        serde_json::from_value(row.model_redirect_map.clone()).unwrap_or_default();

    Ok(GroupExport {
        name: row.name.clone(),
        display_name: row.display_name.clone(),
        enabled: row.enabled,
        group_type: row.group_type.clone(),
        channel_type: row.channel_type.clone(),
        upstreams: row.upstreams.clone(),
        test_model: row.test_model.clone(),
        validation_endpoint: row.validation_endpoint.clone(),
        param_overrides: row.param_overrides.clone(),
        config_json: row.config_json.clone(),
        header_rules: row.header_rules.clone(),
        path_redirects: row.path_redirects.clone(),
        model_redirect_rules: convert_model_redirect_rules_to_export(&rules),
        model_redirect_strict: row.model_redirect_strict,
        proxy_keys: row.proxy_keys.clone(),
        model_group_priority: row.model_group_priority,
        weight: row.weight,
        custom_models: row.custom_models.clone(),
        cc_support: row.cc_support,
        keys,
        sub_groups,
    })
}

/// Recreate an exported group. On name collision both `name` and
/// `display_name` get the same random suffix. Returns the new group id.
pub async fn import_group(
    storage: &Arc<dyn Storage>,
    cipher: &Cipher,
    export: &GroupExport,
) -> Result<GroupId, PortError> {
    let (name, display_name) = if storage.group_name_exists(&export.name).await? {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let suffix = suffix.to_lowercase();
        (
            format!("{}-{suffix}", export.name),
            format!("{}-{suffix}", export.display_name),
        )
    } else {
        (export.name.clone(), export.display_name.clone())
    };

    let rules = convert_model_redirect_rules_to_import(&export.model_redirect_rules);
    let group_id = storage
        .insert_group(GroupInsert {
            name,
            display_name,
            enabled: export.enabled,
            group_type: export.group_type.clone(),
            channel_type: export.channel_type.clone(),
            upstreams: export.upstreams.clone(),
            test_model: export.test_model.clone(),
            validation_endpoint: export.validation_endpoint.clone(),
            param_overrides: export.param_overrides.clone(),
            config_json: export.config_json.clone(),
            header_rules: export.header_rules.clone(),
            path_redirects: export.path_redirects.clone(),
            model_redirect_map: serde_json::to_value(&rules).unwrap_or_default(),
            model_redirect_strict: export.model_redirect_strict,
            proxy_keys: export.proxy_keys.clone(),
            model_group_priority: export.model_group_priority,
            weight: export.weight,
            custom_models: export.custom_models.clone(),
            cc_support: export.cc_support,
            sort: 0,
        })
        .await?;

    let mut key_rows = Vec::with_capacity(export.keys.len());
    for key in &export.keys {
        let sealed = cipher
            .encrypt(key)
            .map_err(|err| PortError::Cipher(err.to_string()))?;
        key_rows.push(NewApiKey {
            key_value: sealed,
            key_hash: fingerprint(key),
            notes: None,
        });
    }
    storage.insert_keys(group_id, &key_rows).await?;

    let mut members = Vec::new();
    for sub in &export.sub_groups {
        if let Some(member_id) = storage.find_group_id_by_name(&sub.name).await? {
            members.push((member_id, sub.weight));
        }
    }
    storage.insert_sub_groups(group_id, &members).await?;

    Ok(group_id)
}

/// Redirect rules as a flat string map: targets joined by `,`, each encoded
/// `model*weight`, disabled targets prefixed with `-`.
pub fn convert_model_redirect_rules_to_export(
    rules: &HashMap<String, ModelRedirectRule>,
) -> HashMap<String, String> {
    rules
        .iter()
        .map(|(source, rule)| {
            let encoded = rule
                .targets
                .iter()
                .map(|t| {
                    let prefix = if t.enabled { "" } else { "-" };
                    format!("{prefix}{}*{}", t.model, t.weight)
                })
                .collect::<Vec<_>>()
                .join(",");
            (source.clone(), encoded)
        })
        .collect()
}

pub fn convert_model_redirect_rules_to_import(
    rules: &HashMap<String, String>,
) -> HashMap<String, ModelRedirectRule> {
    rules
        .iter()
        .map(|(source, encoded)| {
            let targets = encoded
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .filter_map(|part| {
                    let (enabled, part) = match part.strip_prefix('-') {
                        Some(rest) => (false, rest),
                        None => (true, part),
                    };
                    let (model, weight) = part.split_once('*')?;
                    Some(RedirectTarget {
                        model: model.to_string(),
                        weight: weight.parse().ok()?,
                        enabled,
                    })
                })
                .collect();
            (source.clone(), ModelRedirectRule { targets })
        })
        .collect()
}
