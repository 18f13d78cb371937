use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use poolgate_channel::{ChannelType, HeaderRule, PathRedirect};
use poolgate_common::{EffectiveConfig, GroupConfigPatch, GroupId, SystemSettings};
use poolgate_storage::{GroupRow, SubGroupRow};

use crate::cipher::fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    Standard,
    Aggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub model: String,
    #[serde(default = "default_target_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_target_weight() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRedirectRule {
    pub targets: Vec<RedirectTarget>,
}

#[derive(Debug, Clone, Copy)]
pub struct SubGroupRef {
    pub group_id: GroupId,
    pub weight: i64,
}

/// Denormalized runtime view of one group, materialized from catalog rows.
/// Everything the hot path needs is pre-parsed here so lookups never touch
/// the database.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub group_type: GroupType,
    pub channel_type: ChannelType,
    pub upstreams: Vec<Upstream>,
    pub test_model: String,
    pub validation_endpoint: Option<String>,
    pub param_overrides: Map<String, JsonValue>,
    pub config: EffectiveConfig,
    pub header_rules: Vec<HeaderRule>,
    pub path_redirects: Vec<PathRedirect>,
    pub model_redirect_map: HashMap<String, ModelRedirectRule>,
    pub model_redirect_strict: bool,
    /// Fingerprints of the tokens allowed on this group's proxy endpoint.
    pub proxy_key_hashes: HashSet<String>,
    pub model_group_priority: i32,
    pub weight: i32,
    pub custom_models: Vec<String>,
    pub cc_support: bool,
    pub sub_groups: Vec<SubGroupRef>,
}

impl Group {
    /// Parse a catalog row. Malformed JSON columns degrade to empty values
    /// rather than poisoning the whole snapshot; the bad column is logged.
    pub fn from_row(row: &GroupRow, sub_rows: &[SubGroupRow], defaults: &SystemSettings) -> Self {
        let group_type = match row.group_type.as_str() {
            "aggregate" => GroupType::Aggregate,
            _ => GroupType::Standard,
        };
        let channel_type =
            ChannelType::parse(&row.channel_type).unwrap_or(ChannelType::OpenAI);

        let patch: GroupConfigPatch = parse_column(&row.config_json, row.id, "config_json");
        let proxy_keys: Vec<String> = parse_column(&row.proxy_keys, row.id, "proxy_keys");

        Self {
            id: row.id,
            name: row.name.clone(),
            display_name: row.display_name.clone(),
            enabled: row.enabled,
            group_type,
            channel_type,
            upstreams: parse_column(&row.upstreams, row.id, "upstreams"),
            test_model: row.test_model.clone(),
            validation_endpoint: row.validation_endpoint.clone(),
            param_overrides: parse_column(&row.param_overrides, row.id, "param_overrides"),
            config: patch.apply(defaults),
            header_rules: parse_column(&row.header_rules, row.id, "header_rules"),
            path_redirects: parse_column(&row.path_redirects, row.id, "path_redirects"),
            model_redirect_map: parse_column(&row.model_redirect_map, row.id, "model_redirect_map"),
            model_redirect_strict: row.model_redirect_strict,
            proxy_key_hashes: proxy_keys.iter().map(|k| fingerprint(k)).collect(),
            model_group_priority: row.model_group_priority,
            weight: row.weight,
            custom_models: parse_column(&row.custom_models, row.id, "custom_models"),
            cc_support: row.cc_support,
            sub_groups: sub_rows
                .iter()
                .filter(|s| s.group_id == row.id)
                .map(|s| SubGroupRef {
                    group_id: s.sub_group_id,
                    weight: s.weight,
                })
                .collect(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.group_type == GroupType::Aggregate
    }

    /// Weighted-random upstream base URL for one attempt.
    pub fn pick_upstream(&self, rng: &mut impl rand::Rng) -> Option<&str> {
        if self.upstreams.is_empty() {
            return None;
        }
        let total: u64 = self.upstreams.iter().map(|u| u.weight.max(1) as u64).sum();
        let mut draw = rng.random_range(0..total);
        for upstream in &self.upstreams {
            let weight = upstream.weight.max(1) as u64;
            if draw < weight {
                return Some(upstream.url.as_str());
            }
            draw -= weight;
        }
        self.upstreams.first().map(|u| u.url.as_str())
    }

    /// Models this group offers to the hub: its test model, every redirect
    /// source and enabled target, plus the aggregate custom-models list.
    pub fn offered_models(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        if !self.test_model.is_empty() {
            out.insert(self.test_model.clone());
        }
        for (source, rule) in &self.model_redirect_map {
            out.insert(source.clone());
            for target in &rule.targets {
                if target.enabled {
                    out.insert(target.model.clone());
                }
            }
        }
        for model in &self.custom_models {
            out.insert(model.clone());
        }
        out
    }
}

fn parse_column<T: serde::de::DeserializeOwned + Default>(
    value: &JsonValue,
    group_id: GroupId,
    column: &'static str,
) -> T {
    if value.is_null() {
        return T::default();
    }
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(group_id, column, error = %err, "malformed group column, using default");
            T::default()
        }
    }
}
