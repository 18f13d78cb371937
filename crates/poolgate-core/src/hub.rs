use std::sync::Arc;

use time::OffsetDateTime;

use poolgate_channel::{ChannelType, RelayFormat};
use poolgate_common::GroupId;

use crate::error::ProxyError;
use crate::group::{Group, GroupType};
use crate::manager::HubKeyEntry;
use crate::state::AppState;
use crate::weight::weighted_pick;

/// Inputs the selector needs about one inbound hub request.
pub struct HubRequest<'a> {
    pub model: &'a str,
    pub format: RelayFormat,
    pub body_size: usize,
    pub access_key: &'a HubKeyEntry,
}

/// Model-addressed group selection: candidate assembly from the model-pool
/// index, eliminative filters, priority tiering, then a health-weighted draw
/// preferring native channels.
pub struct HubSelector {
    state: Arc<AppState>,
}

impl HubSelector {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn select(
        &self,
        request: &HubRequest<'_>,
        exclude: Option<GroupId>,
    ) -> Result<Arc<Group>, ProxyError> {
        if request.model.is_empty() {
            return Err(ProxyError::bad_request("missing model"));
        }
        if let Some(allowed) = &request.access_key.allowed_models
            && !allowed.contains(request.model)
        {
            return Err(ProxyError::forbidden(format!(
                "model {} not allowed for this access key",
                request.model
            )));
        }

        let snapshot = self.state.manager.snapshot();
        let Some(candidate_ids) = snapshot.model_pool.get(request.model) else {
            return Err(ProxyError::not_found(format!(
                "no group offers model {}",
                request.model
            )));
        };

        let now = OffsetDateTime::now_utc();
        let mut survivors: Vec<(Arc<Group>, f64)> = Vec::new();
        for id in candidate_ids {
            if Some(*id) == exclude {
                continue;
            }
            let Some(group) = snapshot.by_id.get(id) else {
                continue;
            };
            if !group.enabled {
                continue;
            }
            if !group.channel_type.is_compatible(request.format) {
                continue;
            }
            // Claude traffic on a foreign channel needs the group to opt in.
            if request.format == RelayFormat::Claude
                && group.channel_type != ChannelType::Anthropic
                && !group.cc_support
            {
                continue;
            }
            if group.is_aggregate()
                && request.body_size as u64 > group.config.max_request_size_kb * 1024
            {
                continue;
            }
            let health = self
                .state
                .weights
                .group_health(group.id, now)
                .await
                .unwrap_or(1.0);
            if health < group.config.health_threshold {
                continue;
            }
            if !self.is_ready(group).await {
                continue;
            }
            survivors.push((group.clone(), health));
        }

        if survivors.is_empty() {
            return Err(ProxyError::no_healthy_group(format!(
                "no healthy group for model {}",
                request.model
            )));
        }

        // First non-empty priority tier wins; lower value is earlier.
        let best_priority = survivors
            .iter()
            .map(|(group, _)| group.model_group_priority)
            .min()
            .unwrap_or(0);
        let tier: Vec<(Arc<Group>, f64)> = survivors
            .into_iter()
            .filter(|(group, _)| group.model_group_priority == best_priority)
            .collect();

        // Native channels beat compatible ones inside the tier.
        let natives: Vec<(Arc<Group>, f64)> = tier
            .iter()
            .filter(|(group, _)| group.channel_type.is_native(request.format))
            .cloned()
            .collect();
        let bucket = if natives.is_empty() { tier } else { natives };

        let weighted: Vec<(Arc<Group>, f64)> = bucket
            .into_iter()
            .map(|(group, health)| {
                let weight = group.weight.max(1) as f64 * health;
                (group, weight)
            })
            .collect();

        let mut rng = rand::rng();
        weighted_pick(&weighted, &mut rng)
            .cloned()
            .ok_or_else(|| {
                ProxyError::no_healthy_group(format!(
                    "no healthy group for model {}",
                    request.model
                ))
            })
    }

    /// Standard groups need at least one active key; aggregates need at
    /// least one selectable member (one level deep).
    async fn is_ready(&self, group: &Group) -> bool {
        match group.group_type {
            GroupType::Standard => self
                .state
                .keys
                .active_count(group.id)
                .await
                .map(|n| n > 0)
                .unwrap_or(false),
            GroupType::Aggregate => {
                let snapshot = self.state.manager.snapshot();
                for sub in &group.sub_groups {
                    let Some(member) = snapshot.by_id.get(&sub.group_id) else {
                        continue;
                    };
                    if member.is_aggregate() || !member.enabled {
                        continue;
                    }
                    if self
                        .state
                        .keys
                        .active_count(member.id)
                        .await
                        .map(|n| n > 0)
                        .unwrap_or(false)
                    {
                        return true;
                    }
                }
                false
            }
        }
    }
}
