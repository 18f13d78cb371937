//! Key validation: on-demand probes and the background sweep that restores
//! quarantined keys and canaries active ones.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::{Semaphore, watch};

use poolgate_channel::{ChannelAdapter, RelayFormat, ValidationProbe};
use poolgate_storage::{ApiKeyRow, KeyStatus};

use crate::classify::{AttemptFailure, ErrorClass, classify};
use crate::group::Group;
use crate::state::AppState;
use crate::upstream::UpstreamBody;

/// Result of probing one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Valid,
    Invalid,
    /// Transient upstream trouble; the key's standing is left unchanged.
    Inconclusive,
}

const SWEEP_SAMPLE_INVALID: usize = 10;
const SWEEP_SAMPLE_ACTIVE: usize = 5;
const SWEEP_CONCURRENCY: usize = 8;

pub struct ValidationService {
    state: Arc<AppState>,
}

impl ValidationService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Probe one key with the group's validation request and apply the
    /// verdict to the pool.
    pub async fn validate_key(&self, group: &Group, row: &ApiKeyRow) -> ProbeVerdict {
        let Ok(plain) = self.state.cipher.decrypt(&row.key_value) else {
            tracing::warn!(key_id = row.id, "validation skipped, key not decryptable");
            return ProbeVerdict::Inconclusive;
        };

        let verdict = self.probe(group, &plain).await;
        match (verdict, row.status) {
            (ProbeVerdict::Valid, KeyStatus::Invalid) => {
                if let Err(err) = self.state.keys.restore_key(group.id, row.id).await {
                    tracing::warn!(key_id = row.id, error = %err, "restore after probe failed");
                }
            }
            (ProbeVerdict::Invalid, KeyStatus::Active) => {
                let failures = self
                    .state
                    .keys
                    .failure_count(group.id, row.id)
                    .await
                    .unwrap_or(0);
                if let Err(err) = self
                    .state
                    .keys
                    .quarantine(group.id, row.id, failures.max(1))
                    .await
                {
                    tracing::warn!(key_id = row.id, error = %err, "quarantine after probe failed");
                }
            }
            _ => {}
        }
        verdict
    }

    /// Probe every key of a group with bounded concurrency. Returns
    /// (valid, invalid, inconclusive) counts.
    pub async fn validate_group(&self, group: Arc<Group>) -> (usize, usize, usize) {
        let rows = match self.state.storage.load_group_keys(group.id).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(group = %group.name, error = %err, "group validation aborted");
                return (0, 0, 0);
            }
        };

        let semaphore = Arc::new(Semaphore::new(SWEEP_CONCURRENCY));
        let mut handles = Vec::with_capacity(rows.len());
        for row in rows {
            let service = Self {
                state: self.state.clone(),
            };
            let group = group.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                service.validate_key(&group, &row).await
            }));
        }

        let mut tally = (0, 0, 0);
        for handle in handles {
            match handle.await {
                Ok(ProbeVerdict::Valid) => tally.0 += 1,
                Ok(ProbeVerdict::Invalid) => tally.1 += 1,
                Ok(ProbeVerdict::Inconclusive) | Err(_) => tally.2 += 1,
            }
        }
        tally
    }

    async fn probe(&self, group: &Group, api_key: &str) -> ProbeVerdict {
        let adapter = match ChannelAdapter::dispatch(group.channel_type, RelayFormat::Unknown) {
            Ok(adapter) => adapter,
            Err(_) => return ProbeVerdict::Inconclusive,
        };
        let base_url = {
            let mut rng = rand::rng();
            match group.pick_upstream(&mut rng) {
                Some(url) => url.to_string(),
                None => return ProbeVerdict::Inconclusive,
            }
        };
        let request = match adapter.build_validation_request(&ValidationProbe {
            base_url: &base_url,
            test_model: &group.test_model,
            validation_endpoint: group.validation_endpoint.as_deref(),
            api_key,
        }) {
            Ok(request) => request,
            Err(_) => return ProbeVerdict::Inconclusive,
        };

        match self.state.client.send(request).await {
            Ok(response) if (200..300).contains(&response.status) => ProbeVerdict::Valid,
            Ok(response) => {
                let body = match response.body {
                    UpstreamBody::Full(bytes) => bytes,
                    UpstreamBody::Stream(_) => bytes::Bytes::new(),
                };
                let class = classify(&AttemptFailure::Http {
                    status: response.status,
                    body,
                });
                if class == ErrorClass::FatalKey {
                    ProbeVerdict::Invalid
                } else {
                    ProbeVerdict::Inconclusive
                }
            }
            Err(_) => ProbeVerdict::Inconclusive,
        }
    }
}

/// Periodic sweep: sample quarantined keys for restoration and active keys
/// as canaries, per group, until shutdown.
pub async fn validation_sweep(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let service = ValidationService::new(state.clone());
    loop {
        let interval =
            Duration::from_secs(state.manager.defaults().key_validation_interval_secs.max(60));
        // Jitter spreads sweeps across peer instances sharing a store.
        let jitter = {
            let mut rng = rand::rng();
            Duration::from_secs(rng.random_range(0..interval.as_secs().max(1) / 10 + 1))
        };
        tokio::select! {
            _ = tokio::time::sleep(interval + jitter) => {}
            _ = shutdown.changed() => return,
        }

        let snapshot = state.manager.snapshot();
        for group in snapshot.by_id.values() {
            if !group.enabled || group.is_aggregate() {
                continue;
            }
            let rows = match state.storage.load_group_keys(group.id).await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(group = %group.name, error = %err, "sweep load failed");
                    continue;
                }
            };

            let mut invalid: Vec<ApiKeyRow> = rows
                .iter()
                .filter(|r| r.status == KeyStatus::Invalid)
                .cloned()
                .collect();
            let mut active: Vec<ApiKeyRow> = rows
                .iter()
                .filter(|r| r.status == KeyStatus::Active)
                .cloned()
                .collect();
            {
                let mut rng = rand::rng();
                invalid.shuffle(&mut rng);
                active.shuffle(&mut rng);
            }
            invalid.truncate(SWEEP_SAMPLE_INVALID);
            active.truncate(SWEEP_SAMPLE_ACTIVE);

            for row in invalid.into_iter().chain(active) {
                if *shutdown.borrow() {
                    return;
                }
                service.validate_key(group, &row).await;
            }
        }
    }
}
