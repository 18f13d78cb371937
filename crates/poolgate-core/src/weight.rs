use poolgate_common::GroupId;
use poolgate_store::SharedStore;
use time::OffsetDateTime;

use crate::group::RedirectTarget;

#[derive(Debug, thiserror::Error)]
pub enum WeightError {
    #[error(transparent)]
    Store(#[from] poolgate_store::StoreError),
}

/// EWMA smoothing factor per sample.
const ALPHA: f64 = 0.2;
/// Samples with no update for longer than this start decaying toward 1.0.
const STALE_AFTER_SECS: i64 = 15 * 60;
/// Optimistic recovery rate, health per minute.
const DECAY_PER_MIN: f64 = 0.05;
/// Health is stored as an integer, scaled by this factor.
const SCALE: f64 = 1_000_000.0;
/// Triples idle this long are dropped by the decay loop.
const DROP_AFTER_SECS: i64 = 24 * 3600;

/// Triple used for the group-wide health rollup (no redirect context).
pub const GROUP_ROLLUP: &str = "*";

const INDEX_KEY: &str = "weight:index";

fn triple_key(group_id: GroupId, source: &str, target: &str) -> String {
    format!("weight:{group_id}:{source}:{target}")
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    successes: i64,
    failures: i64,
    ewma: f64,
    last_success_at: i64,
    last_failure_at: i64,
}

impl Sample {
    fn last_update(&self) -> i64 {
        self.last_success_at.max(self.last_failure_at)
    }
}

/// Sliding health score per (group, source model, target model), kept in the
/// store so peer instances share one view. Readers may observe slightly
/// stale values; that is acceptable by design.
pub struct WeightEngine {
    store: SharedStore,
}

impl WeightEngine {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Fold one final-attempt outcome into the triple's EWMA.
    pub async fn record(
        &self,
        group_id: GroupId,
        source: &str,
        target: &str,
        success: bool,
        now: OffsetDateTime,
    ) -> Result<(), WeightError> {
        let key = triple_key(group_id, source, target);
        let sample = self.read_sample(&key).await?;

        let outcome = if success { 1.0 } else { 0.0 };
        let ewma = ALPHA * outcome + (1.0 - ALPHA) * sample.ewma;
        let ts = now.unix_timestamp();

        let mut fields = vec![("ewma".to_string(), ((ewma * SCALE) as i64).to_string())];
        if success {
            fields.push(("s".to_string(), (sample.successes + 1).to_string()));
            fields.push(("ts".to_string(), ts.to_string()));
        } else {
            fields.push(("f".to_string(), (sample.failures + 1).to_string()));
            fields.push(("tf".to_string(), ts.to_string()));
        }
        self.store.hset_multi(&key, &fields).await?;
        self.store.sadd(INDEX_KEY, &key).await?;
        Ok(())
    }

    /// Current health in [0, 1]. Unobserved triples are optimistically 1.0;
    /// stale triples decay toward 1.0 so a quiet target gets another chance.
    pub async fn health(
        &self,
        group_id: GroupId,
        source: &str,
        target: &str,
        now: OffsetDateTime,
    ) -> Result<f64, WeightError> {
        let sample = self.read_sample(&triple_key(group_id, source, target)).await?;
        Ok(decayed_health(&sample, now))
    }

    pub async fn group_health(
        &self,
        group_id: GroupId,
        now: OffsetDateTime,
    ) -> Result<f64, WeightError> {
        self.health(group_id, GROUP_ROLLUP, GROUP_ROLLUP, now).await
    }

    /// `base_weight × health` when enabled, else 0.
    pub async fn effective_weight(
        &self,
        group_id: GroupId,
        source: &str,
        target: &RedirectTarget,
        now: OffsetDateTime,
    ) -> Result<f64, WeightError> {
        if !target.enabled {
            return Ok(0.0);
        }
        let health = self.health(group_id, source, &target.model, now).await?;
        Ok(target.weight as f64 * health)
    }

    /// Weighted pick among a redirect rule's targets. When every effective
    /// weight is zero: non-strict rules fall back to base weights among
    /// enabled targets, strict rules yield nothing.
    pub async fn pick_redirect_target(
        &self,
        group_id: GroupId,
        source: &str,
        targets: &[RedirectTarget],
        strict: bool,
        now: OffsetDateTime,
    ) -> Result<Option<String>, WeightError> {
        let mut weighted = Vec::with_capacity(targets.len());
        for target in targets {
            let weight = self.effective_weight(group_id, source, target, now).await?;
            weighted.push((target, weight));
        }

        if weighted.iter().all(|(_, w)| *w <= 0.0) {
            if strict {
                return Ok(None);
            }
            for (target, weight) in &mut weighted {
                *weight = if target.enabled {
                    target.weight as f64
                } else {
                    0.0
                };
            }
        }

        let mut rng = rand::rng();
        Ok(weighted_pick(&weighted, &mut rng).map(|t| t.model.clone()))
    }

    /// Periodic pass over every known triple: persist the lazy decay and drop
    /// long-idle entries.
    pub async fn decay_stale(&self, now: OffsetDateTime) -> Result<usize, WeightError> {
        let keys = self.store.smembers(INDEX_KEY).await?;
        let mut touched = 0;
        for key in keys {
            let sample = self.read_sample(&key).await?;
            if sample.last_update() == 0 {
                continue;
            }
            let idle = now.unix_timestamp() - sample.last_update();
            if idle > DROP_AFTER_SECS {
                self.store.del(&key).await?;
                self.store.srem(INDEX_KEY, &key).await?;
                touched += 1;
                continue;
            }
            let decayed = decayed_health(&sample, now);
            if decayed > sample.ewma {
                self.store
                    .hset_multi(
                        &key,
                        &[("ewma".to_string(), ((decayed * SCALE) as i64).to_string())],
                    )
                    .await?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn read_sample(&self, key: &str) -> Result<Sample, WeightError> {
        let fields = self.store.hget_all(key).await?;
        let get = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());
        Ok(Sample {
            successes: get("s").unwrap_or(0),
            failures: get("f").unwrap_or(0),
            ewma: get("ewma").map(|v| v as f64 / SCALE).unwrap_or(1.0),
            last_success_at: get("ts").unwrap_or(0),
            last_failure_at: get("tf").unwrap_or(0),
        })
    }
}

fn decayed_health(sample: &Sample, now: OffsetDateTime) -> f64 {
    let last = sample.last_update();
    if last == 0 {
        return 1.0;
    }
    let idle = now.unix_timestamp() - last;
    if idle <= STALE_AFTER_SECS {
        return sample.ewma.clamp(0.0, 1.0);
    }
    let minutes_over = (idle - STALE_AFTER_SECS) as f64 / 60.0;
    (sample.ewma + minutes_over * DECAY_PER_MIN).clamp(0.0, 1.0)
}

/// Standard prefix-sum draw over `(item, weight)` pairs.
pub fn weighted_pick<'a, T>(items: &'a [(T, f64)], rng: &mut impl rand::Rng) -> Option<&'a T> {
    let total: f64 = items.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let mut draw = rng.random_range(0.0..total);
    for (item, weight) in items {
        let weight = weight.max(0.0);
        if draw < weight {
            return Some(item);
        }
        draw -= weight;
    }
    items.last().map(|(item, _)| item)
}
