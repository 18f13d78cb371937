use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use poolgate_core::{RedirectTarget, WeightEngine, weighted_pick};
use poolgate_store::MemoryStore;
use time::OffsetDateTime;

fn engine() -> WeightEngine {
    WeightEngine::new(Arc::new(MemoryStore::new()))
}

fn target(model: &str, weight: u32, enabled: bool) -> RedirectTarget {
    RedirectTarget {
        model: model.to_string(),
        weight,
        enabled,
    }
}

#[tokio::test]
async fn unobserved_triple_is_optimistically_healthy() {
    let engine = engine();
    let now = OffsetDateTime::now_utc();
    let health = engine.health(1, "m", "m", now).await.unwrap();
    assert_eq!(health, 1.0);
}

#[tokio::test]
async fn failures_drag_health_down_and_successes_recover_it() {
    let engine = engine();
    let now = OffsetDateTime::now_utc();

    for _ in 0..10 {
        engine.record(1, "m", "m", false, now).await.unwrap();
    }
    let low = engine.health(1, "m", "m", now).await.unwrap();
    assert!(low < 0.2, "after 10 failures health was {low}");

    for _ in 0..10 {
        engine.record(1, "m", "m", true, now).await.unwrap();
    }
    let recovered = engine.health(1, "m", "m", now).await.unwrap();
    assert!(recovered > 0.8, "after recovery health was {recovered}");
}

#[tokio::test]
async fn stale_samples_decay_toward_optimism() {
    let engine = engine();
    let past = OffsetDateTime::now_utc() - Duration::from_secs(3600);

    for _ in 0..10 {
        engine.record(1, "m", "m", false, past).await.unwrap();
    }
    // 45 minutes past the 15-minute staleness horizon: +0.05/min floors the
    // score back at 1.0.
    let now = past + Duration::from_secs(3600);
    let health = engine.health(1, "m", "m", now).await.unwrap();
    assert_eq!(health, 1.0);

    // Half-way through the decay window the score sits between.
    let mid = past + Duration::from_secs(15 * 60 + 300);
    let health = engine.health(1, "m", "m", mid).await.unwrap();
    assert!(health > 0.2 && health < 1.0, "mid-decay health was {health}");
}

#[tokio::test]
async fn disabled_target_has_zero_effective_weight() {
    let engine = engine();
    let now = OffsetDateTime::now_utc();
    let weight = engine
        .effective_weight(1, "quick", &target("b", 100, false), now)
        .await
        .unwrap();
    assert_eq!(weight, 0.0);
}

#[tokio::test]
async fn redirect_pick_always_lands_on_the_only_enabled_target() {
    let engine = engine();
    let now = OffsetDateTime::now_utc();
    let targets = vec![target("a", 100, true), target("b", 100, false)];

    for _ in 0..50 {
        let picked = engine
            .pick_redirect_target(1, "quick", &targets, false, now)
            .await
            .unwrap();
        assert_eq!(picked.as_deref(), Some("a"));
    }
}

#[tokio::test]
async fn strict_rule_with_no_healthy_target_yields_nothing() {
    let engine = engine();
    let now = OffsetDateTime::now_utc();
    let targets = vec![target("a", 100, false)];

    let picked = engine
        .pick_redirect_target(1, "quick", &targets, true, now)
        .await
        .unwrap();
    assert_eq!(picked, None);

    // Non-strict rules fall back to base weights among enabled targets; with
    // none enabled there is still nothing to pick.
    let picked = engine
        .pick_redirect_target(1, "quick", &targets, false, now)
        .await
        .unwrap();
    assert_eq!(picked, None);
}

#[tokio::test]
async fn decay_pass_persists_recovered_scores() {
    let engine = engine();
    let past = OffsetDateTime::now_utc() - Duration::from_secs(7200);
    for _ in 0..10 {
        engine.record(7, "m", "m", false, past).await.unwrap();
    }

    let touched = engine
        .decay_stale(past + Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(touched >= 1);
}

#[test]
fn weighted_pick_is_weight_faithful() {
    let items = vec![("a", 75.0), ("b", 25.0)];
    let mut rng = rand::rng();
    let mut counts: HashMap<&str, u32> = HashMap::new();
    let draws = 10_000;
    for _ in 0..draws {
        let picked = weighted_pick(&items, &mut rng).unwrap();
        *counts.entry(picked).or_default() += 1;
    }
    let a = counts["a"] as f64 / draws as f64;
    // 75/25 split with a tolerance far beyond chi-square noise at this n.
    assert!((a - 0.75).abs() < 0.03, "empirical frequency {a}");
}

#[test]
fn weighted_pick_skips_zero_weights_and_empty_sets() {
    let mut rng = rand::rng();
    let items = vec![("a", 0.0), ("b", 1.0)];
    for _ in 0..100 {
        assert_eq!(weighted_pick(&items, &mut rng), Some(&"b"));
    }
    let empty: Vec<(&str, f64)> = Vec::new();
    assert_eq!(weighted_pick(&empty, &mut rng), None);
    let all_zero = vec![("a", 0.0)];
    assert_eq!(weighted_pick(&all_zero, &mut rng), None);
}
