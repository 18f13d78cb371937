use std::time::Duration;

use poolgate_store::{MemoryStore, Store, StoreError};

#[tokio::test]
async fn string_ttl_expires() {
    let store = MemoryStore::new();
    store
        .set("k", "v", Some(Duration::from_millis(30)))
        .await
        .unwrap();
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn rotate_cycles_through_members_in_order() {
    let store = MemoryStore::new();
    for member in ["k1", "k2", "k3"] {
        store.list_push_back("active:1", member).await.unwrap();
    }

    assert_eq!(
        store.list_rotate("active:1").await.unwrap().as_deref(),
        Some("k1")
    );
    assert_eq!(
        store.list_all("active:1").await.unwrap(),
        vec!["k2", "k3", "k1"]
    );
    assert_eq!(
        store.list_rotate("active:1").await.unwrap().as_deref(),
        Some("k2")
    );
    assert_eq!(
        store.list_rotate("active:1").await.unwrap().as_deref(),
        Some("k3")
    );
    // Full cycle: original order restored.
    assert_eq!(
        store.list_all("active:1").await.unwrap(),
        vec!["k1", "k2", "k3"]
    );
}

#[tokio::test]
async fn rotate_on_empty_list_returns_none() {
    let store = MemoryStore::new();
    assert_eq!(store.list_rotate("active:9").await.unwrap(), None);
}

#[tokio::test]
async fn push_back_is_idempotent() {
    let store = MemoryStore::new();
    store.list_push_back("l", "a").await.unwrap();
    store.list_push_back("l", "b").await.unwrap();
    store.list_push_back("l", "a").await.unwrap();
    assert_eq!(store.list_all("l").await.unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn wrong_type_is_reported() {
    let store = MemoryStore::new();
    store.sadd("s", "member").await.unwrap();
    let err = store.list_rotate("s").await.unwrap_err();
    assert!(matches!(err, StoreError::WrongType(_)));
}

#[tokio::test]
async fn hash_incr_and_read_back() {
    let store = MemoryStore::new();
    assert_eq!(store.hincr_by("w", "s", 1).await.unwrap(), 1);
    assert_eq!(store.hincr_by("w", "s", 2).await.unwrap(), 3);
    store
        .hset_multi("w", &[("ewma".to_string(), "900000".to_string())])
        .await
        .unwrap();

    let all = store.hget_all("w").await.unwrap();
    assert_eq!(all.get("s").map(String::as_str), Some("3"));
    assert_eq!(all.get("ewma").map(String::as_str), Some("900000"));
}

#[tokio::test]
async fn zset_pops_in_score_order() {
    let store = MemoryStore::new();
    store.zadd("z", "late", 30.0).await.unwrap();
    store.zadd("z", "early", 10.0).await.unwrap();
    store.zadd("z", "mid", 20.0).await.unwrap();

    assert_eq!(
        store.zpop_min("z").await.unwrap(),
        Some(("early".to_string(), 10.0))
    );
    assert_eq!(
        store.zpop_max("z").await.unwrap(),
        Some(("late".to_string(), 30.0))
    );
    assert_eq!(
        store.zpop_min("z").await.unwrap(),
        Some(("mid".to_string(), 20.0))
    );
    assert_eq!(store.zpop_min("z").await.unwrap(), None);
}

#[tokio::test]
async fn publish_reaches_all_subscribers() {
    let store = MemoryStore::new();
    let mut rx1 = store.subscribe("groups:invalidate").await.unwrap();
    let mut rx2 = store.subscribe("groups:invalidate").await.unwrap();

    store.publish("groups:invalidate", "7").await.unwrap();

    assert_eq!(rx1.recv().await.unwrap(), "7");
    assert_eq!(rx2.recv().await.unwrap(), "7");
}
