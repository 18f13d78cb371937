mod support;

use bytes::Bytes;
use poolgate_channel::{HttpMethod, header_get};
use poolgate_core::{ProxyBody, ProxyExecutor, ProxyRequestParts};
use poolgate_storage::CatalogSnapshot;

use support::{MockClient, build_state, group_row, key_row};

fn parts(body: &str) -> ProxyRequestParts {
    ProxyRequestParts {
        method: HttpMethod::Post,
        path: "/v1/chat/completions".to_string(),
        query: None,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Bytes::from(body.to_string()),
        trace_id: "trace-1".to_string(),
    }
}

fn chat_body(model: &str) -> String {
    format!(r#"{{"model":"{model}","messages":[{{"role":"user","content":"hi"}}]}}"#)
}

async fn harness_with_keys(
    plains: &[&str],
    script: Vec<Result<(u16, &'static str), poolgate_core::TransportError>>,
) -> support::TestHarness {
    let cipher = poolgate_core::Cipher::new(support::MASTER_KEY);
    let catalog = CatalogSnapshot {
        groups: vec![group_row(1, "main")],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    let keys = plains
        .iter()
        .enumerate()
        .map(|(i, plain)| key_row(&cipher, i as i64 + 1, 1, plain))
        .collect();
    build_state(catalog, keys, MockClient::scripted(script)).await
}

#[tokio::test]
async fn success_passes_through_and_places_bearer_auth() {
    let harness = harness_with_keys(
        &["sk-1"],
        vec![Ok((200, r#"{"id":"r1","usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#))],
    )
    .await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let outcome = executor
        .handle(group, parts(&chat_body("gpt-4")))
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);
    let ProxyBody::Full(body) = outcome.body else {
        panic!("expected buffered body");
    };
    assert!(body.starts_with(b"{\"id\":\"r1\""));

    let requests = harness.client.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        header_get(&requests[0].headers, "authorization"),
        Some("Bearer sk-1")
    );
    assert_eq!(
        requests[0].url,
        "https://up.example.com/v1/chat/completions"
    );
}

#[tokio::test]
async fn transient_error_retries_with_the_next_key() {
    let harness = harness_with_keys(
        &["sk-1", "sk-2"],
        vec![Ok((500, "upstream exploded")), Ok((200, "{\"ok\":true}"))],
    )
    .await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let outcome = executor
        .handle(group, parts(&chat_body("gpt-4")))
        .await
        .unwrap();
    assert_eq!(outcome.status, 200);

    let requests = harness.client.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        header_get(&requests[0].headers, "authorization"),
        Some("Bearer sk-1")
    );
    assert_eq!(
        header_get(&requests[1].headers, "authorization"),
        Some("Bearer sk-2")
    );
}

#[tokio::test]
async fn key_bad_401_surfaces_vendor_message_and_counts_failure() {
    let mut catalog = CatalogSnapshot {
        groups: vec![group_row(1, "main")],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    // Three attempts total so the last one surfaces the vendor envelope.
    catalog.groups[0].config_json = serde_json::json!({"max_retries": 2});
    let cipher = poolgate_core::Cipher::new(support::MASTER_KEY);
    let keys = vec![key_row(&cipher, 1, 1, "sk-1")];
    let script = std::iter::repeat_n(
        Ok((401, r#"{"error":{"message":"Invalid API key"}}"#)),
        3,
    )
    .collect();
    let harness = build_state(catalog, keys, MockClient::scripted(script)).await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let err = executor
        .handle(group, parts(&chat_body("gpt-4")))
        .await
        .unwrap_err();
    assert_eq!(err.status, 401);
    assert_eq!(err.message, "Invalid API key");

    // Three counted failures with the default threshold of 3: quarantined.
    assert_eq!(harness.state.keys.failure_count(1, 1).await.unwrap(), 3);
    assert_eq!(harness.state.keys.active_count(1).await.unwrap(), 0);
    assert_eq!(harness.state.keys.invalid_count(1).await.unwrap(), 1);
}

#[tokio::test]
async fn empty_pool_returns_503_no_keys() {
    let harness = harness_with_keys(&[], vec![]).await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let err = executor
        .handle(group, parts(&chat_body("gpt-4")))
        .await
        .unwrap_err();
    assert_eq!(err.status, 503);
    assert_eq!(err.code, "no_keys_available");
}

#[tokio::test]
async fn oversized_body_is_rejected_at_the_boundary() {
    let mut catalog = CatalogSnapshot {
        groups: vec![group_row(1, "main")],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    catalog.groups[0].config_json = serde_json::json!({"max_request_size_kb": 1});
    let cipher = poolgate_core::Cipher::new(support::MASTER_KEY);
    let keys = vec![key_row(&cipher, 1, 1, "sk-1")];
    let harness = build_state(
        catalog,
        keys,
        MockClient::scripted(vec![Ok((200, "{}")), Ok((200, "{}"))]),
    )
    .await;
    let executor = ProxyExecutor::new(harness.state.clone());

    // Exactly the limit passes.
    let group = harness.state.manager.by_name("main").unwrap();
    let exact = ProxyRequestParts {
        method: HttpMethod::Post,
        path: "/v1/chat/completions".to_string(),
        query: None,
        headers: Vec::new(),
        body: Bytes::from(vec![b'x'; 1024]),
        trace_id: "t".to_string(),
    };
    assert!(executor.handle(group.clone(), exact).await.is_ok());

    // One byte more is a 400.
    let over = ProxyRequestParts {
        method: HttpMethod::Post,
        path: "/v1/chat/completions".to_string(),
        query: None,
        headers: Vec::new(),
        body: Bytes::from(vec![b'x'; 1025]),
        trace_id: "t".to_string(),
    };
    let err = executor.handle(group, over).await.unwrap_err();
    assert_eq!(err.status, 400);
}

#[tokio::test]
async fn fatal_request_400_does_not_retry() {
    let harness = harness_with_keys(
        &["sk-1", "sk-2"],
        vec![
            Ok((400, r#"{"error":{"message":"messages is required"}}"#)),
            Ok((200, "{}")),
        ],
    )
    .await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let err = executor
        .handle(group, parts(&chat_body("gpt-4")))
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert_eq!(harness.client.requests.lock().unwrap().len(), 1);
    // No penalty toward either key.
    assert_eq!(harness.state.keys.failure_count(1, 1).await.unwrap(), 0);
}

#[tokio::test]
async fn uncounted_429_returns_error_without_penalty() {
    let harness = harness_with_keys(
        &["sk-1", "sk-2"],
        vec![Ok((
            429,
            r#"{"error":{"message":"Please reduce the length of the messages"}}"#,
        ))],
    )
    .await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let err = executor
        .handle(group, parts(&chat_body("gpt-4")))
        .await
        .unwrap_err();
    assert_eq!(err.status, 429);
    assert_eq!(harness.client.requests.lock().unwrap().len(), 1);
    assert_eq!(harness.state.keys.failure_count(1, 1).await.unwrap(), 0);
    assert_eq!(harness.state.keys.active_count(1).await.unwrap(), 2);
}

#[tokio::test]
async fn disabled_redirect_target_is_never_chosen() {
    let mut catalog = CatalogSnapshot {
        groups: vec![group_row(1, "main")],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    catalog.groups[0].model_redirect_map = serde_json::json!({
        "quick": {"targets": [
            {"model": "target-a", "weight": 100, "enabled": true},
            {"model": "target-b", "weight": 100, "enabled": false},
        ]}
    });
    let cipher = poolgate_core::Cipher::new(support::MASTER_KEY);
    let keys = vec![key_row(&cipher, 1, 1, "sk-1")];
    let script = std::iter::repeat_n(Ok((200, "{}")), 20).collect();
    let harness = build_state(catalog, keys, MockClient::scripted(script)).await;
    let executor = ProxyExecutor::new(harness.state.clone());

    for _ in 0..10 {
        let group = harness.state.manager.by_name("main").unwrap();
        executor
            .handle(group, parts(&chat_body("quick")))
            .await
            .unwrap();
    }
    let requests = harness.client.requests.lock().unwrap();
    for request in requests.iter() {
        let body = request.body.as_ref().unwrap();
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["model"], "target-a");
    }
}

#[tokio::test]
async fn strict_redirect_with_no_enabled_target_fails_503() {
    let mut catalog = CatalogSnapshot {
        groups: vec![group_row(1, "main")],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    catalog.groups[0].model_redirect_map = serde_json::json!({
        "quick": {"targets": [{"model": "a", "weight": 100, "enabled": false}]}
    });
    catalog.groups[0].model_redirect_strict = true;
    let cipher = poolgate_core::Cipher::new(support::MASTER_KEY);
    let keys = vec![key_row(&cipher, 1, 1, "sk-1")];
    let harness = build_state(catalog, keys, MockClient::scripted(vec![])).await;
    let executor = ProxyExecutor::new(harness.state.clone());

    let group = harness.state.manager.by_name("main").unwrap();
    let err = executor
        .handle(group, parts(&chat_body("quick")))
        .await
        .unwrap_err();
    assert_eq!(err.status, 503);
}

#[tokio::test]
async fn final_request_log_is_emitted_exactly_once() {
    let harness = harness_with_keys(
        &["sk-1", "sk-2"],
        vec![Ok((500, "boom")), Ok((200, "{\"ok\":true}"))],
    )
    .await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    executor
        .handle(group, parts(&chat_body("gpt-4")))
        .await
        .unwrap();

    // Allow the async sink a flush interval.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let logs = harness.storage.logs.lock().unwrap();
    let finals: Vec<_> = logs.iter().filter(|l| l.request_type == "final").collect();
    let retries: Vec<_> = logs.iter().filter(|l| l.request_type == "retry").collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(retries.len(), 1);
    assert!(finals[0].success);
    assert_eq!(finals[0].attempt, 2);
}
