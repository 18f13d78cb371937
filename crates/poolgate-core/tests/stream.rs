mod support;

use std::time::Duration;

use bytes::Bytes;
use poolgate_channel::HttpMethod;
use poolgate_core::{ProxyBody, ProxyExecutor, ProxyRequestParts};
use poolgate_storage::CatalogSnapshot;

use support::{MockClient, build_state, group_row, key_row};

fn stream_parts() -> ProxyRequestParts {
    ProxyRequestParts {
        method: HttpMethod::Post,
        path: "/v1/chat/completions".to_string(),
        query: None,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Bytes::from_static(
            br#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        ),
        trace_id: "trace-s".to_string(),
    }
}

async fn streaming_harness(frames: Vec<&'static str>) -> support::TestHarness {
    let cipher = poolgate_core::Cipher::new(support::MASTER_KEY);
    let catalog = CatalogSnapshot {
        groups: vec![group_row(1, "main")],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    let keys = vec![key_row(&cipher, 1, 1, "sk-1")];
    build_state(catalog, keys, MockClient::streaming("text/event-stream", frames)).await
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> String {
    let mut out = String::new();
    while let Some(chunk) = rx.recv().await {
        out.push_str(&String::from_utf8_lossy(&chunk));
    }
    out
}

#[tokio::test]
async fn stream_passes_through_chunk_by_chunk() {
    let harness = streaming_harness(vec![
        "data: {\"id\":\"c1\",\"choices\":[]}\n\n",
        "data: [DONE]\n\n",
    ])
    .await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let outcome = executor.handle(group, stream_parts()).await.unwrap();
    assert_eq!(outcome.status, 200);
    let ProxyBody::Stream(rx) = outcome.body else {
        panic!("expected streamed body");
    };
    let collected = collect(rx).await;
    assert!(collected.contains("\"id\":\"c1\""));
    assert!(collected.ends_with("data: [DONE]\n\n"));

    // Terminal log is success with no error class.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let logs = harness.storage.logs.lock().unwrap();
    let finals: Vec<_> = logs.iter().filter(|l| l.request_type == "final").collect();
    assert_eq!(finals.len(), 1);
    assert!(finals[0].success);
    assert_eq!(finals[0].error_class, None);
}

#[tokio::test]
async fn client_disconnect_mid_stream_is_ignorable_and_unpenalized() {
    // More frames than the forwarding channel holds, so the pump is still
    // mid-stream whenever the receiver goes away.
    let harness =
        streaming_harness(vec!["data: {\"id\":\"c1\",\"choices\":[]}\n\n"; 64]).await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let outcome = executor.handle(group, stream_parts()).await.unwrap();
    let ProxyBody::Stream(rx) = outcome.body else {
        panic!("expected streamed body");
    };
    // The client walks away after the headers.
    drop(rx);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let logs = harness.storage.logs.lock().unwrap();
    let finals: Vec<_> = logs.iter().filter(|l| l.request_type == "final").collect();
    assert_eq!(finals.len(), 1);
    assert!(!finals[0].success);
    assert_eq!(finals[0].error_class, Some("ignorable"));

    // No retry happened and the key was not penalized.
    assert_eq!(harness.client.requests.lock().unwrap().len(), 1);
    drop(logs);
    assert_eq!(harness.state.keys.failure_count(1, 1).await.unwrap(), 0);
    assert_eq!(harness.state.keys.active_count(1).await.unwrap(), 1);
}

#[tokio::test]
async fn mid_stream_vendor_error_is_transient_and_counted() {
    let cipher = poolgate_core::Cipher::new(support::MASTER_KEY);
    let mut row = group_row(1, "main");
    // Claude upstream serving an OpenAI-chat client: the translator watches
    // for vendor error events.
    row.channel_type = "anthropic".to_string();
    let catalog = CatalogSnapshot {
        groups: vec![row],
        sub_groups: Vec::new(),
        hub_access_keys: Vec::new(),
    };
    let keys = vec![key_row(&cipher, 1, 1, "sk-1")];
    let harness = build_state(
        catalog,
        keys,
        MockClient::streaming(
            "text/event-stream",
            vec![
                "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\",\"model\":\"claude-sonnet-4\"}}\n\n",
                "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
            ],
        ),
    )
    .await;
    let group = harness.state.manager.by_name("main").unwrap();
    let executor = ProxyExecutor::new(harness.state.clone());

    let outcome = executor.handle(group, stream_parts()).await.unwrap();
    let ProxyBody::Stream(rx) = outcome.body else {
        panic!("expected streamed body");
    };
    let _ = collect(rx).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let logs = harness.storage.logs.lock().unwrap();
    let finals: Vec<_> = logs.iter().filter(|l| l.request_type == "final").collect();
    assert_eq!(finals.len(), 1);
    assert!(!finals[0].success);
    assert_eq!(finals[0].error_class, Some("transient"));
    assert_eq!(finals[0].error_message.as_deref(), Some("Overloaded"));
    drop(logs);

    // Counted against the key, but no stream restart was attempted.
    assert_eq!(harness.state.keys.failure_count(1, 1).await.unwrap(), 1);
    assert_eq!(harness.client.requests.lock().unwrap().len(), 1);
}
