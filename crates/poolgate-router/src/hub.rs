use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::routing::post;
use bytes::Bytes;

use poolgate_channel::{Headers, HttpMethod, RelayFormat, detect_format, extract_model, header_get};
use poolgate_core::{HubRequest, ProxyError, ProxyRequestParts, fingerprint};

use crate::RouterState;
use crate::admission::{extract_token, strip_auth_headers, strip_auth_query};
use crate::respond::{error_response, outcome_response};

pub fn router(state: RouterState) -> Router {
    Router::new()
        .route("/hub/v1/{*rest}", post(hub_handler))
        .route("/hub/v1beta/{*rest}", post(hub_handler))
        .with_state(state)
}

async fn hub_handler(State(state): State<RouterState>, request: Request<Body>) -> Response {
    let trace_id = poolgate_common::new_trace_id();
    let (mut parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    // Admission before anything else; the decrypted access key drives the
    // model allow-list.
    let Some(token) = extract_token(&parts.headers, parts.uri.query()) else {
        return error_response(&ProxyError::unauthorized("missing access key"));
    };
    let access_key = {
        let snapshot = state.executor.state().manager.snapshot();
        snapshot.hub_keys_by_hash.get(&fingerprint(&token)).cloned()
    };
    let Some(access_key) = access_key.filter(|key| key.enabled) else {
        return error_response(&ProxyError::unauthorized("invalid access key"));
    };

    let format = detect_format(&path);
    if format == RelayFormat::Unknown {
        return error_response(&ProxyError::not_found("unknown hub path"));
    }

    let query = strip_auth_query(&parts.uri);
    strip_auth_headers(&mut parts.headers);
    let headers: Headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => Bytes::new(),
    };

    let content_type = header_get(&headers, "content-type");
    let Some(model) = extract_model(format, &path, content_type, &body) else {
        return error_response(&ProxyError::bad_request("missing model"));
    };

    // `/hub/v1/*` becomes the upstream suffix `/v1/*` (same for v1beta).
    let suffix = path
        .strip_prefix("/hub")
        .unwrap_or(path.as_str())
        .to_string();

    let hub_request = HubRequest {
        model: &model,
        format,
        body_size: body.len(),
        access_key: access_key.as_ref(),
    };
    let group = match state.selector.select(&hub_request, None).await {
        Ok(group) => group,
        Err(err) => return error_response(&err),
    };

    let proxy_parts = ProxyRequestParts {
        method: HttpMethod::Post,
        path: suffix.clone(),
        query: query.clone(),
        headers: headers.clone(),
        body: body.clone(),
        trace_id: trace_id.clone(),
    };

    match state.executor.handle(group.clone(), proxy_parts).await {
        Ok(outcome) => outcome_response(outcome),
        // One re-selection when the chosen group turned out to have no keys
        // left; any other failure is returned verbatim.
        Err(err) if err.code == "no_keys_available" => {
            retry_on_other_group(&state, hub_request, group.id, RetryParts {
                suffix,
                query,
                headers,
                body,
                trace_id,
            })
            .await
        }
        Err(err) => error_response(&err),
    }
}

struct RetryParts {
    suffix: String,
    query: Option<String>,
    headers: Headers,
    body: Bytes,
    trace_id: String,
}

async fn retry_on_other_group(
    state: &RouterState,
    hub_request: HubRequest<'_>,
    exhausted: poolgate_common::GroupId,
    parts: RetryParts,
) -> Response {
    let group = match state.selector.select(&hub_request, Some(exhausted)).await {
        Ok(group) => group,
        Err(_) => return error_response(&ProxyError::no_keys()),
    };
    let proxy_parts = ProxyRequestParts {
        method: HttpMethod::Post,
        path: parts.suffix,
        query: parts.query,
        headers: parts.headers,
        body: parts.body,
        trace_id: parts.trace_id,
    };
    match state.executor.handle(group, proxy_parts).await {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => error_response(&err),
    }
}
