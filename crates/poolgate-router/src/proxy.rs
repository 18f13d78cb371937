use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::Request;
use axum::response::Response;
use axum::routing::any;
use bytes::Bytes;

use poolgate_channel::{Headers, HttpMethod};
use poolgate_core::{ProxyError, ProxyRequestParts, fingerprint};

use crate::RouterState;
use crate::admission::{extract_token, strip_auth_headers, strip_auth_query};
use crate::respond::{error_response, outcome_response};

pub fn router(state: RouterState) -> Router {
    Router::new()
        .route("/proxy/{group}/{*rest}", any(proxy_handler))
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<RouterState>,
    Path((group_name, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response {
    let trace_id = poolgate_common::new_trace_id();
    let (mut parts, body) = request.into_parts();

    let Some(method) = HttpMethod::parse(parts.method.as_str()) else {
        return error_response(&ProxyError::bad_request("unsupported method"));
    };

    let token = extract_token(&parts.headers, parts.uri.query());
    let Some(group) = state.executor.state().manager.by_name(&group_name) else {
        return error_response(&ProxyError::not_found(format!(
            "unknown group {group_name}"
        )));
    };

    let Some(token) = token else {
        return error_response(&ProxyError::unauthorized("missing proxy key"));
    };
    let token_hash = fingerprint(&token);
    let authorized = group.proxy_key_hashes.contains(&token_hash)
        || state.executor.state().is_global_proxy_key(&token);
    if !authorized {
        return error_response(&ProxyError::forbidden("proxy key not valid for this group"));
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

    let proxy_parts = ProxyRequestParts {
        method,
        path: format!("/{}", rest.trim_start_matches('/')),
        query,
        headers,
        body,
        trace_id,
    };

    match state.executor.handle(group, proxy_parts).await {
        Ok(outcome) => outcome_response(outcome),
        Err(err) => error_response(&err),
    }
}
