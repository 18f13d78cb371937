//! HTTP surface: the per-group proxy paths and the unified hub endpoint.
//! All routing decisions live in poolgate-core; this crate only maps axum
//! types to and from the engine's.

mod admission;
mod hub;
mod proxy;
mod respond;

use std::sync::Arc;

use axum::Router;

use poolgate_core::{HubSelector, ProxyExecutor};

#[derive(Clone)]
pub struct RouterState {
    pub executor: Arc<ProxyExecutor>,
    pub selector: Arc<HubSelector>,
}

/// `ANY /proxy/{group}/<upstream_suffix>`: group-addressed passthrough.
pub fn proxy_router(state: RouterState) -> Router {
    proxy::router(state)
}

/// `POST /hub/v1/...` and `POST /hub/v1beta/...`: model-addressed entry.
pub fn hub_router(state: RouterState) -> Router {
    hub::router(state)
}
