//! Request-path engine: credential rotation and quarantine, group snapshot
//! cache, health-weighted routing, channel adaptation, and the retry loop.
//!
//! This crate owns no HTTP surface; the router crate drives it.

pub mod cipher;
pub mod classify;
pub mod error;
pub mod executor;
pub mod group;
pub mod hub;
pub mod keypool;
pub mod loops;
pub mod manager;
pub mod port;
pub mod state;
pub mod upstream;
pub mod validate;
pub mod weight;

pub use cipher::{Cipher, CipherError, fingerprint};
pub use classify::{AttemptFailure, ErrorClass, TransportErrorKind, classify, extract_error_message};
pub use error::{ErrorKind, ProxyError};
pub use executor::{ProxyBody, ProxyExecutor, ProxyOutcome, ProxyRequestParts};
pub use group::{Group, GroupType, ModelRedirectRule, RedirectTarget, SubGroupRef, Upstream};
pub use hub::{HubRequest, HubSelector};
pub use keypool::{FailureOutcome, KeyProvider, PoolError, SelectedKey};
pub use manager::{GroupManager, GroupSnapshot, HubKeyEntry, INVALIDATE_CHANNEL, ManagerError};
pub use state::AppState;
pub use upstream::{
    TransportError, UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamResponse,
    WreqUpstreamClient,
};
pub use validate::{ProbeVerdict, ValidationService, validation_sweep};
pub use weight::{WeightEngine, WeightError, weighted_pick};
