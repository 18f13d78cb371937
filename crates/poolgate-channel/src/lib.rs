//! Vendor protocol adaptation.
//!
//! A channel is the upstream's protocol family (OpenAI-style, Anthropic,
//! Gemini, Codex); a relay format is the *inbound* wire format inferred from
//! the URL alone. When the two match the adapter only places auth and applies
//! group rules; when they are compatible but different (OpenAI chat against a
//! Claude upstream, Claude messages against an OpenAI upstream) the adapter
//! translates bodies and streams between the two wire formats.

pub mod adapter;
pub mod format;
pub mod protocol;
pub mod sse;
pub mod translate;
mod wire;

pub use adapter::{
    AdapterError, ChannelAdapter, ChannelType, HeaderRule, HeaderRuleAction, PathRedirect,
    RequestContext, ResponseDirection, ValidationProbe,
};
pub use format::{RelayFormat, detect_format, extract_model, strip_gemini_action};
pub use sse::{SseEvent, SseParser};
pub use wire::{Headers, HttpMethod, UpstreamRequest, header_get, header_remove, header_set};
