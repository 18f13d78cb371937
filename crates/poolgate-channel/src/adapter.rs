use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

use crate::format::RelayFormat;
use crate::translate::{self, TranslateError};
use crate::wire::{Headers, HttpMethod, UpstreamRequest, header_set};

/// Upstream vendor protocol family. Closed set; dispatch is by tag, never by
/// plugin lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    OpenAI,
    Anthropic,
    Gemini,
    Codex,
}

impl ChannelType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(ChannelType::OpenAI),
            "anthropic" => Some(ChannelType::Anthropic),
            "gemini" => Some(ChannelType::Gemini),
            "codex" => Some(ChannelType::Codex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Gemini => "gemini",
            ChannelType::Codex => "codex",
        }
    }

    /// Formats this channel serves without translation. Unknown formats pass
    /// through identity-except-auth on every channel.
    pub fn is_native(&self, format: RelayFormat) -> bool {
        if format == RelayFormat::Unknown {
            return true;
        }
        match self {
            ChannelType::OpenAI => matches!(
                format,
                RelayFormat::OpenAIChat
                    | RelayFormat::OpenAICompletion
                    | RelayFormat::Codex
                    | RelayFormat::OpenAIImage
                    | RelayFormat::OpenAIImageEdit
                    | RelayFormat::OpenAIAudioTranscription
                    | RelayFormat::OpenAIAudioTranslation
                    | RelayFormat::OpenAIAudioSpeech
                    | RelayFormat::OpenAIEmbedding
                    | RelayFormat::OpenAIModeration
            ),
            ChannelType::Anthropic => matches!(format, RelayFormat::Claude),
            ChannelType::Gemini => matches!(format, RelayFormat::Gemini),
            ChannelType::Codex => matches!(format, RelayFormat::Codex),
        }
    }

    /// Formats this channel can serve through wire translation.
    pub fn is_compatible(&self, format: RelayFormat) -> bool {
        if self.is_native(format) {
            return true;
        }
        matches!(
            (self, format),
            (ChannelType::Anthropic, RelayFormat::OpenAIChat)
                | (ChannelType::OpenAI, RelayFormat::Claude)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderRuleAction {
    Set,
    Remove,
    Passthrough,
}

/// Ordered per-group header rewrite rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub action: HeaderRuleAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRedirect {
    pub from: String,
    pub to: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error(transparent)]
    Translate(#[from] TranslateError),
}

/// How the upstream response must be adapted before it reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDirection {
    Identity,
    /// Claude upstream serving an OpenAI-chat client.
    ClaudeToOpenAi,
    /// OpenAI upstream serving a Claude client.
    OpenAiToClaude,
}

/// Everything `modify_request` needs for one attempt.
pub struct RequestContext<'a> {
    pub method: HttpMethod,
    /// Upstream-suffix path, e.g. `/v1/chat/completions`.
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// Inbound headers with downstream auth already stripped.
    pub headers: &'a Headers,
    pub body: Bytes,
    pub content_type: Option<&'a str>,
    pub base_url: &'a str,
    /// Decrypted upstream credential.
    pub api_key: &'a str,
    /// Result of model redirection, if any.
    pub model_override: Option<&'a str>,
    pub header_rules: &'a [HeaderRule],
    pub path_redirects: &'a [PathRedirect],
    pub param_overrides: &'a Map<String, JsonValue>,
    pub is_stream: bool,
}

/// Inputs for the background validation probe.
pub struct ValidationProbe<'a> {
    pub base_url: &'a str,
    pub test_model: &'a str,
    pub validation_endpoint: Option<&'a str>,
    pub api_key: &'a str,
}

const ANTHROPIC_VERSION_DEFAULT: &str = "2023-06-01";

/// Per-vendor request/response transform, dispatched by
/// `channel_type × relay_format`.
#[derive(Debug, Clone, Copy)]
pub struct ChannelAdapter {
    channel: ChannelType,
    format: RelayFormat,
}

impl ChannelAdapter {
    pub fn dispatch(channel: ChannelType, format: RelayFormat) -> Result<Self, AdapterError> {
        if !channel.is_compatible(format) {
            return Err(AdapterError::Unsupported(
                "relay format not supported by channel",
            ));
        }
        Ok(Self { channel, format })
    }

    pub fn channel(&self) -> ChannelType {
        self.channel
    }

    pub fn response_direction(&self) -> ResponseDirection {
        match (self.channel, self.format) {
            (ChannelType::Anthropic, RelayFormat::OpenAIChat) => ResponseDirection::ClaudeToOpenAi,
            (ChannelType::OpenAI, RelayFormat::Claude) => ResponseDirection::OpenAiToClaude,
            _ => ResponseDirection::Identity,
        }
    }

    /// Place auth, apply group rules, redirect the model, translate the body
    /// when the channel is compatible-but-foreign, and assemble the upstream
    /// request.
    pub fn modify_request(&self, ctx: &RequestContext<'_>) -> Result<UpstreamRequest, AdapterError> {
        let mut path = self.map_path(ctx.path);
        for redirect in ctx.path_redirects {
            if let Some(rest) = path.strip_prefix(redirect.from.as_str()) {
                path = format!("{}{}", redirect.to, rest);
                break;
            }
        }

        let (body, reencoded) = self.adapt_body(ctx, &mut path)?;

        let mut headers: Headers = ctx
            .headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .cloned()
            .collect();
        apply_header_rules(&mut headers, ctx.header_rules);
        self.place_auth(&mut headers, ctx.api_key);
        if reencoded {
            header_set(&mut headers, "content-type", "application/json");
        }

        let base = ctx.base_url.trim_end_matches('/');
        let url = match ctx.query {
            Some(query) if !query.is_empty() => format!("{base}{path}?{query}"),
            _ => format!("{base}{path}"),
        };

        Ok(UpstreamRequest {
            method: ctx.method,
            url,
            headers,
            body,
            is_stream: ctx.is_stream,
        })
    }

    /// Cheap upstream probe used by background key validation.
    pub fn build_validation_request(
        &self,
        probe: &ValidationProbe<'_>,
    ) -> Result<UpstreamRequest, AdapterError> {
        let base = probe.base_url.trim_end_matches('/');
        let (default_path, body) = match self.channel {
            ChannelType::OpenAI => (
                "/v1/chat/completions".to_string(),
                json!({
                    "model": probe.test_model,
                    "messages": [{"role": "user", "content": "ping"}],
                    "max_tokens": 1,
                }),
            ),
            ChannelType::Anthropic => (
                "/v1/messages".to_string(),
                json!({
                    "model": probe.test_model,
                    "max_tokens": 1,
                    "messages": [{"role": "user", "content": "ping"}],
                }),
            ),
            ChannelType::Gemini => (
                format!("/v1beta/models/{}:countTokens", probe.test_model),
                json!({
                    "contents": [{"parts": [{"text": "ping"}]}],
                }),
            ),
            ChannelType::Codex => (
                "/v1/responses".to_string(),
                json!({
                    "model": probe.test_model,
                    "input": "ping",
                    "max_output_tokens": 16,
                }),
            ),
        };
        let path = probe
            .validation_endpoint
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .unwrap_or(default_path);

        let mut headers: Headers = Vec::new();
        self.place_auth(&mut headers, probe.api_key);
        header_set(&mut headers, "content-type", "application/json");

        Ok(UpstreamRequest {
            method: HttpMethod::Post,
            url: format!("{base}{path}"),
            headers,
            body: Some(Bytes::from(serde_json::to_vec(&body).map_err(
                |err| AdapterError::InvalidBody(err.to_string()),
            )?)),
            is_stream: false,
        })
    }

    /// Whether the inbound request asks for a streamed response.
    pub fn is_stream_request(format: RelayFormat, path: &str, query: Option<&str>, body: &[u8]) -> bool {
        match format {
            RelayFormat::Gemini => {
                path.contains(":streamGenerateContent")
                    || query.map(|q| q.contains("alt=sse")).unwrap_or(false)
            }
            RelayFormat::OpenAIChat
            | RelayFormat::OpenAICompletion
            | RelayFormat::Claude
            | RelayFormat::Codex => serde_json::from_slice::<JsonValue>(body)
                .ok()
                .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn map_path(&self, path: &str) -> String {
        match (self.channel, self.format) {
            (ChannelType::Anthropic, RelayFormat::OpenAIChat) => "/v1/messages".to_string(),
            (ChannelType::OpenAI, RelayFormat::Claude) => "/v1/chat/completions".to_string(),
            _ => path.to_string(),
        }
    }

    fn adapt_body(
        &self,
        ctx: &RequestContext<'_>,
        path: &mut String,
    ) -> Result<(Option<Bytes>, bool), AdapterError> {
        if ctx.body.is_empty() {
            return Ok((None, false));
        }
        // Multipart bodies pass through untouched; the model override and
        // param overrides only apply to JSON shapes.
        if self.format.is_multipart() {
            return Ok((Some(ctx.body.clone()), false));
        }

        if self.format == RelayFormat::Gemini {
            if let Some(model) = ctx.model_override
                && let Some((_, action)) = crate::format::strip_gemini_action(path)
            {
                let prefix_end = path.rfind("/models/").map(|i| i + "/models/".len());
                if let Some(end) = prefix_end {
                    *path = format!("{}{model}:{action}", &path[..end]);
                }
            }
            return Ok((Some(ctx.body.clone()), false));
        }

        let translated = match (self.channel, self.format) {
            (ChannelType::Anthropic, RelayFormat::OpenAIChat) => {
                translate::openai_chat_to_claude_request(&ctx.body)?
            }
            (ChannelType::OpenAI, RelayFormat::Claude) => {
                translate::claude_to_openai_chat_request(&ctx.body)?
            }
            _ => {
                // Non-JSON bodies on passthrough formats forward untouched.
                if serde_json::from_slice::<JsonValue>(&ctx.body).is_err() {
                    return Ok((Some(ctx.body.clone()), false));
                }
                ctx.body.to_vec()
            }
        };

        let mut value: JsonValue = serde_json::from_slice(&translated)
            .map_err(|err| AdapterError::InvalidBody(err.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            if let Some(model) = ctx.model_override {
                obj.insert("model".to_string(), JsonValue::String(model.to_string()));
            }
            for (key, override_value) in ctx.param_overrides {
                obj.insert(key.clone(), override_value.clone());
            }
        }
        let encoded =
            serde_json::to_vec(&value).map_err(|err| AdapterError::InvalidBody(err.to_string()))?;
        Ok((Some(Bytes::from(encoded)), true))
    }

    fn place_auth(&self, headers: &mut Headers, api_key: &str) {
        match self.channel {
            ChannelType::OpenAI | ChannelType::Codex => {
                header_set(headers, "authorization", format!("Bearer {api_key}"));
            }
            ChannelType::Anthropic => {
                header_set(headers, "x-api-key", api_key);
                if crate::wire::header_get(headers, "anthropic-version").is_none() {
                    header_set(headers, "anthropic-version", ANTHROPIC_VERSION_DEFAULT);
                }
            }
            ChannelType::Gemini => {
                header_set(headers, "x-goog-api-key", api_key);
            }
        }
    }
}

fn apply_header_rules(headers: &mut Headers, rules: &[HeaderRule]) {
    for rule in rules {
        match rule.action {
            HeaderRuleAction::Set => header_set(headers, &rule.key, rule.value.clone()),
            HeaderRuleAction::Remove => crate::wire::header_remove(headers, &rule.key),
            // Passthrough marks a header as intentionally forwarded; the
            // inbound value is already present.
            HeaderRuleAction::Passthrough => {}
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}
