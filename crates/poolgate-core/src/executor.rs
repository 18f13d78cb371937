use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;

use poolgate_channel::protocol::parse_usage;
use poolgate_channel::translate::{ClaudeToOpenAiStream, OpenAiToClaudeStream, StreamIncident};
use poolgate_channel::{
    ChannelAdapter, Headers, HttpMethod, RelayFormat, RequestContext, ResponseDirection,
    detect_format, extract_model, header_get, header_remove, header_set,
};
use poolgate_common::{EffectiveConfig, GroupId, KeyId};
use poolgate_storage::{LogEntry, RequestLogInsert};

use crate::classify::{AttemptFailure, ErrorClass, classify, extract_error_message};
use crate::error::ProxyError;
use crate::group::Group;
use crate::state::AppState;
use crate::upstream::{TransportError, UpstreamBody};
use crate::weight::{GROUP_ROLLUP, weighted_pick};

/// Inbound request, buffered and stripped of downstream auth by the router.
pub struct ProxyRequestParts {
    pub method: HttpMethod,
    /// Upstream-suffix path, e.g. `/v1/chat/completions`.
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
    pub trace_id: String,
}

#[derive(Debug)]
pub enum ProxyBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct ProxyOutcome {
    pub status: u16,
    pub headers: Headers,
    pub body: ProxyBody,
}

struct AttemptRecord {
    group_id: GroupId,
    key_id: Option<KeyId>,
    attempt: u32,
    is_final: bool,
    success: bool,
    status_code: Option<u16>,
    latency_ms: i64,
    model: Option<String>,
    upstream_url: Option<String>,
    error_class: Option<ErrorClass>,
    error_message: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
}

/// The per-request retry loop: pick key → adapt → forward → classify →
/// recycle or fail. Holds no state of its own beyond the shared [`AppState`].
#[derive(Clone)]
pub struct ProxyExecutor {
    state: Arc<AppState>,
}

impl ProxyExecutor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run one client request against the given group. Aggregate groups are
    /// expanded one level to a healthy standard member before the retry loop.
    pub async fn handle(
        &self,
        group: Arc<Group>,
        parts: ProxyRequestParts,
    ) -> Result<ProxyOutcome, ProxyError> {
        let format = detect_format(&parts.path);
        let group = self.resolve_standard(group, format).await?;
        let config = group.config.clone();

        if parts.body.len() as u64 > config.max_request_size_kb * 1024 {
            return Err(ProxyError::payload_too_large(format!(
                "request body exceeds {} KiB",
                config.max_request_size_kb
            )));
        }

        let content_type = header_get(&parts.headers, "content-type").map(str::to_string);
        let requested_model =
            extract_model(format, &parts.path, content_type.as_deref(), &parts.body);

        let (model_override, final_model) = self
            .apply_model_redirect(&group, requested_model.as_deref())
            .await?;

        let adapter = ChannelAdapter::dispatch(group.channel_type, format)
            .map_err(|err| ProxyError::bad_request(err.to_string()))?;
        let is_stream = ChannelAdapter::is_stream_request(
            format,
            &parts.path,
            parts.query.as_deref(),
            &parts.body,
        );

        self.retry_loop(RetryInput {
            group,
            config,
            adapter,
            parts,
            content_type,
            requested_model,
            model_override,
            final_model,
            is_stream,
        })
        .await
    }

    async fn resolve_standard(
        &self,
        group: Arc<Group>,
        _format: RelayFormat,
    ) -> Result<Arc<Group>, ProxyError> {
        if !group.is_aggregate() {
            return Ok(group);
        }

        let snapshot = self.state.manager.snapshot();
        let now = OffsetDateTime::now_utc();
        let mut candidates: Vec<(Arc<Group>, f64)> = Vec::new();
        for sub in &group.sub_groups {
            let Some(member) = snapshot.by_id.get(&sub.group_id) else {
                continue;
            };
            // One level only; a malformed graph cannot recurse.
            if member.is_aggregate() || !member.enabled {
                continue;
            }
            let ready = self
                .state
                .keys
                .active_count(member.id)
                .await
                .map(|n| n > 0)
                .unwrap_or(false);
            if !ready {
                continue;
            }
            let health = self
                .state
                .weights
                .group_health(member.id, now)
                .await
                .unwrap_or(1.0);
            candidates.push((member.clone(), sub.weight.max(1) as f64 * health));
        }

        let mut rng = rand::rng();
        weighted_pick(&candidates, &mut rng)
            .cloned()
            .ok_or_else(|| {
                ProxyError::no_healthy_group(format!(
                    "aggregate group {} has no selectable member",
                    group.name
                ))
            })
    }

    /// Resolve the request's model through the group's redirect map. Returns
    /// `(override, model_for_accounting)`.
    async fn apply_model_redirect(
        &self,
        group: &Group,
        requested: Option<&str>,
    ) -> Result<(Option<String>, Option<String>), ProxyError> {
        let Some(model) = requested else {
            return Ok((None, None));
        };
        let Some(rule) = group.model_redirect_map.get(model) else {
            return Ok((None, Some(model.to_string())));
        };

        let picked = self
            .state
            .weights
            .pick_redirect_target(
                group.id,
                model,
                &rule.targets,
                group.model_redirect_strict,
                OffsetDateTime::now_utc(),
            )
            .await
            .map_err(|err| ProxyError::internal(err.to_string()))?;

        match picked {
            Some(target) => {
                let needs_rewrite = target != model;
                Ok((
                    needs_rewrite.then(|| target.clone()),
                    Some(target),
                ))
            }
            None => Err(ProxyError::no_healthy_group(format!(
                "no healthy redirect target for model {model}"
            ))),
        }
    }

    async fn retry_loop(&self, input: RetryInput) -> Result<ProxyOutcome, ProxyError> {
        let RetryInput {
            group,
            config,
            adapter,
            parts,
            content_type,
            requested_model,
            model_override,
            final_model,
            is_stream,
        } = input;

        let deadline = Instant::now() + Duration::from_millis(config.request_timeout_ms);
        let max_attempts = config.max_retries + 1;
        let source_model = requested_model.clone().unwrap_or_default();
        let target_model = final_model.clone().unwrap_or_default();

        for attempt in 1..=max_attempts {
            let is_last = attempt == max_attempts;
            if Instant::now() >= deadline {
                return Err(ProxyError::timeout());
            }

            let Some(key) = self
                .state
                .keys
                .next(group.id)
                .await
                .map_err(|err| ProxyError::internal(err.to_string()))?
            else {
                self.record_weights(group.id, &source_model, &target_model, false)
                    .await;
                self.push_log(AttemptRecord {
                    group_id: group.id,
                    key_id: None,
                    attempt,
                    is_final: true,
                    success: false,
                    status_code: Some(503),
                    latency_ms: 0,
                    model: final_model.clone(),
                    upstream_url: None,
                    error_class: Some(ErrorClass::Transient),
                    error_message: Some("no keys available".to_string()),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                })
                .await;
                return Err(ProxyError::no_keys());
            };

            let permit = self
                .state
                .key_permit(key.id, config.max_concurrency_per_key)
                .await;

            let mut upstream_base = String::new();
            {
                let mut rng = rand::rng();
                if let Some(url) = group.pick_upstream(&mut rng) {
                    upstream_base = url.to_string();
                }
            }
            if upstream_base.is_empty() {
                return Err(ProxyError::internal("group has no upstreams"));
            }

            let ctx = RequestContext {
                method: parts.method,
                path: &parts.path,
                query: parts.query.as_deref(),
                headers: &parts.headers,
                body: parts.body.clone(),
                content_type: content_type.as_deref(),
                base_url: &upstream_base,
                api_key: &key.value,
                model_override: model_override.as_deref(),
                header_rules: &group.header_rules,
                path_redirects: &group.path_redirects,
                param_overrides: &group.param_overrides,
                is_stream,
            };
            let upstream_req = adapter
                .modify_request(&ctx)
                .map_err(|err| ProxyError::bad_request(err.to_string()))?;
            let upstream_url = upstream_req.url.clone();

            let started = Instant::now();
            let remaining = deadline.saturating_duration_since(started);
            let sent = tokio::time::timeout(remaining, self.state.client.send(upstream_req)).await;

            let response = match sent {
                Err(_) => {
                    // Budget exhausted mid-attempt; the last attempt is
                    // cancelled and the client gets 504.
                    self.apply_failure(
                        &group,
                        key.id,
                        ErrorClass::Transient,
                        &config,
                    )
                    .await;
                    self.record_weights(group.id, &source_model, &target_model, false)
                        .await;
                    self.push_log(AttemptRecord {
                        group_id: group.id,
                        key_id: Some(key.id),
                        attempt,
                        is_final: true,
                        success: false,
                        status_code: Some(504),
                        latency_ms: started.elapsed().as_millis() as i64,
                        model: final_model.clone(),
                        upstream_url: Some(upstream_url),
                        error_class: Some(ErrorClass::Transient),
                        error_message: Some("request budget exceeded".to_string()),
                        prompt_tokens: 0,
                        completion_tokens: 0,
                    })
                    .await;
                    return Err(ProxyError::timeout());
                }
                Ok(Err(transport)) => {
                    let outcome = self
                        .handle_transport_failure(TransportFailureInput {
                            group: &group,
                            config: &config,
                            key_id: key.id,
                            attempt,
                            is_last,
                            started,
                            upstream_url,
                            final_model: &final_model,
                            source_model: &source_model,
                            target_model: &target_model,
                            transport,
                        })
                        .await;
                    match outcome {
                        RetryDecision::Return(err) => return Err(err),
                        RetryDecision::Retry => {
                            drop(permit);
                            tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
                            continue;
                        }
                    }
                }
                Ok(Ok(response)) => response,
            };

            if !(200..300).contains(&response.status) {
                let body = match response.body {
                    UpstreamBody::Full(bytes) => bytes,
                    UpstreamBody::Stream(_) => Bytes::new(),
                };
                let outcome = self
                    .handle_http_failure(HttpFailureInput {
                        group: &group,
                        config: &config,
                        key_id: key.id,
                        attempt,
                        is_last,
                        started,
                        upstream_url,
                        final_model: &final_model,
                        source_model: &source_model,
                        target_model: &target_model,
                        status: response.status,
                        body,
                    })
                    .await;
                match outcome {
                    RetryDecision::Return(err) => return Err(err),
                    RetryDecision::Retry => {
                        drop(permit);
                        tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
                        continue;
                    }
                }
            }

            // Success: feedback and stream/buffer the adapted response.
            let _ = self.state.keys.on_success(group.id, key.id).await;
            return self
                .finish_success(SuccessInput {
                    group: group.clone(),
                    key_id: key.id,
                    attempt,
                    started,
                    upstream_url,
                    final_model: final_model.clone(),
                    source_model: source_model.clone(),
                    target_model: target_model.clone(),
                    direction: adapter.response_direction(),
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    permit,
                })
                .await;
        }

        Err(ProxyError::internal("retry loop exhausted"))
    }

    async fn handle_transport_failure(
        &self,
        input: TransportFailureInput<'_>,
    ) -> RetryDecision {
        let TransportFailureInput {
            group,
            config,
            key_id,
            attempt,
            is_last,
            started,
            upstream_url,
            final_model,
            source_model,
            target_model,
            transport,
        } = input;

        let failure = AttemptFailure::Transport {
            kind: transport.kind,
            message: transport.message.clone(),
        };
        let class = classify(&failure);
        self.apply_failure(group, key_id, class, config).await;

        let stop = is_last || class == ErrorClass::Ignorable;
        if stop {
            self.record_weights(group.id, source_model, target_model, false)
                .await;
        }
        self.push_log(AttemptRecord {
            group_id: group.id,
            key_id: Some(key_id),
            attempt,
            is_final: stop,
            success: false,
            status_code: None,
            latency_ms: started.elapsed().as_millis() as i64,
            model: final_model.clone(),
            upstream_url: Some(upstream_url),
            error_class: Some(class),
            error_message: Some(transport.message.clone()),
            prompt_tokens: 0,
            completion_tokens: 0,
        })
        .await;

        if stop {
            RetryDecision::Return(ProxyError::upstream(502, transport.message))
        } else {
            RetryDecision::Retry
        }
    }

    async fn handle_http_failure(&self, input: HttpFailureInput<'_>) -> RetryDecision {
        let HttpFailureInput {
            group,
            config,
            key_id,
            attempt,
            is_last,
            started,
            upstream_url,
            final_model,
            source_model,
            target_model,
            status,
            body,
        } = input;

        let failure = AttemptFailure::Http {
            status,
            body: body.clone(),
        };
        let class = classify(&failure);
        let message = extract_error_message(&body);
        self.apply_failure(group, key_id, class, config).await;

        // fatal_request and uncounted both go straight back to the client.
        let stop =
            is_last || matches!(class, ErrorClass::FatalRequest | ErrorClass::Uncounted);
        if stop {
            self.record_weights(group.id, source_model, target_model, false)
                .await;
        }
        self.push_log(AttemptRecord {
            group_id: group.id,
            key_id: Some(key_id),
            attempt,
            is_final: stop,
            success: false,
            status_code: Some(status),
            latency_ms: started.elapsed().as_millis() as i64,
            model: final_model.clone(),
            upstream_url: Some(upstream_url),
            error_class: Some(class),
            error_message: Some(message.clone()),
            prompt_tokens: 0,
            completion_tokens: 0,
        })
        .await;

        if stop {
            RetryDecision::Return(ProxyError::upstream(status, message))
        } else {
            RetryDecision::Retry
        }
    }

    async fn finish_success(&self, input: SuccessInput) -> Result<ProxyOutcome, ProxyError> {
        let SuccessInput {
            group,
            key_id,
            attempt,
            started,
            upstream_url,
            final_model,
            source_model,
            target_model,
            direction,
            status,
            mut headers,
            body,
            permit,
        } = input;

        sanitize_response_headers(&mut headers);

        match body {
            UpstreamBody::Full(bytes) => {
                let adapted = match direction {
                    ResponseDirection::Identity => bytes,
                    ResponseDirection::ClaudeToOpenAi => Bytes::from(
                        poolgate_channel::translate::claude_to_openai_chat_response(&bytes)
                            .map_err(|err| ProxyError::upstream(502, err.to_string()))?,
                    ),
                    ResponseDirection::OpenAiToClaude => Bytes::from(
                        poolgate_channel::translate::openai_chat_to_claude_response(&bytes)
                            .map_err(|err| ProxyError::upstream(502, err.to_string()))?,
                    ),
                };
                if direction != ResponseDirection::Identity {
                    header_set(&mut headers, "content-type", "application/json");
                }

                let usage = parse_usage(&adapted).unwrap_or((0, 0));
                self.record_weights(group.id, &source_model, &target_model, true)
                    .await;
                self.push_log(AttemptRecord {
                    group_id: group.id,
                    key_id: Some(key_id),
                    attempt,
                    is_final: true,
                    success: true,
                    status_code: Some(status),
                    latency_ms: started.elapsed().as_millis() as i64,
                    model: final_model,
                    upstream_url: Some(upstream_url),
                    error_class: None,
                    error_message: None,
                    prompt_tokens: usage.0,
                    completion_tokens: usage.1,
                })
                .await;
                drop(permit);
                Ok(ProxyOutcome {
                    status,
                    headers,
                    body: ProxyBody::Full(adapted),
                })
            }
            UpstreamBody::Stream(upstream_rx) => {
                if direction == ResponseDirection::OpenAiToClaude {
                    header_set(&mut headers, "content-type", "text/event-stream");
                }
                let (out_tx, out_rx) = mpsc::channel::<Bytes>(16);
                let pump = StreamPump {
                    executor: self.clone(),
                    group_id: group.id,
                    key_id,
                    attempt,
                    started,
                    upstream_url,
                    final_model,
                    source_model,
                    target_model,
                    direction,
                    status,
                    blacklist_threshold: group.config.blacklist_threshold,
                };
                tokio::spawn(pump.run(upstream_rx, out_tx, permit));
                Ok(ProxyOutcome {
                    status,
                    headers,
                    body: ProxyBody::Stream(out_rx),
                })
            }
        }
    }

    async fn apply_failure(
        &self,
        group: &Group,
        key_id: KeyId,
        class: ErrorClass,
        config: &EffectiveConfig,
    ) {
        match self
            .state
            .keys
            .on_failure(group.id, key_id, class, config.blacklist_threshold)
            .await
        {
            Ok(outcome) if outcome.blacklisted => {
                tracing::warn!(
                    group = %group.name,
                    key_id,
                    failures = outcome.failure_count,
                    "key quarantined"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(key_id, error = %err, "key failure feedback dropped");
            }
        }
    }

    async fn record_weights(
        &self,
        group_id: GroupId,
        source_model: &str,
        target_model: &str,
        success: bool,
    ) {
        let now = OffsetDateTime::now_utc();
        if let Err(err) = self
            .state
            .weights
            .record(group_id, GROUP_ROLLUP, GROUP_ROLLUP, success, now)
            .await
        {
            tracing::debug!(group_id, error = %err, "weight rollup dropped");
        }
        if !source_model.is_empty() && !target_model.is_empty() {
            if let Err(err) = self
                .state
                .weights
                .record(group_id, source_model, target_model, success, now)
                .await
            {
                tracing::debug!(group_id, error = %err, "weight sample dropped");
            }
        }
    }

    async fn push_log(&self, record: AttemptRecord) {
        let entry = LogEntry {
            log: RequestLogInsert {
                at: OffsetDateTime::now_utc(),
                group_id: Some(record.group_id),
                key_id: record.key_id,
                request_type: if record.is_final { "final" } else { "retry" },
                attempt: record.attempt as i32,
                success: record.success,
                status_code: record.status_code.map(|s| s as i32),
                latency_ms: record.latency_ms,
                model: record.model,
                upstream_url: record.upstream_url,
                error_class: record.error_class.map(|c| c.as_str()),
                error_message: record.error_message,
            },
            prompt_tokens: record.prompt_tokens,
            completion_tokens: record.completion_tokens,
        };
        self.state.log_sink.push(entry).await;
    }
}

enum RetryDecision {
    Retry,
    Return(ProxyError),
}

struct RetryInput {
    group: Arc<Group>,
    config: EffectiveConfig,
    adapter: ChannelAdapter,
    parts: ProxyRequestParts,
    content_type: Option<String>,
    requested_model: Option<String>,
    model_override: Option<String>,
    final_model: Option<String>,
    is_stream: bool,
}

struct TransportFailureInput<'a> {
    group: &'a Group,
    config: &'a EffectiveConfig,
    key_id: KeyId,
    attempt: u32,
    is_last: bool,
    started: Instant,
    upstream_url: String,
    final_model: &'a Option<String>,
    source_model: &'a str,
    target_model: &'a str,
    transport: TransportError,
}

struct HttpFailureInput<'a> {
    group: &'a Group,
    config: &'a EffectiveConfig,
    key_id: KeyId,
    attempt: u32,
    is_last: bool,
    started: Instant,
    upstream_url: String,
    final_model: &'a Option<String>,
    source_model: &'a str,
    target_model: &'a str,
    status: u16,
    body: Bytes,
}

struct SuccessInput {
    group: Arc<Group>,
    key_id: KeyId,
    attempt: u32,
    started: Instant,
    upstream_url: String,
    final_model: Option<String>,
    source_model: String,
    target_model: String,
    direction: ResponseDirection,
    status: u16,
    headers: Headers,
    body: UpstreamBody,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

/// Forwards a streamed body chunk by chunk, translating when the channel is
/// foreign to the relay format, and emits the terminal log once the stream
/// settles. Holds the key's concurrency permit until then.
struct StreamPump {
    executor: ProxyExecutor,
    group_id: GroupId,
    key_id: KeyId,
    attempt: u32,
    started: Instant,
    upstream_url: String,
    final_model: Option<String>,
    source_model: String,
    target_model: String,
    direction: ResponseDirection,
    status: u16,
    blacklist_threshold: u32,
}

enum StreamEnd {
    Clean,
    ClientGone,
    VendorError(StreamIncident),
}

impl StreamPump {
    async fn run(
        self,
        mut upstream_rx: mpsc::Receiver<Bytes>,
        out_tx: mpsc::Sender<Bytes>,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) {
        let mut claude_to_openai = match self.direction {
            ResponseDirection::ClaudeToOpenAi => Some(ClaudeToOpenAiStream::new()),
            _ => None,
        };
        let mut openai_to_claude = match self.direction {
            ResponseDirection::OpenAiToClaude => Some(OpenAiToClaudeStream::new()),
            _ => None,
        };

        let mut end = StreamEnd::Clean;
        'pump: while let Some(chunk) = upstream_rx.recv().await {
            let (frames, incident) = match (&mut claude_to_openai, &mut openai_to_claude) {
                (Some(translator), _) => translator.push(&chunk),
                (_, Some(translator)) => translator.push(&chunk),
                _ => (vec![chunk], None),
            };
            for frame in frames {
                if out_tx.send(frame).await.is_err() {
                    end = StreamEnd::ClientGone;
                    break 'pump;
                }
            }
            if let Some(incident) = incident {
                end = StreamEnd::VendorError(incident);
                break;
            }
        }

        if matches!(end, StreamEnd::Clean) {
            let tail = match (&mut claude_to_openai, &mut openai_to_claude) {
                (Some(translator), _) => translator.finish(),
                (_, Some(translator)) => translator.finish(),
                _ => Vec::new(),
            };
            for frame in tail {
                if out_tx.send(frame).await.is_err() {
                    end = StreamEnd::ClientGone;
                    break;
                }
            }
        }

        let (success, class, message) = match &end {
            StreamEnd::Clean => (true, None, None),
            StreamEnd::ClientGone => (
                false,
                Some(ErrorClass::Ignorable),
                Some("client disconnected mid-stream".to_string()),
            ),
            StreamEnd::VendorError(incident) => (
                false,
                Some(ErrorClass::Transient),
                Some(incident.message.clone()),
            ),
        };

        // Mid-stream vendor errors count against the key; a vanished client
        // does not.
        if let Some(ErrorClass::Transient) = class {
            let _ = self
                .executor
                .state
                .keys
                .on_failure(
                    self.group_id,
                    self.key_id,
                    ErrorClass::Transient,
                    self.blacklist_threshold,
                )
                .await;
        }
        self.executor
            .record_weights(self.group_id, &self.source_model, &self.target_model, success)
            .await;
        self.executor
            .push_log(AttemptRecord {
                group_id: self.group_id,
                key_id: Some(self.key_id),
                attempt: self.attempt,
                is_final: true,
                success,
                status_code: Some(self.status),
                latency_ms: self.started.elapsed().as_millis() as i64,
                model: self.final_model.clone(),
                upstream_url: Some(self.upstream_url.clone()),
                error_class: class,
                error_message: message,
                prompt_tokens: 0,
                completion_tokens: 0,
            })
            .await;
        drop(permit);
    }
}

fn sanitize_response_headers(headers: &mut Headers) {
    for name in [
        "content-length",
        "transfer-encoding",
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "upgrade",
    ] {
        header_remove(headers, name);
    }
}
