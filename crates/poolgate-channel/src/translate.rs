//! OpenAI-chat ⇄ Anthropic-messages wire translation.
//!
//! Used when a group's channel is compatible with, but not native to, the
//! inbound relay format. Bodies translate loss-tolerantly: typed fields move
//! across, anything without a counterpart is dropped rather than invented.

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use time::OffsetDateTime;

use crate::protocol::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    ClaudeMessage, ClaudeUsage, ContentBlock, MessagesRequest, MessagesResponse, OpenAiUsage,
    content_to_text,
};
use crate::sse::{SseEvent, SseParser};

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A vendor error surfaced mid-stream; fed to the error classifier.
#[derive(Debug, Clone)]
pub struct StreamIncident {
    pub message: String,
}

const CLAUDE_DEFAULT_MAX_TOKENS: u64 = 4096;

// ---- Request bodies ----

pub fn openai_chat_to_claude_request(body: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let req: ChatCompletionRequest = serde_json::from_slice(body)?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();
    for message in &req.messages {
        let text = message
            .content
            .as_ref()
            .map(content_to_text)
            .unwrap_or_default();
        match message.role.as_str() {
            "system" | "developer" => system_parts.push(text),
            role => {
                let role = if role == "assistant" { "assistant" } else { "user" };
                // Anthropic requires alternating roles; fold runs of the same
                // role into one message.
                match messages.last_mut() {
                    Some(last) if last.role == role => {
                        let merged = format!(
                            "{}\n\n{}",
                            last.content.as_str().unwrap_or_default(),
                            text
                        );
                        last.content = JsonValue::String(merged);
                    }
                    _ => messages.push(ClaudeMessage {
                        role: role.to_string(),
                        content: JsonValue::String(text),
                    }),
                }
            }
        }
    }

    let stop_sequences = req.stop.as_ref().and_then(stop_to_sequences);
    let out = MessagesRequest {
        model: req.model,
        max_tokens: Some(
            req.max_completion_tokens
                .or(req.max_tokens)
                .unwrap_or(CLAUDE_DEFAULT_MAX_TOKENS),
        ),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(JsonValue::String(system_parts.join("\n\n")))
        },
        messages,
        temperature: req.temperature.map(|t| t.clamp(0.0, 1.0)),
        top_p: req.top_p,
        stop_sequences,
        stream: req.stream,
        extra: Default::default(),
    };
    Ok(serde_json::to_vec(&out)?)
}

pub fn claude_to_openai_chat_request(body: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let req: MessagesRequest = serde_json::from_slice(body)?;

    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(system) = &req.system {
        let text = claude_system_to_text(system);
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(JsonValue::String(text)),
                extra: Default::default(),
            });
        }
    }
    for message in &req.messages {
        messages.push(ChatMessage {
            role: message.role.clone(),
            content: Some(JsonValue::String(claude_content_to_text(&message.content))),
            extra: Default::default(),
        });
    }

    let out = ChatCompletionRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req
            .stop_sequences
            .map(|seqs| JsonValue::Array(seqs.into_iter().map(JsonValue::String).collect())),
        stream: req.stream,
        extra: Default::default(),
    };
    Ok(serde_json::to_vec(&out)?)
}

// ---- Non-stream response bodies ----

pub fn claude_to_openai_chat_response(body: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let resp: MessagesResponse = serde_json::from_slice(body)?;

    let text: String = resp
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();
    let out = ChatCompletionResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: resp.model,
        choices: vec![crate::protocol::ChatChoice {
            index: 0,
            message: crate::protocol::ChatResponseMessage {
                role: "assistant".to_string(),
                content: Some(text),
            },
            finish_reason: Some(map_stop_reason(resp.stop_reason.as_deref())),
        }],
        usage: Some(OpenAiUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
        extra: Default::default(),
    };
    Ok(serde_json::to_vec(&out)?)
}

pub fn openai_chat_to_claude_response(body: &[u8]) -> Result<Vec<u8>, TranslateError> {
    let resp: ChatCompletionResponse = serde_json::from_slice(body)?;

    let first = resp.choices.first();
    let text = first
        .and_then(|choice| choice.message.content.clone())
        .unwrap_or_default();
    let usage = resp.usage.unwrap_or_default();
    let out = MessagesResponse {
        id: resp.id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: resp.model,
        content: vec![ContentBlock {
            kind: "text".to_string(),
            text: Some(text),
            extra: Default::default(),
        }],
        stop_reason: Some(map_finish_reason(
            first.and_then(|choice| choice.finish_reason.as_deref()),
        )),
        stop_sequence: None,
        usage: ClaudeUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    };
    Ok(serde_json::to_vec(&out)?)
}

fn map_stop_reason(reason: Option<&str>) -> String {
    match reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    }
    .to_string()
}

fn map_finish_reason(reason: Option<&str>) -> String {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
    .to_string()
}

fn stop_to_sequences(stop: &JsonValue) -> Option<Vec<String>> {
    match stop {
        JsonValue::String(s) => Some(vec![s.clone()]),
        JsonValue::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

fn claude_system_to_text(system: &JsonValue) -> String {
    match system {
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

fn claude_content_to_text(content: &JsonValue) -> String {
    match content {
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter(|block| {
                block
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t == "text")
                    .unwrap_or(false)
            })
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

// ---- Streams ----

/// Claude SSE events in, OpenAI chat-completion chunks out.
#[derive(Debug, Default)]
pub struct ClaudeToOpenAiStream {
    parser: SseParser,
    id: String,
    model: String,
    sent_done: bool,
    output_tokens: i64,
    input_tokens: i64,
}

impl ClaudeToOpenAiStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> (Vec<Bytes>, Option<StreamIncident>) {
        let mut frames = Vec::new();
        let mut incident = None;
        for event in self.parser.push(chunk) {
            if let Some(found) = self.translate_event(&event, &mut frames) {
                incident = Some(found);
            }
        }
        (frames, incident)
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for event in self.parser.finish() {
            self.translate_event(&event, &mut frames);
        }
        if !self.sent_done {
            frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
            self.sent_done = true;
        }
        frames
    }

    fn translate_event(
        &mut self,
        event: &SseEvent,
        frames: &mut Vec<Bytes>,
    ) -> Option<StreamIncident> {
        let name = event.event.as_deref().unwrap_or("");
        let data: JsonValue = serde_json::from_str(&event.data).unwrap_or(JsonValue::Null);

        match name {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    self.id = message
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("chatcmpl-relay")
                        .to_string();
                    self.model = message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.input_tokens = message
                        .get("usage")
                        .and_then(|u| u.get("input_tokens"))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                }
                frames.push(self.chunk(
                    crate::protocol::ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: None,
                    },
                    None,
                    None,
                ));
            }
            "content_block_delta" => {
                let text = data
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str());
                if let Some(text) = text {
                    frames.push(self.chunk(
                        crate::protocol::ChunkDelta {
                            role: None,
                            content: Some(text.to_string()),
                        },
                        None,
                        None,
                    ));
                }
            }
            "message_delta" => {
                self.output_tokens = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(self.output_tokens);
                let stop = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|s| s.as_str());
                if stop.is_some() {
                    let usage = OpenAiUsage {
                        prompt_tokens: self.input_tokens,
                        completion_tokens: self.output_tokens,
                        total_tokens: self.input_tokens + self.output_tokens,
                    };
                    frames.push(self.chunk(
                        crate::protocol::ChunkDelta::default(),
                        Some(map_stop_reason(stop)),
                        Some(usage),
                    ));
                }
            }
            "message_stop" => {
                frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
                self.sent_done = true;
            }
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream stream error")
                    .to_string();
                return Some(StreamIncident { message });
            }
            // ping, content_block_start/stop carry nothing for OpenAI clients.
            _ => {}
        }
        None
    }

    fn chunk(
        &self,
        delta: crate::protocol::ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<OpenAiUsage>,
    ) -> Bytes {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            model: self.model.clone(),
            choices: vec![crate::protocol::ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        };
        let data = serde_json::to_string(&chunk).unwrap_or_default();
        Bytes::from(format!("data: {data}\n\n"))
    }
}

/// OpenAI chat-completion chunks in, Claude SSE events out.
#[derive(Debug, Default)]
pub struct OpenAiToClaudeStream {
    parser: SseParser,
    started: bool,
    closed: bool,
    output_tokens: i64,
}

impl OpenAiToClaudeStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> (Vec<Bytes>, Option<StreamIncident>) {
        let mut frames = Vec::new();
        let mut incident = None;
        for event in self.parser.push(chunk) {
            if let Some(found) = self.translate_event(&event, &mut frames) {
                incident = Some(found);
            }
        }
        (frames, incident)
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for event in self.parser.finish() {
            self.translate_event(&event, &mut frames);
        }
        if self.started && !self.closed {
            self.close(&mut frames, "end_turn");
        }
        frames
    }

    fn translate_event(
        &mut self,
        event: &SseEvent,
        frames: &mut Vec<Bytes>,
    ) -> Option<StreamIncident> {
        if event.data == "[DONE]" {
            if self.started && !self.closed {
                self.close(frames, "end_turn");
            }
            return None;
        }
        let Ok(data) = serde_json::from_str::<JsonValue>(&event.data) else {
            return None;
        };

        if let Some(error) = data.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream stream error")
                .to_string();
            return Some(StreamIncident { message });
        }

        let chunk: ChatCompletionChunk = match serde_json::from_value(data) {
            Ok(chunk) => chunk,
            Err(_) => return None,
        };

        if !self.started {
            self.started = true;
            let start = json!({
                "type": "message_start",
                "message": {
                    "id": chunk.id,
                    "type": "message",
                    "role": "assistant",
                    "model": chunk.model,
                    "content": [],
                    "stop_reason": JsonValue::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            });
            frames.push(claude_frame("message_start", &start));
            let block = json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            });
            frames.push(claude_frame("content_block_start", &block));
        }

        if let Some(usage) = chunk.usage {
            self.output_tokens = usage.completion_tokens;
        }

        for choice in &chunk.choices {
            if let Some(text) = &choice.delta.content
                && !text.is_empty()
            {
                let delta = json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": text},
                });
                frames.push(claude_frame("content_block_delta", &delta));
            }
            if let Some(finish) = &choice.finish_reason
                && !self.closed
            {
                let reason = map_finish_reason(Some(finish.as_str()));
                self.close(frames, &reason);
            }
        }
        None
    }

    fn close(&mut self, frames: &mut Vec<Bytes>, stop_reason: &str) {
        let stop = json!({
            "type": "content_block_stop",
            "index": 0,
        });
        frames.push(claude_frame("content_block_stop", &stop));
        let delta = json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": JsonValue::Null},
            "usage": {"output_tokens": self.output_tokens},
        });
        frames.push(claude_frame("message_delta", &delta));
        let stop = json!({"type": "message_stop"});
        frames.push(claude_frame("message_stop", &stop));
        self.closed = true;
    }
}

fn claude_frame(event: &str, data: &JsonValue) -> Bytes {
    SseEvent {
        event: Some(event.to_string()),
        data: serde_json::to_string(data).unwrap_or_default(),
    }
    .encode()
}
