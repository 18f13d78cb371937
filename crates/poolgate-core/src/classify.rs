use bytes::Bytes;
use serde_json::Value as JsonValue;

/// Outcome category of one upstream attempt. Drives retry, key penalties,
/// and the error class recorded on the request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credential is bad; penalize the key and retry with another.
    FatalKey,
    /// Bad client input; no retry, propagate the upstream envelope.
    FatalRequest,
    /// Worth retrying with backoff; counts against the key.
    Transient,
    /// Soft failure (quota / length); client sees it, key is not penalized.
    Uncounted,
    /// Client gave up or the pipe broke; no retry, no penalty.
    Ignorable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::FatalKey => "fatal_key",
            ErrorClass::FatalRequest => "fatal_request",
            ErrorClass::Transient => "transient",
            ErrorClass::Uncounted => "uncounted",
            ErrorClass::Ignorable => "ignorable",
        }
    }

    /// Whether the failure advances the key's failure counter.
    pub fn counts_against_key(&self) -> bool {
        matches!(self, ErrorClass::FatalKey | ErrorClass::Transient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    ReadTimeout,
    Other,
}

/// Everything an attempt can fail with, normalized for classification.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    Http {
        status: u16,
        body: Bytes,
    },
    /// Vendor error event observed inside an otherwise-2xx stream.
    StreamIncident {
        message: String,
    },
    ClientDisconnected,
}

const IGNORABLE_SIGNALS: [&str; 5] = [
    "context canceled",
    "connection reset by peer",
    "broken pipe",
    "use of closed network connection",
    "request canceled while waiting for connection",
];

const UNCOUNTED_SIGNALS: [&str; 2] = [
    "resource has been exhausted",
    "please reduce the length of the messages",
];

const KEY_BAD_SIGNALS: [&str; 6] = [
    "invalid api key",
    "incorrect api key",
    "api key not valid",
    "invalid x-api-key",
    "permission",
    "account deactivated",
];

/// Pure classification of one attempt outcome.
pub fn classify(failure: &AttemptFailure) -> ErrorClass {
    match failure {
        AttemptFailure::ClientDisconnected => ErrorClass::Ignorable,
        AttemptFailure::StreamIncident { .. } => ErrorClass::Transient,
        AttemptFailure::Transport { kind, message } => {
            let lower = message.to_ascii_lowercase();
            if IGNORABLE_SIGNALS.iter().any(|s| lower.contains(s)) {
                return ErrorClass::Ignorable;
            }
            match kind {
                TransportErrorKind::Connect
                | TransportErrorKind::Dns
                | TransportErrorKind::Tls
                | TransportErrorKind::Timeout
                | TransportErrorKind::ReadTimeout
                | TransportErrorKind::Other => ErrorClass::Transient,
            }
        }
        AttemptFailure::Http { status, body } => classify_http(*status, body),
    }
}

fn classify_http(status: u16, body: &Bytes) -> ErrorClass {
    let lower = String::from_utf8_lossy(body).to_ascii_lowercase();

    if UNCOUNTED_SIGNALS.iter().any(|s| lower.contains(s)) {
        return ErrorClass::Uncounted;
    }

    match status {
        401 | 403 => {
            if KEY_BAD_SIGNALS.iter().any(|s| lower.contains(s)) {
                ErrorClass::FatalKey
            } else {
                ErrorClass::Transient
            }
        }
        400 => {
            // A parseable vendor envelope on a 400 is a client-side schema
            // problem; an empty or opaque body is treated as retryable.
            if serde_json::from_slice::<JsonValue>(body)
                .map(|v| v.is_object())
                .unwrap_or(false)
            {
                ErrorClass::FatalRequest
            } else {
                ErrorClass::Transient
            }
        }
        429 => ErrorClass::Transient,
        _ => ErrorClass::Transient,
    }
}

const MAX_RAW_ERROR_LEN: usize = 2048;

/// Extract the human-readable message from the common vendor error shapes:
/// `{error:{message}}`, `{error_msg}`, `{error}`, `{message}`, else the raw
/// body truncated.
pub fn extract_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<JsonValue>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
        if let Some(message) = value.get("error_msg").and_then(|m| m.as_str()) {
            return message.to_string();
        }
        if let Some(message) = value.get("error").and_then(|m| m.as_str()) {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    let raw = String::from_utf8_lossy(body);
    let mut out: String = raw.chars().take(MAX_RAW_ERROR_LEN).collect();
    if raw.len() > out.len() {
        out.push_str("...");
    }
    out
}
