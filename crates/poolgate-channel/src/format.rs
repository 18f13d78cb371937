use serde_json::Value as JsonValue;

/// Inbound wire format, inferred from the URL alone and independent of the
/// upstream channel that will serve the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayFormat {
    OpenAIChat,
    OpenAICompletion,
    Claude,
    Codex,
    OpenAIImage,
    OpenAIImageEdit,
    OpenAIAudioTranscription,
    OpenAIAudioTranslation,
    OpenAIAudioSpeech,
    OpenAIEmbedding,
    OpenAIModeration,
    Gemini,
    Unknown,
}

impl RelayFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayFormat::OpenAIChat => "openai_chat",
            RelayFormat::OpenAICompletion => "openai_completion",
            RelayFormat::Claude => "claude",
            RelayFormat::Codex => "codex",
            RelayFormat::OpenAIImage => "openai_image",
            RelayFormat::OpenAIImageEdit => "openai_image_edit",
            RelayFormat::OpenAIAudioTranscription => "openai_audio_transcription",
            RelayFormat::OpenAIAudioTranslation => "openai_audio_translation",
            RelayFormat::OpenAIAudioSpeech => "openai_audio_speech",
            RelayFormat::OpenAIEmbedding => "openai_embedding",
            RelayFormat::OpenAIModeration => "openai_moderation",
            RelayFormat::Gemini => "gemini",
            RelayFormat::Unknown => "unknown",
        }
    }

    /// Model assumed when the request carries none.
    pub fn default_model(&self) -> Option<&'static str> {
        match self {
            RelayFormat::OpenAIImage | RelayFormat::OpenAIImageEdit => Some("dall-e-3"),
            RelayFormat::OpenAIAudioTranscription | RelayFormat::OpenAIAudioTranslation => {
                Some("whisper-1")
            }
            RelayFormat::OpenAIAudioSpeech => Some("tts-1"),
            RelayFormat::OpenAIEmbedding => Some("text-embedding-3-small"),
            _ => None,
        }
    }

    /// Bodies that arrive as multipart forms instead of JSON.
    pub fn is_multipart(&self) -> bool {
        matches!(
            self,
            RelayFormat::OpenAIImageEdit
                | RelayFormat::OpenAIAudioTranscription
                | RelayFormat::OpenAIAudioTranslation
        )
    }
}

/// Total, deterministic format detection by suffix match on the lowercased
/// path. Anything unmatched is [`RelayFormat::Unknown`].
pub fn detect_format(path: &str) -> RelayFormat {
    let path = path.to_ascii_lowercase();
    let path = path.split('?').next().unwrap_or("").trim_end_matches('/');

    // Gemini paths carry the action after a colon: /v1beta/models/<m>:<action>
    if (path.contains("/v1/models/") || path.contains("/v1beta/models/")) && path.contains(':') {
        return RelayFormat::Gemini;
    }

    if path.ends_with("/chat/completions") {
        return RelayFormat::OpenAIChat;
    }
    if path.ends_with("/completions") {
        return RelayFormat::OpenAICompletion;
    }
    if path.ends_with("/messages") {
        return RelayFormat::Claude;
    }
    if path.ends_with("/responses") {
        return RelayFormat::Codex;
    }
    if path.ends_with("/images/generations") || path.ends_with("/images/variations") {
        return RelayFormat::OpenAIImage;
    }
    if path.ends_with("/images/edits") {
        return RelayFormat::OpenAIImageEdit;
    }
    if path.ends_with("/audio/transcriptions") {
        return RelayFormat::OpenAIAudioTranscription;
    }
    if path.ends_with("/audio/translations") {
        return RelayFormat::OpenAIAudioTranslation;
    }
    if path.ends_with("/audio/speech") {
        return RelayFormat::OpenAIAudioSpeech;
    }
    if path.ends_with("/embeddings") {
        return RelayFormat::OpenAIEmbedding;
    }
    if path.ends_with("/moderations") {
        return RelayFormat::OpenAIModeration;
    }

    RelayFormat::Unknown
}

/// Split a Gemini `<model>:<action>` path tail.
pub fn strip_gemini_action(path: &str) -> Option<(String, String)> {
    let tail = path.rsplit('/').next()?;
    let (model, action) = tail.split_once(':')?;
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some((model.to_string(), action.to_string()))
}

/// Pull the requested model out of an inbound request, trying the format's
/// natural location first and falling back to the per-format default.
pub fn extract_model(
    format: RelayFormat,
    path: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Option<String> {
    let found = match format {
        RelayFormat::Gemini => gemini_path_model(path),
        _ if format.is_multipart() => multipart_model(content_type, body),
        _ => match content_type {
            Some(ct) if ct.contains("application/x-www-form-urlencoded") => {
                urlencoded_model(body)
            }
            _ => json_model(body),
        },
    };
    found.or_else(|| format.default_model().map(str::to_string))
}

fn gemini_path_model(path: &str) -> Option<String> {
    let idx = path
        .find("/v1beta/models/")
        .map(|i| i + "/v1beta/models/".len())
        .or_else(|| path.find("/v1/models/").map(|i| i + "/v1/models/".len()))?;
    let tail = &path[idx..];
    let model = tail.split(':').next().unwrap_or(tail);
    let model = model.trim_matches('/');
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

fn json_model(body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    value
        .get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .filter(|m| !m.is_empty())
}

fn urlencoded_model(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(text).ok()?;
    pairs
        .into_iter()
        .find(|(k, _)| k == "model")
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

/// Minimal multipart scan for the `model` form field; enough for the audio
/// and image-edit endpoints without buffering-aware multipart machinery.
fn multipart_model(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    let ct = content_type?;
    let boundary = ct
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))?
        .trim_matches('"');
    if boundary.is_empty() {
        return None;
    }

    let text = String::from_utf8_lossy(body);
    let delimiter = format!("--{boundary}");
    for part in text.split(delimiter.as_str()) {
        let Some((head, tail)) = part.split_once("\r\n\r\n").or_else(|| part.split_once("\n\n"))
        else {
            continue;
        };
        if !head.contains("name=\"model\"") {
            continue;
        }
        let value = tail.trim_end_matches(['\r', '\n', '-']).trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}
