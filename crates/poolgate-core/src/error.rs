use serde::Serialize;

/// User-visible failure, mapped to the hub's JSON error envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProxyError {
    pub status: u16,
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationError,
    NotFoundError,
    InvalidRequestError,
    ServerError,
    ApiError,
}

impl ProxyError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: 401,
            code: "unauthorized",
            kind: ErrorKind::AuthenticationError,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: 403,
            code: "forbidden",
            kind: ErrorKind::AuthenticationError,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            code: "model_not_found",
            kind: ErrorKind::NotFoundError,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            code: "invalid_request",
            kind: ErrorKind::InvalidRequestError,
            message: message.into(),
        }
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            code: "request_too_large",
            kind: ErrorKind::InvalidRequestError,
            message: message.into(),
        }
    }

    pub fn no_keys() -> Self {
        Self {
            status: 503,
            code: "no_keys_available",
            kind: ErrorKind::ServerError,
            message: "no keys available".to_string(),
        }
    }

    pub fn no_healthy_group(message: impl Into<String>) -> Self {
        Self {
            status: 503,
            code: "no_healthy_group",
            kind: ErrorKind::ServerError,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: 504,
            code: "request_timeout",
            kind: ErrorKind::ServerError,
            message: "request budget exceeded".to_string(),
        }
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: "upstream_error",
            kind: ErrorKind::ApiError,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            code: "internal_error",
            kind: ErrorKind::ServerError,
            message: message.into(),
        }
    }

    /// `{"error": {"code", "message", "type"}}`
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "type": self.kind,
            }
        })
    }
}
