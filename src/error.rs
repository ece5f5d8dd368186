//! repsync error types

use std::collections::BTreeMap;

/// Error kinds surfaced by the sync core.
///
/// The first six variants form the transport taxonomy: every
/// [`Transport`](crate::Transport) implementation must map its failures onto
/// one of them so the fetcher and the mutation coordinator can decide between
/// retry, failover, rollback, and removal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    // Transport errors
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Server rejected the payload. `fields` maps field name to message.
    #[error("validation failed: {message}")]
    ValidationFailed {
        message: String,
        fields: BTreeMap<String, String>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    // Local errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the error may succeed on a later attempt.
    ///
    /// `Timeout` and `ServerError` are handled exactly like `Unreachable`
    /// by the fetcher's retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Unreachable(_) | SyncError::ServerError { .. } | SyncError::Timeout
        )
    }

    /// Whether the error must never be retried and ends any retry loop at once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized | SyncError::ValidationFailed { .. } | SyncError::Cancelled
        )
    }

    /// Short, stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Unreachable(_) => "unreachable",
            SyncError::Unauthorized => "unauthorized",
            SyncError::ValidationFailed { .. } => "validation_failed",
            SyncError::NotFound(_) => "not_found",
            SyncError::ServerError { .. } => "server_error",
            SyncError::Timeout => "timeout",
            SyncError::Configuration(_) => "configuration",
            SyncError::Data(_) => "data",
            SyncError::Cancelled => "cancelled",
        }
    }

    /// Convenience constructor for a validation failure without field detail.
    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::ValidationFailed {
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Map a non-success HTTP status and its body onto the taxonomy.
    ///
    /// Validation bodies of the form `{"message": "...", "errors": {"field": "msg"}}`
    /// keep their field detail; array-valued messages are joined with `"; "`.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => SyncError::Unauthorized,
            404 | 410 => SyncError::NotFound(non_empty_or(body, "resource no longer exists")),
            400 | 409 | 422 => parse_validation_body(body),
            408 | 504 => SyncError::Timeout,
            500..=599 => SyncError::ServerError {
                status,
                message: non_empty_or(body, "server error"),
            },
            code => SyncError::Unreachable(format!("unexpected HTTP status {code}")),
        }
    }
}

fn non_empty_or(body: &str, fallback: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_validation_body(body: &str) -> SyncError {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body)
    else {
        return SyncError::validation(non_empty_or(body, "payload rejected"));
    };

    let message = map
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("payload rejected")
        .to_string();

    let mut fields = BTreeMap::new();
    if let Some(serde_json::Value::Object(errors)) = map.get("errors") {
        for (field, detail) in errors {
            let text = match detail {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|i| i.as_str().map_or_else(|| i.to_string(), str::to_string))
                    .collect::<Vec<_>>()
                    .join("; "),
                other => other.to_string(),
            };
            fields.insert(field.clone(), text);
        }
    }

    SyncError::ValidationFailed { message, fields }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Data(err.to_string())
    }
}

/// Result type alias for repsync operations
pub type Result<T> = std::result::Result<T, SyncError>;
