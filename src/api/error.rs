use serde_json::Value;
use thiserror::Error;

/// Status reported for failures where no HTTP response was received.
pub const STATUS_NO_RESPONSE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("redirect could not be followed: {0}")]
    Redirect(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("no response from server: {0}")]
    Network(TransportError),

    #[error("bad request: {}", message_or(.body, "the server rejected the request"))]
    BadRequest { body: Value },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {}", message_or(.body, "insufficient permissions"))]
    Forbidden { body: Value },

    #[error("server error: {}", message_or(.body, "unexpected server error"))]
    Server { body: Value },

    #[error("unexpected status {status}")]
    Unclassified { status: u16, body: Value },
}

impl FetchError {
    pub fn from_status(status: u16, body: Value) -> Self {
        match status {
            400 => FetchError::BadRequest { body },
            401 => FetchError::Unauthorized,
            403 => FetchError::Forbidden { body },
            500 => FetchError::Server { body },
            _ => FetchError::Unclassified { status, body },
        }
    }

    pub fn status(&self) -> i32 {
        match self {
            FetchError::Network(_) => STATUS_NO_RESPONSE,
            FetchError::BadRequest { .. } => 400,
            FetchError::Unauthorized => 401,
            FetchError::Forbidden { .. } => 403,
            FetchError::Server { .. } => 500,
            FetchError::Unclassified { status, .. } => i32::from(*status),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            FetchError::BadRequest { body }
            | FetchError::Forbidden { body }
            | FetchError::Server { body }
            | FetchError::Unclassified { body, .. } => Some(body),
            FetchError::Network(_) | FetchError::Unauthorized => None,
        }
    }

    /// Human readable message from the response body, if the server sent one.
    pub fn server_message(&self) -> Option<String> {
        self.body().and_then(extract_message)
    }
}

/// Pulls the `error` field out of a JSON error body. Plain-text bodies are
/// used verbatim.
pub fn extract_message(body: &Value) -> Option<String> {
    match body {
        Value::Object(map) => map
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

fn message_or(body: &Value, fallback: &str) -> String {
    extract_message(body).unwrap_or_else(|| fallback.to_string())
}
