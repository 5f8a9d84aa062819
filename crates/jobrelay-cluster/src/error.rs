use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Credential or RBAC failure. Never retried: it needs an out-of-band fix.
    #[error("Cluster rejected the request ({status}): {message}")]
    AuthRejected { status: u16, message: String },

    /// The request was understood and refused (invalid manifest, quota, ...).
    #[error("Cluster refused the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Cluster API unavailable: {0}")]
    Unavailable(String),

    #[error("Cluster request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected cluster response: {0}")]
    InvalidResponse(String),

    #[error("Invalid cluster configuration: {0}")]
    Config(String),
}

impl ClusterError {
    /// Errors worth retrying on polling and streaming paths.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unavailable(_) | ClusterError::Timeout(_))
    }

    /// The kubelet answers log requests with a 400 while the container is
    /// still being created or its image pulled.
    pub fn is_unit_starting(&self) -> bool {
        matches!(self, ClusterError::Rejected { status: 400, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::NotFound(_) => "NOT_FOUND",
            ClusterError::AlreadyExists(_) => "ALREADY_EXISTS",
            ClusterError::AuthRejected { .. } => "AUTH_REJECTED",
            ClusterError::Rejected { .. } => "REJECTED",
            ClusterError::Unavailable(_) => "UPSTREAM_UNAVAILABLE",
            ClusterError::Timeout(_) => "UPSTREAM_TIMEOUT",
            ClusterError::InvalidResponse(_) => "INVALID_RESPONSE",
            ClusterError::Config(_) => "CONFIG",
        }
    }

    /// Maps a non-success API response onto the taxonomy. `body` is usually a
    /// `Status` object; its `message` is preferred over the raw text.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ApiStatus>(body)
            .ok()
            .and_then(|s| s.message)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| truncate_for_error(body, 500));
        let code = status.as_u16();
        match status {
            StatusCode::NOT_FOUND => ClusterError::NotFound(message),
            StatusCode::CONFLICT => ClusterError::AlreadyExists(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClusterError::AuthRejected {
                status: code,
                message,
            },
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                ClusterError::Unavailable(format!("{code}: {message}"))
            }
            s if s.is_server_error() => ClusterError::Unavailable(format!("{code}: {message}")),
            _ => ClusterError::Rejected {
                status: code,
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ClusterError::InvalidResponse(err.to_string());
        }
        if err.is_builder() {
            return ClusterError::Config(err.to_string());
        }
        ClusterError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    message: Option<String>,
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    let trimmed = input.trim();
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut end = max_len;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
