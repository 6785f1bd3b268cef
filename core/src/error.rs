//! Crate-wide error taxonomy. One enum renders both the HTTP JSON error body and the
//! WebSocket `EVENT {kind:"error"}` payload from the same value, so the two transports
//! never drift on what a given failure is called.

use serde::Serialize;

/// Stable string identifying an error kind on the wire. Never renamed once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidSpec,
    Unauthenticated,
    Unauthorized,
    NotFound,
    Conflict,
    ResourceExhausted,
    SpawnFailed,
    IoError,
    PtyClosed,
    ProtocolError,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidSpec => "invalid-spec",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NotFound => "not-found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::ResourceExhausted => "resource-exhausted",
            ErrorCode::SpawnFailed => "spawn-failed",
            ErrorCode::IoError => "io-error",
            ErrorCode::PtyClosed => "pty-closed",
            ErrorCode::ProtocolError => "protocol-error",
            ErrorCode::Timeout => "timeout",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VtError {
    #[error("invalid session spec: {0}")]
    InvalidSpec(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("unauthorized")]
    Unauthorized,
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("failed to spawn pty: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    IoError(String),
    #[error("pty closed")]
    PtyClosed,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("timeout")]
    Timeout,
}

impl VtError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VtError::InvalidSpec(_) => ErrorCode::InvalidSpec,
            VtError::Unauthenticated => ErrorCode::Unauthenticated,
            VtError::Unauthorized => ErrorCode::Unauthorized,
            VtError::NotFound(_) => ErrorCode::NotFound,
            VtError::Conflict(_) => ErrorCode::Conflict,
            VtError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            VtError::SpawnFailed(_) => ErrorCode::SpawnFailed,
            VtError::IoError(_) => ErrorCode::IoError,
            VtError::PtyClosed => ErrorCode::PtyClosed,
            VtError::ProtocolError(_) => ErrorCode::ProtocolError,
            VtError::Timeout => ErrorCode::Timeout,
        }
    }

    /// HTTP status this error renders as. Connection-scoped variants (ProtocolError,
    /// Timeout) are not expected to cross the HTTP boundary but get a sane fallback.
    pub fn http_status(&self) -> u16 {
        match self {
            VtError::InvalidSpec(_) => 400,
            VtError::Unauthenticated => 401,
            VtError::Unauthorized => 403,
            VtError::NotFound(_) => 404,
            VtError::Conflict(_) => 409,
            VtError::ResourceExhausted(_) => 429,
            VtError::SpawnFailed(_) => 500,
            VtError::IoError(_) => 500,
            VtError::PtyClosed => 400,
            VtError::ProtocolError(_) => 400,
            VtError::Timeout => 408,
        }
    }

    /// Render as the `{error, code, details?}` HTTP body.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.to_string(),
            "code": self.code().as_str(),
        })
    }
}

impl From<std::io::Error> for VtError {
    fn from(e: std::io::Error) -> Self {
        VtError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for VtError {
    fn from(e: serde_json::Error) -> Self {
        VtError::ProtocolError(e.to_string())
    }
}
