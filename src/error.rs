use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {0} {1}")]
    Status(StatusCode, String),
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("stream failed: {0}")]
    StreamFailed(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("request was cancelled")]
    Cancelled,
    #[error("artifact not found: {0}")]
    UnknownArtifact(String),
    #[error("a sandbox execution is already in flight")]
    ExecutionInFlight,
    #[error("settings error: {0}")]
    Settings(String),
}

/// Why a completed `<artifact>` block could not become an [`crate::session::Artifact`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactParseError {
    #[error("artifact block has no code")]
    EmptyCode,
    #[error("unsupported artifact type: {0}")]
    UnsupportedType(String),
}
