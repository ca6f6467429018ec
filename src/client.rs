use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::artifact::ArtifactPayload;
use crate::error::ChatError;
use crate::orchestrator::ChatBackend;
use crate::sandbox::{CodeExecutor, ExecutionResult, SandboxRequest};
use crate::settings::{Credentials, EffectiveSettings};
use crate::transport::{ChatRequest, ChunkStream, record_stream};

const STREAM_PATH: &str = "api/chat/stream";
const MESSAGE_PATH: &str = "api/chat/message";
const SANDBOX_PATH: &str = "api/chat/sandbox/execute";
const HEALTH_PATH: &str = "health";

/// Non-streaming reply from the message endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MessageResponse {
    pub content: String,
    #[serde(default)]
    pub is_code_artifact: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactPayload>,
    pub session_id: String,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ChatApiClient {
    http: Client,
    base_url: Url,
    credentials: Credentials,
    timeout: std::time::Duration,
}

impl ChatApiClient {
    pub fn new(settings: &EffectiveSettings) -> Result<Self, ChatError> {
        let mut base = settings.api_base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| ChatError::InvalidBaseUrl(format!("{base}: {e}")))?;
        // Streaming responses have no overall deadline; non-streaming calls set one per request.
        let http = Client::builder().connect_timeout(settings.timeout).build()?;
        Ok(Self { http, base_url, credentials: settings.credentials.clone(), timeout: settings.timeout })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ChatError> {
        self.base_url.join(path).map_err(|e| ChatError::InvalidBaseUrl(e.to_string()))
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let keys = [
            ("x-gemini-api-key", &self.credentials.gemini_api_key),
            ("x-e2b-api-key", &self.credentials.e2b_api_key),
        ];
        for (name, key) in keys {
            if let Some(value) = key.as_deref().and_then(|k| HeaderValue::from_str(k).ok()) {
                headers.insert(name, value);
            }
        }
        headers
    }

    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, ChatError> {
        let url = self.endpoint(STREAM_PATH)?;
        debug!(%url, session_id = %request.session_id, "opening chat stream");
        let response = self.http.post(url).headers(self.headers()).json(request).send().await?;
        let response = check_status(response).await?;
        Ok(record_stream(response.bytes_stream().boxed()))
    }

    pub async fn send_message(&self, request: &ChatRequest) -> Result<MessageResponse, ChatError> {
        let url = self.endpoint(MESSAGE_PATH)?;
        let response = self.http.post(url).headers(self.headers()).timeout(self.timeout).json(request).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    pub async fn execute_code(&self, request: &SandboxRequest) -> Result<ExecutionResult, ChatError> {
        let url = self.endpoint(SANDBOX_PATH)?;
        let response = self.http.post(url).headers(self.headers()).timeout(self.timeout).json(request).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    pub async fn health_check(&self) -> Result<Value, ChatError> {
        let url = self.endpoint(HEALTH_PATH)?;
        let response = self.http.get(url).headers(self.headers()).timeout(self.timeout).send().await?;
        Ok(check_status(response).await?.json().await?)
    }
}

async fn check_status(response: Response) -> Result<Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChatError::Status(status, error_message(status, &body)))
}

/// Pulls `detail` or `error` out of a JSON error body, falling back to the raw body.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        ["detail", "error", "message"]
            .iter()
            .find_map(|k| v.get(*k).and_then(Value::as_str).map(ToString::to_string))
    });
    match from_json {
        Some(message) => message,
        None if body.trim().is_empty() => status.canonical_reason().unwrap_or("request failed").to_string(),
        None => body.trim().to_string(),
    }
}

#[async_trait]
impl ChatBackend for ChatApiClient {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream, ChatError> {
        self.stream_chat(request).await
    }
}

#[async_trait]
impl CodeExecutor for ChatApiClient {
    async fn execute(&self, request: SandboxRequest) -> Result<ExecutionResult, ChatError> {
        self.execute_code(&request).await
    }
}

impl MessageResponse {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }
}
