use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ChatError;
use crate::session::SessionId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxRequest {
    pub code: String,
    pub language: String,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionResult {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "execution_time")]
    pub execution_time_ms: Option<f64>,
    #[serde(default)]
    pub preview_url: Option<String>,
}

impl ExecutionResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self { error: Some(message.into()), ..Self::default() }
    }
}

/// Remote code execution. Retry and timeout policy belong to the implementation.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: SandboxRequest) -> Result<ExecutionResult, ChatError>;
}

/// Sandbox template the backend uses for a language, if it supports it at all.
pub fn sandbox_template(language: &str) -> Option<&'static str> {
    match language.to_ascii_lowercase().as_str() {
        "python" => Some("python"),
        "javascript" | "js" | "typescript" | "ts" | "react" | "vue" => Some("nodejs"),
        "html" | "css" => Some("static"),
        _ => None,
    }
}

/// Runs artifacts one at a time and keeps the last result.
pub struct SandboxRunner<E: CodeExecutor> {
    executor: E,
    executing: AtomicBool,
    last_result: Mutex<Option<ExecutionResult>>,
}

// Clears the in-flight flag even when the run future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<E: CodeExecutor> SandboxRunner<E> {
    pub fn new(executor: E) -> Self {
        Self { executor, executing: AtomicBool::new(false), last_result: Mutex::new(None) }
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    pub async fn last_result(&self) -> Option<ExecutionResult> {
        self.last_result.lock().await.clone()
    }

    /// Executor failures come back as an unsuccessful result rather than an error.
    pub async fn run(&self, code: &str, language: &str, session_id: SessionId) -> Result<ExecutionResult, ChatError> {
        if self.executing.swap(true, Ordering::AcqRel) {
            return Err(ChatError::ExecutionInFlight);
        }
        let _guard = InFlight(&self.executing);
        if sandbox_template(language).is_none() {
            warn!(language, "language has no known sandbox template");
        }
        let request = SandboxRequest { code: code.to_string(), language: language.to_string(), session_id };
        let result = match self.executor.execute(request).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure(e.to_string()),
        };
        info!(language, success = result.success, "sandbox execution finished");
        *self.last_result.lock().await = Some(result.clone());
        Ok(result)
    }
}
