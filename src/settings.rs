use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Credentials {
    pub gemini_api_key: Option<String>,
    pub e2b_api_key: Option<String>,
}

/// Defaults taken from the process environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GlobalDefaults {
    pub api_base_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub language: Option<String>,
}

impl GlobalDefaults {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_base_url: var("ARTIFACT_CHAT_API_URL"),
            credentials: Some(Credentials {
                gemini_api_key: var("GEMINI_API_KEY"),
                e2b_api_key: var("E2B_API_KEY"),
            }),
            language: var("ARTIFACT_CHAT_LANGUAGE"),
        }
    }
}

/// Settings persisted across runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoredSettings {
    pub api_base_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub language: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl StoredSettings {
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ChatError::Settings(format!("{}: {e}", path.display()))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ChatError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ChatError::Settings(format!("{}: {e}", parent.display())))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(|e| ChatError::Settings(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path).map_err(|e| ChatError::Settings(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

pub fn default_settings_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".config")
    });
    base.join("artifact_chat").join("config.json")
}

/// Per-invocation overrides, typically from the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RequestOverrides {
    pub api_base_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub language: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub api_base_url: String,
    pub credentials: Credentials,
    pub language: Option<String>,
    pub timeout: Duration,
}

pub fn resolve_effective_settings(
    global: &GlobalDefaults,
    stored: &StoredSettings,
    request: &RequestOverrides,
) -> EffectiveSettings {
    let api_base_url = request
        .api_base_url
        .clone()
        .or_else(|| stored.api_base_url.clone())
        .or_else(|| global.api_base_url.clone())
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.into());

    let credentials = Credentials {
        gemini_api_key: request
            .credentials
            .as_ref()
            .and_then(|c| c.gemini_api_key.clone())
            .or_else(|| stored.credentials.as_ref().and_then(|c| c.gemini_api_key.clone()))
            .or_else(|| global.credentials.as_ref().and_then(|c| c.gemini_api_key.clone())),
        e2b_api_key: request
            .credentials
            .as_ref()
            .and_then(|c| c.e2b_api_key.clone())
            .or_else(|| stored.credentials.as_ref().and_then(|c| c.e2b_api_key.clone()))
            .or_else(|| global.credentials.as_ref().and_then(|c| c.e2b_api_key.clone())),
    };

    let language = request
        .language
        .clone()
        .or_else(|| stored.language.clone())
        .or_else(|| global.language.clone());

    let timeout = Duration::from_secs(
        request
            .timeout_secs
            .or(stored.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS),
    );

    EffectiveSettings { api_base_url, credentials, language, timeout }
}
