use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One chat turn. Only `content` changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub language: String,
    pub title: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActiveTab {
    #[default]
    Code,
    Preview,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub artifacts: Vec<Artifact>,
    pub current_session_id: Option<SessionId>,
    /// Id of an element of `artifacts`.
    pub active_artifact: Option<String>,
    pub sidebar_open: bool,
    pub active_tab: ActiveTab,
    pub is_loading: bool,
    pub is_streaming: bool,
    pub selected_language: Option<String>,
    pub last_error: Option<String>,
}

impl ConversationState {
    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn artifact(&self, id: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.id == id)
    }

    pub fn active_artifact(&self) -> Option<&Artifact> {
        self.active_artifact.as_deref().and_then(|id| self.artifact(id))
    }

    pub fn is_busy(&self) -> bool {
        self.is_loading || self.is_streaming
    }
}
