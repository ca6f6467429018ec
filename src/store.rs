use std::sync::Arc;

use chrono::TimeDelta;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ChatError;
use crate::session::{ActiveTab, Artifact, ConversationState, Message, Role, SessionId};
use crate::transport::HistoryEntry;

/// Artifacts created this close (exclusive) to an assistant message belong to it.
pub const ASSOCIATION_WINDOW_MS: i64 = 5_000;

/// Shared conversation state. Every operation takes the lock once, so readers only
/// ever see complete transitions.
#[derive(Clone, Default)]
pub struct ConversationStore {
    state: Arc<RwLock<ConversationState>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> ConversationState {
        self.state.read().await.clone()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.state.read().await.current_session_id
    }

    /// Returns the active session, creating one if there is none.
    pub async fn begin_session(&self) -> SessionId {
        let mut state = self.state.write().await;
        if let Some(id) = state.current_session_id {
            return id;
        }
        let id = Uuid::new_v4();
        debug!(session_id = %id, "session started");
        state.current_session_id = Some(id);
        id
    }

    pub async fn append_message(&self, role: Role, content: impl Into<String>) -> Message {
        let mut message = Message::new(role, content);
        let mut state = self.state.write().await;
        if let Some(last) = state.messages.last() {
            if message.timestamp <= last.timestamp {
                message.timestamp = last.timestamp + TimeDelta::microseconds(1);
            }
        }
        state.messages.push(message.clone());
        message
    }

    /// Appends `text` to a message's content. Unknown ids are a logged no-op.
    pub async fn append_delta(&self, message_id: Uuid, text: &str) -> bool {
        let mut state = self.state.write().await;
        match state.messages.iter_mut().find(|m| m.id == message_id) {
            Some(m) => {
                m.content.push_str(text);
                true
            }
            None => {
                warn!(%message_id, "delta for unknown message dropped");
                metrics::counter!("artifact_chat_dropped_deltas_total").increment(1);
                false
            }
        }
    }

    /// Appends, activates and reveals an artifact in one transition.
    pub async fn add_artifact(&self, artifact: Artifact) {
        let mut state = self.state.write().await;
        debug!(title = %artifact.title, total = state.artifacts.len() + 1, "artifact added");
        state.active_artifact = Some(artifact.id.clone());
        state.artifacts.push(artifact);
        state.sidebar_open = true;
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let selected_language = state.selected_language.take();
        *state = ConversationState { selected_language, ..ConversationState::default() };
    }

    pub async fn toggle_sidebar(&self) -> bool {
        let mut state = self.state.write().await;
        state.sidebar_open = !state.sidebar_open;
        state.sidebar_open
    }

    /// Selecting an artifact also opens the sidebar; `None` only deselects.
    pub async fn set_active_artifact(&self, id: Option<&str>) -> Result<(), ChatError> {
        let mut state = self.state.write().await;
        match id {
            Some(id) => {
                if state.artifact(id).is_none() {
                    return Err(ChatError::UnknownArtifact(id.to_string()));
                }
                state.active_artifact = Some(id.to_string());
                state.sidebar_open = true;
            }
            None => state.active_artifact = None,
        }
        Ok(())
    }

    pub async fn artifact_by_id(&self, id: &str) -> Option<Artifact> {
        self.state.read().await.artifact(id).cloned()
    }

    pub async fn set_active_tab(&self, tab: ActiveTab) {
        self.state.write().await.active_tab = tab;
    }

    pub async fn set_selected_language(&self, language: Option<String>) {
        self.state.write().await.selected_language = language.filter(|l| !l.trim().is_empty());
    }

    pub async fn selected_language(&self) -> Option<String> {
        self.state.read().await.selected_language.clone()
    }

    pub async fn is_busy(&self) -> bool {
        self.state.read().await.is_busy()
    }

    pub async fn set_in_flight(&self, loading: bool, streaming: bool) {
        let mut state = self.state.write().await;
        state.is_loading = loading;
        state.is_streaming = streaming;
    }

    pub async fn set_last_error(&self, error: Option<String>) {
        self.state.write().await.last_error = error;
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.state.read().await.messages.iter().map(HistoryEntry::from).collect()
    }
}

/// Best-effort pairing of an assistant message with an artifact.
///
/// First match wins among artifacts created within [`ASSOCIATION_WINDOW_MS`] of the
/// message; otherwise the artifact whose position equals the number of assistant
/// messages before `index`. Not a stored relationship: it can misassign when
/// exchanges overlap or one turn produces several artifacts.
pub fn associate_artifact<'a>(messages: &[Message], index: usize, artifacts: &'a [Artifact]) -> Option<&'a Artifact> {
    let message = messages.get(index)?;
    if message.role != Role::Assistant {
        return None;
    }
    let window = TimeDelta::milliseconds(ASSOCIATION_WINDOW_MS);
    artifacts
        .iter()
        .find(|a| (a.created_at - message.timestamp).abs() < window)
        .or_else(|| {
            let prior = messages[..index].iter().filter(|m| m.role == Role::Assistant).count();
            artifacts.get(prior)
        })
}

impl ConversationState {
    pub fn artifact_for_message(&self, index: usize) -> Option<&Artifact> {
        associate_artifact(&self.messages, index, &self.artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn artifact(id: &str, created_at: DateTime<Utc>) -> Artifact {
        Artifact {
            id: id.into(),
            language: "python".into(),
            title: id.into(),
            code: "print(1)".into(),
            created_at,
        }
    }

    fn message(role: Role, at: DateTime<Utc>) -> Message {
        Message { timestamp: at, ..Message::new(role, "") }
    }

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[tokio::test]
    async fn begin_session_reuses_active_session() {
        let store = ConversationStore::new();
        let a = store.begin_session().await;
        let b = store.begin_session().await;
        assert_eq!(a, b);
        store.clear().await;
        assert!(store.session_id().await.is_none());
        assert_ne!(store.begin_session().await, a);
    }

    #[tokio::test]
    async fn streaming_only_grows_the_target_message() {
        let store = ConversationStore::new();
        let user = store.append_message(Role::User, "hi").await;
        let reply = store.append_message(Role::Assistant, "").await;
        let before = store.snapshot().await;

        assert!(store.append_delta(reply.id, "Hel").await);
        assert!(store.append_delta(reply.id, "lo").await);
        assert!(!store.append_delta(Uuid::new_v4(), "lost").await);

        let after = store.snapshot().await;
        assert_eq!(after.messages.len(), 2);
        for (b, a) in before.messages.iter().zip(&after.messages) {
            assert_eq!((b.id, b.role, b.timestamp), (a.id, a.role, a.timestamp));
        }
        assert_eq!(after.message(user.id).unwrap().content, "hi");
        assert_eq!(after.message(reply.id).unwrap().content, "Hello");
        assert!(after.messages[0].timestamp < after.messages[1].timestamp);
    }

    #[tokio::test]
    async fn artifact_and_sidebar_change_together() {
        let store = ConversationStore::new();
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let s = store.snapshot().await;
                    assert_eq!(s.artifacts.is_empty(), !s.sidebar_open);
                    assert_eq!(s.active_artifact.as_deref(), s.artifacts.last().map(|a| a.id.as_str()));
                    tokio::task::yield_now().await;
                }
            })
        };
        for i in 0..50 {
            store.add_artifact(artifact(&format!("a{i}"), Utc::now())).await;
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();
        let s = store.snapshot().await;
        assert_eq!(s.artifacts.len(), 50);
        assert_eq!(s.active_artifact().unwrap().id, "a49");
    }

    #[tokio::test]
    async fn clear_resets_everything_but_language() {
        let store = ConversationStore::new();
        store.begin_session().await;
        store.set_selected_language(Some("rust".into())).await;
        store.append_message(Role::User, "x").await;
        store.add_artifact(artifact("a", Utc::now())).await;
        store.set_active_tab(ActiveTab::Preview).await;
        store.set_last_error(Some("boom".into())).await;

        store.clear().await;
        let s = store.snapshot().await;
        assert_eq!(
            s,
            ConversationState { selected_language: Some("rust".into()), ..ConversationState::default() }
        );
    }

    #[tokio::test]
    async fn active_artifact_must_exist() {
        let store = ConversationStore::new();
        store.add_artifact(artifact("a", Utc::now())).await;
        store.add_artifact(artifact("b", Utc::now())).await;
        assert!(!store.toggle_sidebar().await);
        store.set_active_artifact(Some("a")).await.unwrap();
        let s = store.snapshot().await;
        assert_eq!(s.active_artifact.as_deref(), Some("a"));
        assert!(s.sidebar_open);
        assert!(matches!(
            store.set_active_artifact(Some("missing")).await,
            Err(ChatError::UnknownArtifact(_))
        ));
        assert_eq!(store.snapshot().await.active_artifact.as_deref(), Some("a"));
        assert_eq!(store.artifact_by_id("b").await.unwrap().id, "b");
    }

    #[test]
    fn association_prefers_timestamp_window_then_ordinal() {
        let messages = vec![
            message(Role::User, at(1_000)),
            message(Role::Assistant, at(1_001)),
            message(Role::User, at(9_000)),
            message(Role::Assistant, at(10_002)),
            message(Role::User, at(60_000)),
            message(Role::Assistant, at(60_001)),
        ];
        let artifacts = vec![
            artifact("late", at(30_000)),
            artifact("timed", at(10_000)),
            artifact("third", at(120_000)),
        ];

        assert_eq!(associate_artifact(&messages, 3, &artifacts).unwrap().id, "timed");
        // No artifact near 1.001s: first assistant message takes ordinal 0.
        assert_eq!(associate_artifact(&messages, 1, &artifacts).unwrap().id, "late");
        // Two assistant messages precede index 5.
        assert_eq!(associate_artifact(&messages, 5, &artifacts).unwrap().id, "third");
        assert!(associate_artifact(&messages, 0, &artifacts).is_none());
        assert!(associate_artifact(&messages, 5, &artifacts[..2]).is_none());
    }

    #[test]
    fn association_window_is_exclusive() {
        let messages = vec![message(Role::Assistant, at(0))];
        let edge = vec![artifact("edge", at(5_000)), artifact("inside", at(4_999))];
        assert_eq!(associate_artifact(&messages, 0, &edge).unwrap().id, "inside");
    }
}
