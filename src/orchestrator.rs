use std::collections::HashSet;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactPayload, parse_artifact};
use crate::error::ChatError;
use crate::session::{Artifact, Role, SessionId};
use crate::store::ConversationStore;
use crate::stripper::{ArtifactStripper, Stripped};
use crate::transport::{ChatRequest, ChunkStream};

const EVENT_CAPACITY: usize = 256;

/// Opens the response stream for one exchange.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream, ChatError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeEvent {
    Started { session_id: SessionId, message_id: Uuid },
    Delta { message_id: Uuid, text: String },
    Artifact { artifact: Artifact },
    Completed { message_id: Uuid, completed: bool },
    Failed { message_id: Uuid, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSummary {
    pub session_id: SessionId,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub artifacts_added: usize,
    /// False when the stream ended without a `done` record.
    pub completed: bool,
}

#[derive(Debug, Clone, Copy)]
enum ArtifactSource {
    Server,
    Markup,
}

/// State owned by one in-flight exchange.
struct Exchange {
    message_id: Uuid,
    stripper: ArtifactStripper,
    added: usize,
    // Whitespace-normalized code of every artifact kept so far.
    seen: HashSet<String>,
    completed: bool,
}

impl Exchange {
    fn new(message_id: Uuid) -> Self {
        Self { message_id, stripper: ArtifactStripper::new(), added: 0, seen: HashSet::new(), completed: false }
    }

    /// An artifact is kept once per exchange, from whichever source reports its code first.
    fn admit(&mut self, payload: &ArtifactPayload) -> bool {
        let key = payload.code.split_whitespace().collect::<Vec<_>>().join(" ");
        if !self.seen.insert(key) {
            return false;
        }
        self.added += 1;
        true
    }
}

pub fn with_language_hint(language: Option<&str>, text: &str) -> String {
    match language {
        Some(lang) if !lang.trim().is_empty() => format!("(language: {}) {text}", lang.trim()),
        _ => text.to_string(),
    }
}

pub struct ChatOrchestrator<B: ChatBackend> {
    backend: B,
    store: ConversationStore,
    events: broadcast::Sender<ExchangeEvent>,
}

impl<B: ChatBackend> ChatOrchestrator<B> {
    pub fn new(backend: B, store: ConversationStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { backend, store, events }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    pub async fn clear_conversation(&self) {
        self.store.clear().await;
    }

    pub async fn send(&self, user_text: &str) -> Result<ExchangeSummary, ChatError> {
        self.send_with_cancel(user_text, CancellationToken::new()).await
    }

    /// Runs one request/response cycle. Partial assistant text survives failures and
    /// cancellation; the failure itself goes to the caller and `last_error`.
    pub async fn send_with_cancel(&self, user_text: &str, cancel: CancellationToken) -> Result<ExchangeSummary, ChatError> {
        if self.store.is_busy().await {
            warn!("send while another exchange is in flight");
        }
        let session_id = self.store.begin_session().await;
        let language = self.store.selected_language().await;
        let content = with_language_hint(language.as_deref(), user_text);

        let user = self.store.append_message(Role::User, content.clone()).await;
        let reply = self.store.append_message(Role::Assistant, "").await;
        self.store.set_last_error(None).await;
        self.store.set_in_flight(true, true).await;
        metrics::counter!("artifact_chat_exchanges_total").increment(1);
        self.emit(ExchangeEvent::Started { session_id, message_id: reply.id });

        let request = ChatRequest {
            message: content,
            session_id,
            conversation_history: self.store.history().await,
        };

        let mut exchange = Exchange::new(reply.id);
        let outcome = self.drive(&request, &mut exchange, &cancel).await;
        self.store.set_in_flight(false, false).await;

        match outcome {
            Ok(()) => {
                info!(%session_id, artifacts = exchange.added, completed = exchange.completed, "exchange finished");
                self.emit(ExchangeEvent::Completed { message_id: reply.id, completed: exchange.completed });
                Ok(ExchangeSummary {
                    session_id,
                    user_message_id: user.id,
                    assistant_message_id: reply.id,
                    artifacts_added: exchange.added,
                    completed: exchange.completed,
                })
            }
            Err(e) => {
                warn!(%session_id, error = %e, "exchange failed");
                self.store.set_last_error(Some(e.to_string())).await;
                self.emit(ExchangeEvent::Failed { message_id: reply.id, error: e.to_string() });
                Err(e)
            }
        }
    }

    /// Pumps the stream. The stripper is finished on every outcome, so held-back prose
    /// is never lost from the kept answer.
    async fn drive(&self, request: &ChatRequest, exchange: &mut Exchange, cancel: &CancellationToken) -> Result<(), ChatError> {
        let outcome = self.pump(request, exchange, cancel).await;
        let tail = exchange.stripper.finish();
        self.apply(exchange, tail).await;
        outcome
    }

    async fn pump(&self, request: &ChatRequest, exchange: &mut Exchange, cancel: &CancellationToken) -> Result<(), ChatError> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            opened = self.backend.open_stream(request) => opened?,
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                next = stream.next() => next,
            };
            let Some(item) = next else { break };
            let chunk = item?;

            if let Some(error) = chunk.error_message() {
                return Err(ChatError::StreamFailed(error.to_string()));
            }
            if !chunk.delta.is_empty() {
                let stripped = exchange.stripper.process(&chunk.delta);
                self.apply(exchange, stripped).await;
            }
            if let Some(payload) = chunk.artifact() {
                self.offer(exchange, ArtifactSource::Server, payload).await;
            }
            if chunk.done {
                exchange.completed = true;
                break;
            }
        }
        Ok(())
    }

    async fn apply(&self, exchange: &mut Exchange, stripped: Stripped) {
        if !stripped.visible.is_empty() {
            self.store.append_delta(exchange.message_id, &stripped.visible).await;
            self.emit(ExchangeEvent::Delta { message_id: exchange.message_id, text: stripped.visible });
        }
        for block in stripped.blocks {
            match parse_artifact(&block) {
                Ok(payload) => self.offer(exchange, ArtifactSource::Markup, payload).await,
                Err(e) => debug!(error = %e, "discarding artifact block"),
            }
        }
    }

    async fn offer(&self, exchange: &mut Exchange, source: ArtifactSource, payload: ArtifactPayload) {
        if !exchange.admit(&payload) {
            debug!(?source, title = %payload.title, "artifact with the same code already kept");
            return;
        }
        let artifact = payload.into_artifact();
        metrics::counter!("artifact_chat_artifacts_total").increment(1);
        self.store.add_artifact(artifact.clone()).await;
        self.emit(ExchangeEvent::Artifact { artifact });
    }

    fn emit(&self, event: ExchangeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
