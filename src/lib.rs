pub mod artifact;
pub mod client;
pub mod error;
pub mod orchestrator;
pub mod sandbox;
pub mod session;
pub mod settings;
pub mod store;
pub mod stripper;
pub mod transport;

pub use client::ChatApiClient;
pub use error::{ArtifactParseError, ChatError};
pub use orchestrator::{ChatBackend, ChatOrchestrator, ExchangeEvent, ExchangeSummary};
pub use sandbox::{CodeExecutor, ExecutionResult, SandboxRunner};
pub use session::{ActiveTab, Artifact, ConversationState, Message, Role, SessionId};
pub use store::ConversationStore;
pub use stripper::{ArtifactStripper, RawArtifactBlock, Stripped};
