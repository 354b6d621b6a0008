pub mod api;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod document;
pub mod flow;
pub mod models;
pub mod session;
pub mod upload;

pub use api::{ApiError, Backend, ChatRequest, HttpBackend};
pub use chat::{StreamConsumer, StreamOutcome, CONNECTION_ERROR, INTERRUPTED};
pub use config::Config;
pub use conversation::{Conversation, SharedConversation, TurnHandle};
pub use document::{Document, DocumentError};
pub use flow::Flow;
pub use models::{FileId, JobPhase, Role, StatusReport, Turn, UploadJob};
pub use session::{SessionRegistry, TerminalStatus};
pub use upload::{PollConfig, UploadFailure, UploadOutcome, UploadPoller, UploadTracker};
