pub mod http;
#[cfg(test)]
pub(crate) mod scripted;

use crate::document::Document;
use crate::models::{FileId, StatusReport, Turn};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use http::HttpBackend;

/// Body of one conversational exchange.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<Turn>,
    pub file_id: Option<FileId>,
}

/// Raw reply body of a chat exchange, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes, ApiError>>;

/// Remote collaborator as seen by the orchestration core.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn submit(&self, document: &Document) -> Result<FileId, ApiError>;

    async fn status(&self, file_id: &FileId) -> Result<StatusReport, ApiError>;

    /// Open a chat exchange. The returned stream ends when the reply is done.
    async fn chat(&self, request: &ChatRequest) -> Result<ByteStream, ApiError>;

    async fn fetch_document(&self, file_id: &FileId) -> Result<Bytes, ApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}
