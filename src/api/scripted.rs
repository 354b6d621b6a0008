//! In-memory backend that replays canned answers, for driving the poller,
//! the stream consumer and the flow without a server.

use super::{ApiError, Backend, ByteStream, ChatRequest};
use crate::document::Document;
use crate::models::{FileId, StatusReport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) enum ChatScript {
    Refuse,
    Chunks(Vec<Result<Bytes, ApiError>>),
    /// Deliver the chunks, then never end.
    ChunksThenHang(Vec<Result<Bytes, ApiError>>),
}

pub(crate) fn ok_chunks(parts: &[&str]) -> Vec<Result<Bytes, ApiError>> {
    parts
        .iter()
        .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
        .collect()
}

pub(crate) fn broken_pipe() -> ApiError {
    ApiError::Parse("connection reset by peer".into())
}

pub(crate) struct ScriptedBackend {
    file_id: FileId,
    refuse_submit: bool,
    submit_delay: Duration,
    statuses: Mutex<VecDeque<Result<StatusReport, ApiError>>>,
    status_delay: Duration,
    status_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    chats: Mutex<VecDeque<ChatScript>>,
    chat_requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self {
            file_id: FileId::new("file-1"),
            refuse_submit: false,
            submit_delay: Duration::ZERO,
            statuses: Mutex::new(VecDeque::new()),
            status_delay: Duration::ZERO,
            status_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            chats: Mutex::new(VecDeque::new()),
            chat_requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_file_id(mut self, id: &str) -> Self {
        self.file_id = FileId::new(id);
        self
    }

    pub(crate) fn refusing_submit(mut self) -> Self {
        self.refuse_submit = true;
        self
    }

    pub(crate) fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub(crate) fn with_statuses(self, statuses: &[(&str, f64)]) -> Self {
        {
            let mut queue = self.statuses.lock();
            for (status, progress) in statuses {
                queue.push_back(Ok(StatusReport::new(
                    status,
                    *progress,
                    format!("{} {}", status, progress),
                )));
            }
        }
        self
    }

    pub(crate) fn with_status_error(self, error: ApiError) -> Self {
        self.statuses.lock().push_back(Err(error));
        self
    }

    pub(crate) fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub(crate) fn with_chat(self, script: ChatScript) -> Self {
        self.chats.lock().push_back(script);
        self
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn chat_requests(&self) -> Vec<ChatRequest> {
        self.chat_requests.lock().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn submit(&self, _document: &Document) -> Result<FileId, ApiError> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        if self.refuse_submit {
            return Err(ApiError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(self.file_id.clone())
    }

    async fn status(&self, _file_id: &FileId) -> Result<StatusReport, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Once the script runs out the job just keeps processing.
        self.statuses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(StatusReport::new("processing", 50.0, "still working")))
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ByteStream, ApiError> {
        self.chat_requests.lock().push(request.clone());
        let script = self.chats.lock().pop_front().unwrap_or(ChatScript::Refuse);
        match script {
            ChatScript::Refuse => Err(ApiError::Api {
                status: 502,
                message: "bad gateway".into(),
            }),
            ChatScript::Chunks(chunks) => Ok(stream::iter(chunks).boxed()),
            ChatScript::ChunksThenHang(chunks) => {
                Ok(stream::iter(chunks).chain(stream::pending()).boxed())
            }
        }
    }

    async fn fetch_document(&self, _file_id: &FileId) -> Result<Bytes, ApiError> {
        Ok(Bytes::from_static(b"%PDF-1.4"))
    }
}
