//! Owned state for one tutoring session: the uploaded document, the chat
//! history and whatever background work is feeding them.

use crate::api::{Backend, ChatRequest};
use crate::chat::{StreamConsumer, StreamOutcome};
use crate::config::Config;
use crate::conversation::{Conversation, SharedConversation};
use crate::document::Document;
use crate::models::{FileId, UploadJob};
use crate::session::SessionRegistry;
use crate::upload::{PollConfig, UploadFailure, UploadOutcome, UploadPoller, UploadTracker};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Flow<B: Backend> {
    config: Config,
    backend: Arc<B>,
    session: SessionRegistry,
    conversation: SharedConversation,
    poller: UploadPoller<B>,
    consumer: StreamConsumer<B>,
    tracker: Mutex<Option<UploadTracker>>,
    /// Held for the whole of one exchange so replies never interleave.
    exchange: tokio::sync::Mutex<()>,
    stream_cancel: Mutex<CancellationToken>,
}

impl<B: Backend> Flow<B> {
    pub fn init(backend: Arc<B>, config: Config) -> Self {
        let session = SessionRegistry::new();
        let conversation = match &config.greeting {
            Some(greeting) => Conversation::with_greeting(greeting.clone()),
            None => Conversation::new(),
        };
        let poller = UploadPoller::new(backend.clone(), session.clone(), PollConfig::from(&config));
        let consumer = StreamConsumer::new(backend.clone()).with_timeout(config.stream_timeout);

        Self {
            config,
            backend,
            session,
            conversation: conversation.into_shared(),
            poller,
            consumer,
            tracker: Mutex::new(None),
            exchange: tokio::sync::Mutex::new(()),
            stream_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn session(&self) -> &SessionRegistry {
        &self.session
    }

    pub fn conversation(&self) -> SharedConversation {
        self.conversation.clone()
    }

    pub fn active_file(&self) -> Option<FileId> {
        self.session.get()
    }

    /// Submit a document and start tracking it in the background. Returns the
    /// progress feed of the new job, or `None` if [`Flow::reset`] ran while the
    /// document was being submitted.
    pub async fn start_upload(
        &self,
        document: &Document,
    ) -> Result<Option<watch::Receiver<UploadJob>>, UploadFailure> {
        let Some(tracker) = self.poller.upload(document).await? else {
            return Ok(None);
        };
        let updates = tracker.subscribe();
        // Replacing an older tracker drops it, which stops its run.
        *self.tracker.lock() = Some(tracker);
        Ok(Some(updates))
    }

    /// Wait for the upload started by [`Flow::start_upload`] to resolve.
    pub async fn wait_for_upload(&self) -> Option<UploadOutcome> {
        let mut tracker = self.tracker.lock().take()?;
        Some(tracker.outcome().await)
    }

    /// Submit a document and wait until it is ready or has failed.
    pub async fn upload(&self, document: &Document) -> UploadOutcome {
        match self.start_upload(document).await {
            Ok(Some(_)) => {}
            Ok(None) => return UploadOutcome::Cancelled,
            Err(failure) => return UploadOutcome::Failed(failure),
        }
        self.wait_for_upload()
            .await
            .unwrap_or(UploadOutcome::Cancelled)
    }

    pub fn upload_progress(&self) -> Option<watch::Receiver<UploadJob>> {
        self.tracker.lock().as_ref().map(|t| t.subscribe())
    }

    /// Append the user's message and stream the assistant's reply into the
    /// conversation. Returns `None` for blank input. A second call waits for
    /// the first exchange to finish.
    pub async fn send_message(
        &self,
        text: &str,
        on_update: impl FnMut(&str),
    ) -> Option<StreamOutcome> {
        let _exchange = self.exchange.lock().await;
        let cancel = self.stream_cancel.lock().clone();

        let request = {
            let mut conversation = self.conversation.lock();
            let history = conversation.windowed(self.config.history_window);
            conversation.append_user(text)?;
            ChatRequest {
                message: text.to_string(),
                history,
                file_id: self.session.get(),
            }
        };

        Some(
            self.consumer
                .send(&self.conversation, &request, &cancel, on_update)
                .await,
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.exchange.try_lock().is_err()
    }

    /// "Choose another file": detach the document, stop background work and
    /// start the conversation over.
    pub fn reset(&self) {
        info!(file_id = ?self.session.get(), "resetting session");
        self.session.clear();
        self.tracker.lock().take();
        self.cancel_stream();
        self.conversation.lock().reset();
    }

    /// Stop all background work. State is left as it was.
    pub fn teardown(&self) {
        debug!("tearing down flow");
        self.session.stop_tracking();
        self.tracker.lock().take();
        self.cancel_stream();
    }

    fn cancel_stream(&self) {
        let mut cancel = self.stream_cancel.lock();
        cancel.cancel();
        *cancel = CancellationToken::new();
    }
}

impl<B: Backend> Drop for Flow<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scripted::{ok_chunks, ChatScript, ScriptedBackend};
    use crate::chat::{CONNECTION_ERROR, INTERRUPTED};
    use crate::models::{Role, Turn};
    use std::time::Duration;

    fn pdf() -> Document {
        Document::from_bytes("lecture.pdf", b"%PDF-1.4".to_vec()).unwrap()
    }

    fn quiet_config() -> Config {
        Config {
            greeting: None,
            ..Config::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_then_chat_attaches_file() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_file_id("doc-7")
                .with_statuses(&[("uploading", 10.0), ("completed", 100.0)])
                .with_chat(ChatScript::Chunks(ok_chunks(&["Hel", "lo!"]))),
        );
        let flow = Flow::init(backend.clone(), quiet_config());

        assert_eq!(flow.upload(&pdf()).await, UploadOutcome::Completed(FileId::new("doc-7")));
        assert_eq!(flow.active_file(), Some(FileId::new("doc-7")));

        let mut seen = Vec::new();
        let outcome = flow
            .send_message("Hi", |text| seen.push(text.to_string()))
            .await;

        assert_eq!(outcome, Some(StreamOutcome::Completed("Hello!".into())));
        assert_eq!(seen, vec!["", "Hel", "Hello!"]);
        let requests = backend.chat_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, "Hi");
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[0].file_id, Some(FileId::new("doc-7")));
    }

    #[tokio::test]
    async fn test_blank_message_sends_nothing() {
        let backend = Arc::new(ScriptedBackend::new());
        let flow = Flow::init(backend.clone(), Config::default());
        let before = flow.conversation().lock().len();

        assert!(flow.send_message("   ", |_| {}).await.is_none());
        assert_eq!(flow.conversation().lock().len(), before);
        assert!(backend.chat_requests().is_empty());
    }

    #[tokio::test]
    async fn test_history_window_is_bounded() {
        let mut backend = ScriptedBackend::new();
        for i in 0..4 {
            let reply = format!("reply {}", i);
            backend = backend.with_chat(ChatScript::Chunks(ok_chunks(&[reply.as_str()])));
        }
        let backend = Arc::new(backend);
        let config = Config {
            history_window: 3,
            ..Config::default()
        };
        let flow = Flow::init(backend.clone(), config);

        for i in 0..4 {
            flow.send_message(&format!("question {}", i), |_| {}).await;
        }

        let requests = backend.chat_requests();
        // Greeting only, before any exchange.
        assert_eq!(requests[0].history, vec![Turn::assistant(crate::config::DEFAULT_GREETING)]);
        let last = &requests[3];
        assert_eq!(
            last.history,
            vec![
                Turn::assistant("reply 1"),
                Turn::user("question 2"),
                Turn::assistant("reply 2"),
            ]
        );
        assert!(last.history.iter().all(|t| !t.content.is_empty()));
        assert_eq!(flow.conversation().lock().len(), 9);
    }

    #[tokio::test]
    async fn test_failed_exchange_leaves_error_turn() {
        let backend = Arc::new(ScriptedBackend::new().with_chat(ChatScript::Refuse));
        let flow = Flow::init(backend, quiet_config());

        let outcome = flow.send_message("Hi", |_| {}).await;
        assert!(matches!(outcome, Some(StreamOutcome::Failed(_))));
        assert_eq!(
            flow.conversation().lock().turns(),
            &[Turn::user("Hi"), Turn::assistant(CONNECTION_ERROR)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_mid_poll_stops_tracking() {
        let backend = Arc::new(ScriptedBackend::new());
        let flow = Flow::init(backend.clone(), Config::default());
        let progress = flow.start_upload(&pdf()).await.unwrap().expect("tracking started");

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let before = progress.borrow().clone();
        flow.reset();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(backend.status_calls(), 2);
        assert_eq!(*progress.borrow(), before);
        assert!(flow.active_file().is_none());
        assert!(flow.upload_progress().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_submission_keeps_session_clear() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_file_id("old-doc")
                .with_submit_delay(Duration::from_secs(3))
                .with_statuses(&[("completed", 100.0)]),
        );
        let flow = Flow::init(backend.clone(), Config::default());

        let doc = pdf();
        let (outcome, _) = tokio::join!(flow.upload(&doc), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flow.reset();
        });

        assert_eq!(outcome, UploadOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(flow.active_file().is_none());
        assert!(flow.upload_progress().is_none());
        assert!(!flow.session().is_tracking());
        assert_eq!(backend.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_while_waiting_for_upload() {
        let backend = Arc::new(ScriptedBackend::new());
        let flow = Flow::init(backend.clone(), Config::default());
        flow.start_upload(&pdf()).await.unwrap();

        let (outcome, _) = tokio::join!(flow.wait_for_upload(), async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            flow.reset();
        });

        assert_eq!(outcome, Some(UploadOutcome::Cancelled));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_mid_stream_discards_reply() {
        let backend = Arc::new(
            ScriptedBackend::new().with_chat(ChatScript::ChunksThenHang(ok_chunks(&["Par"]))),
        );
        let flow = Flow::init(backend, Config::default());

        let (outcome, _) = tokio::join!(flow.send_message("Hi", |_| {}), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flow.reset();
        });

        assert_eq!(outcome, Some(StreamOutcome::Cancelled));
        assert_eq!(
            flow.conversation().lock().turns(),
            &[Turn::assistant(crate::config::DEFAULT_GREETING)]
        );
        assert!(!flow.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_mid_stream_marks_reply_interrupted() {
        let backend = Arc::new(
            ScriptedBackend::new().with_chat(ChatScript::ChunksThenHang(ok_chunks(&["Par"]))),
        );
        let flow = Flow::init(backend, quiet_config());

        let (outcome, _) = tokio::join!(flow.send_message("Hi", |_| {}), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flow.teardown();
        });

        assert_eq!(outcome, Some(StreamOutcome::Cancelled));
        assert_eq!(
            flow.conversation().lock().turns(),
            &[Turn::user("Hi"), Turn::assistant(INTERRUPTED)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_serialized() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_chat(ChatScript::Chunks(ok_chunks(&["first ", "answer"])))
                .with_chat(ChatScript::Chunks(ok_chunks(&["second answer"]))),
        );
        let flow = Flow::init(backend.clone(), quiet_config());

        let (a, b) = tokio::join!(
            flow.send_message("one", |_| {}),
            flow.send_message("two", |_| {})
        );

        assert_eq!(a, Some(StreamOutcome::Completed("first answer".into())));
        assert_eq!(b, Some(StreamOutcome::Completed("second answer".into())));
        assert_eq!(
            flow.conversation().lock().turns(),
            &[
                Turn::user("one"),
                Turn::assistant("first answer"),
                Turn::user("two"),
                Turn::assistant("second answer"),
            ]
        );
        assert_eq!(backend.chat_requests()[1].history.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_background_polling() {
        let backend = Arc::new(ScriptedBackend::new());
        {
            let flow = Flow::init(backend.clone(), Config::default());
            flow.start_upload(&pdf()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_failure_reported() {
        let backend = Arc::new(ScriptedBackend::new().refusing_submit());
        let flow = Flow::init(backend.clone(), Config::default());

        let outcome = flow.upload(&pdf()).await;
        assert!(matches!(outcome, UploadOutcome::Failed(UploadFailure::Submission(_))));
        assert_eq!(flow.conversation().lock().count(Role::User), 0);
        assert_eq!(backend.status_calls(), 0);
    }
}
