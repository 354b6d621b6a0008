use crate::models::FileId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How the last tracked upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed(String),
}

/// Identifies one tracking run registered with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingTicket(u64);

#[derive(Debug, Default)]
struct SessionState {
    active_file_id: Option<FileId>,
    last_status: Option<TerminalStatus>,
    tracking: Option<(TrackingTicket, CancellationToken)>,
    next_run: u64,
    generation: u64,
}

/// Holds the active document for the conversation. Cheap to clone; all
/// clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<FileId> {
        self.inner.lock().active_file_id.clone()
    }

    pub fn set(&self, id: FileId) {
        let mut state = self.inner.lock();
        state.active_file_id = Some(id);
        state.last_status = Some(TerminalStatus::Completed);
    }

    /// Forget the active document and stop any tracking run still in progress.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        Self::cancel_tracking(&mut state);
        state.active_file_id = None;
        state.last_status = None;
        state.generation += 1;
    }

    /// Bumped by every [`SessionRegistry::clear`]. Work started under an older
    /// generation must not attach to the session.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Stop the tracking run in progress, keeping the active document.
    pub fn stop_tracking(&self) {
        Self::cancel_tracking(&mut self.inner.lock());
    }

    pub fn last_status(&self) -> Option<TerminalStatus> {
        self.inner.lock().last_status.clone()
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.lock().tracking.is_some()
    }

    /// Register a new tracking run, cancelling the previous one.
    pub fn attach_tracking(&self, token: CancellationToken) -> TrackingTicket {
        let mut state = self.inner.lock();
        Self::register(&mut state, token)
    }

    /// Register a new tracking run only if the session has not been cleared
    /// since `generation` was read.
    pub fn attach_tracking_at(
        &self,
        generation: u64,
        token: CancellationToken,
    ) -> Option<TrackingTicket> {
        let mut state = self.inner.lock();
        if state.generation != generation {
            debug!(expected = generation, current = state.generation, "session was reset, not tracking");
            return None;
        }
        Some(Self::register(&mut state, token))
    }

    /// Record a completed upload. Refused if the run was cancelled or replaced.
    pub fn complete(&self, ticket: TrackingTicket, id: FileId) -> bool {
        let mut state = self.inner.lock();
        if !Self::owns(&state, ticket) {
            return false;
        }
        state.tracking = None;
        state.active_file_id = Some(id);
        state.last_status = Some(TerminalStatus::Completed);
        true
    }

    /// Record a failed upload. Refused if the run was cancelled or replaced.
    pub fn fail(&self, ticket: TrackingTicket, message: String) -> bool {
        let mut state = self.inner.lock();
        if !Self::owns(&state, ticket) {
            return false;
        }
        state.tracking = None;
        state.last_status = Some(TerminalStatus::Failed(message));
        true
    }

    /// Release the registration without touching the session, e.g. when the
    /// tracker was dropped.
    pub fn detach(&self, ticket: TrackingTicket) {
        let mut state = self.inner.lock();
        if matches!(&state.tracking, Some((current, _)) if *current == ticket) {
            state.tracking = None;
        }
    }

    fn register(state: &mut SessionState, token: CancellationToken) -> TrackingTicket {
        if let Some((_, previous)) = state.tracking.take() {
            previous.cancel();
        }
        state.next_run += 1;
        let ticket = TrackingTicket(state.next_run);
        state.tracking = Some((ticket, token));
        ticket
    }

    fn cancel_tracking(state: &mut SessionState) {
        if let Some((ticket, token)) = state.tracking.take() {
            debug!(run = ticket.0, "cancelling upload tracking");
            token.cancel();
        }
    }

    fn owns(state: &SessionState, ticket: TrackingTicket) -> bool {
        matches!(&state.tracking, Some((current, token)) if *current == ticket && !token.is_cancelled())
    }
}
