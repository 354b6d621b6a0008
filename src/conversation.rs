use crate::models::{Role, Turn};
use parking_lot::Mutex;
use std::sync::Arc;

pub type SharedConversation = Arc<Mutex<Conversation>>;

/// Names one turn of one conversation. Writes through a handle are refused
/// once the conversation has been reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnHandle {
    index: usize,
    epoch: u64,
}

/// Ordered chat history. Turns are only ever appended, or have their content
/// replaced in place while a reply streams in.
#[derive(Debug, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    epoch: u64,
    greeting: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an opening assistant turn. The greeting is restored on reset.
    pub fn with_greeting(greeting: impl Into<String>) -> Self {
        let greeting = greeting.into();
        Self {
            turns: vec![Turn::assistant(greeting.clone())],
            epoch: 0,
            greeting: Some(greeting),
        }
    }

    pub fn into_shared(self) -> SharedConversation {
        Arc::new(Mutex::new(self))
    }

    /// Append a user turn. Blank text is ignored.
    pub fn append_user(&mut self, text: &str) -> Option<TurnHandle> {
        if text.trim().is_empty() {
            return None;
        }
        Some(self.push(Turn::user(text)))
    }

    pub fn append_assistant_placeholder(&mut self) -> TurnHandle {
        self.push(Turn::assistant(String::new()))
    }

    /// Overwrite the content of the last turn. Returns false on an empty history.
    pub fn replace_trailing(&mut self, text: &str) -> bool {
        match self.turns.last_mut() {
            Some(turn) => {
                turn.content = text.to_string();
                true
            }
            None => false,
        }
    }

    /// Overwrite the turn behind `handle`, if the handle is still current.
    pub fn replace(&mut self, handle: TurnHandle, text: &str) -> bool {
        if handle.epoch != self.epoch {
            return false;
        }
        match self.turns.get_mut(handle.index) {
            Some(turn) => {
                turn.content = text.to_string();
                true
            }
            None => false,
        }
    }

    pub fn is_current(&self, handle: TurnHandle) -> bool {
        handle.epoch == self.epoch && handle.index < self.turns.len()
    }

    /// Snapshot of the last `n` turns, oldest first.
    pub fn windowed(&self, n: usize) -> Vec<Turn> {
        let start = self.turns.len().saturating_sub(n);
        self.turns[start..].to_vec()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn trailing(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Drop all turns and invalidate every outstanding handle.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.turns.clear();
        if let Some(greeting) = &self.greeting {
            self.turns.push(Turn::assistant(greeting.clone()));
        }
    }

    pub fn count(&self, role: Role) -> usize {
        self.turns.iter().filter(|t| t.role == role).count()
    }

    fn push(&mut self, turn: Turn) -> TurnHandle {
        self.turns.push(turn);
        TurnHandle {
            index: self.turns.len() - 1,
            epoch: self.epoch,
        }
    }
}
