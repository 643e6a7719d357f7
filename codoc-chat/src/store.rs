//! Per-problem conversation sessions.
//!
//! The store maps a problem id to its [`ConversationSession`]. Mutations are
//! synchronous and applied in call order. Subscribers receive the key of
//! every session that changed.
//!
//! Stream-driven mutations go through the generation-checked helpers, which
//! apply only while the supplied message id is still the session's pending
//! assistant message. A superseded or detached stream can therefore never
//! touch the wrong message.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::message::Message;

/// Content of a failed turn.
pub const STREAM_FAILED_MESSAGE: &str = "Request failed. Please try again.";

const CHANGE_CAPACITY: usize = 256;

/// Conversation state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversationStatus {
    #[default]
    Idle,
    /// The send-turn request is in flight.
    Sending,
    /// A stream is bound to the pending assistant message.
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSession {
    pub messages: Vec<Message>,
    pub draft_input: String,
    pub conversation_id: Option<String>,
    pub pending_assistant_message_id: Option<String>,
    pub is_streaming: bool,
    pub last_error: Option<String>,
    pub status: ConversationStatus,
}

impl ConversationSession {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn pending_message(&self) -> Option<&Message> {
        let id = self.pending_assistant_message_id.as_deref()?;
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending_assistant_message_id.as_deref() == Some(message_id)
    }

    fn pending_message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        if !self.is_pending(message_id) {
            return None;
        }
        self.messages.iter_mut().find(|m| m.id == message_id)
    }

    fn remove_message(&mut self, message_id: &str) {
        self.messages.retain(|m| m.id != message_id);
    }
}

/// Shallow update of a session. Unset fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    messages: Option<Vec<Message>>,
    draft_input: Option<String>,
    conversation_id: Option<Option<String>>,
    pending_assistant_message_id: Option<Option<String>>,
    is_streaming: Option<bool>,
    last_error: Option<Option<String>>,
    status: Option<ConversationStatus>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn draft_input(mut self, draft: impl Into<String>) -> Self {
        self.draft_input = Some(draft.into());
        self
    }

    pub fn conversation_id(mut self, id: Option<String>) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn pending_assistant_message_id(mut self, id: Option<String>) -> Self {
        self.pending_assistant_message_id = Some(id);
        self
    }

    pub fn is_streaming(mut self, streaming: bool) -> Self {
        self.is_streaming = Some(streaming);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn status(mut self, status: ConversationStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn apply(self, session: &mut ConversationSession) {
        if let Some(messages) = self.messages {
            session.messages = messages;
        }
        if let Some(draft) = self.draft_input {
            session.draft_input = draft;
        }
        if let Some(id) = self.conversation_id {
            session.conversation_id = id;
        }
        if let Some(id) = self.pending_assistant_message_id {
            session.pending_assistant_message_id = id;
        }
        if let Some(streaming) = self.is_streaming {
            session.is_streaming = streaming;
        }
        if let Some(error) = self.last_error {
            session.last_error = error;
        }
        if let Some(status) = self.status {
            session.status = status;
        }
    }
}

/// How a turn left the `Sending`/`Streaming` states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnExit {
    Completed,
    Failed,
    /// Conversation-scoped rate limit with its user-facing message.
    RateLimited(String),
    /// User cancellation or view detach.
    Stopped,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Updated(String),
    Cleared,
}

/// Shared map from problem id to conversation session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, ConversationSession>>,
    changes: broadcast::Sender<SessionChange>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            sessions: Arc::new(DashMap::new()),
            changes,
        }
    }

    /// Receive the key of every changed session.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    /// Snapshot of a session.
    pub fn get(&self, key: &str) -> Option<ConversationSession> {
        self.sessions.get(key).map(|session| session.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session seeded with `seed` unless one already exists.
    pub fn init(&self, key: &str, seed: Vec<Message>) {
        if key.is_empty() {
            return;
        }
        let mut created = false;
        self.sessions.entry(key.to_string()).or_insert_with(|| {
            created = true;
            ConversationSession::with_messages(seed)
        });
        if created {
            debug!(problem_id = %key, "Session initialized");
            self.notify(key);
        }
    }

    /// Shallow-merge `patch`, creating a default session first if missing.
    pub fn patch(&self, key: &str, patch: SessionPatch) {
        if key.is_empty() {
            return;
        }
        patch.apply(&mut self.sessions.entry(key.to_string()).or_default());
        self.notify(key);
    }

    /// Replace a session with a fresh default.
    pub fn reset(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        self.sessions
            .insert(key.to_string(), ConversationSession::default());
        debug!(problem_id = %key, "Session reset");
        self.notify(key);
    }

    /// Discard every session.
    pub fn clear_all(&self) {
        self.sessions.clear();
        debug!("All sessions cleared");
        let _ = self.changes.send(SessionChange::Cleared);
    }

    // ------------------------------------------------------------------------
    // Turn lifecycle
    // ------------------------------------------------------------------------

    /// Start a turn: append the user message and an empty assistant
    /// placeholder, and move to `Sending`.
    ///
    /// Returns the placeholder id, or `None` when the session is missing or
    /// a turn is already in progress.
    pub fn begin_turn(&self, key: &str, text: &str) -> Option<String> {
        let placeholder_id = {
            let mut session = self.sessions.get_mut(key)?;
            if matches!(
                session.status,
                ConversationStatus::Sending | ConversationStatus::Streaming
            ) {
                return None;
            }

            let placeholder = Message::assistant_placeholder();
            let placeholder_id = placeholder.id.clone();
            session.messages.push(Message::user(text));
            session.messages.push(placeholder);
            session.draft_input.clear();
            session.last_error = None;
            session.conversation_id = None;
            session.pending_assistant_message_id = Some(placeholder_id.clone());
            session.is_streaming = false;
            session.status = ConversationStatus::Sending;
            placeholder_id
        };
        self.notify(key);
        Some(placeholder_id)
    }

    /// Bind a stream to the pending message and move to `Streaming`.
    pub fn bind_stream(&self, key: &str, message_id: &str, conversation_id: &str) -> bool {
        self.update_pending(key, message_id, |session| {
            session.conversation_id = Some(conversation_id.to_string());
            session.is_streaming = true;
            session.status = ConversationStatus::Streaming;
        })
    }

    /// Append flushed token text to the pending message.
    pub fn append_to_pending(&self, key: &str, message_id: &str, text: &str) -> bool {
        self.update_pending(key, message_id, |session| {
            if let Some(message) = session.pending_message_mut(message_id) {
                message.content.push_str(text);
            }
        })
    }

    /// Replace the pending message's content with the final text.
    pub fn replace_pending(&self, key: &str, message_id: &str, text: &str) -> bool {
        self.update_pending(key, message_id, |session| {
            if let Some(message) = session.pending_message_mut(message_id) {
                message.content = text.to_string();
            }
        })
    }

    /// Flag the pending message for the summary follow-up.
    pub fn mark_summary_ready(&self, key: &str, message_id: &str) -> bool {
        self.update_pending(key, message_id, |session| {
            if let Some(message) = session.pending_message_mut(message_id) {
                message.meta.show_summary_cta = true;
            }
        })
    }

    /// Leave the turn: settle the placeholder, unbind, and record the exit.
    pub fn finish_turn(&self, key: &str, message_id: &str, exit: &TurnExit) -> bool {
        self.update_pending(key, message_id, |session| {
            let blank = session
                .pending_message()
                .map_or(true, Message::is_blank);

            match exit {
                TurnExit::Completed | TurnExit::Stopped => {
                    if blank {
                        session.remove_message(message_id);
                    }
                }
                TurnExit::Failed => {
                    if blank {
                        session.remove_message(message_id);
                        session.last_error = Some(STREAM_FAILED_MESSAGE.to_string());
                    } else if let Some(message) = session.pending_message_mut(message_id) {
                        message.content = STREAM_FAILED_MESSAGE.to_string();
                    }
                }
                TurnExit::RateLimited(notice) => {
                    if blank {
                        session.remove_message(message_id);
                    }
                    session.last_error = Some(notice.clone());
                }
            }

            session.status = match exit {
                TurnExit::Completed => ConversationStatus::Completed,
                TurnExit::Stopped => ConversationStatus::Idle,
                TurnExit::Failed | TurnExit::RateLimited(_) => ConversationStatus::Failed,
            };
            session.pending_assistant_message_id = None;
            session.is_streaming = false;
            session.conversation_id = None;
        })
    }

    fn update_pending(
        &self,
        key: &str,
        message_id: &str,
        f: impl FnOnce(&mut ConversationSession),
    ) -> bool {
        let applied = match self.sessions.get_mut(key) {
            Some(mut session) if session.is_pending(message_id) => {
                f(&mut session);
                true
            }
            _ => false,
        };

        if applied {
            self.notify(key);
        } else {
            debug!(problem_id = %key, message_id = %message_id, "Dropping stale session update");
        }
        applied
    }

    fn notify(&self, key: &str) {
        // No subscribers is fine.
        let _ = self.changes.send(SessionChange::Updated(key.to_string()));
    }
}
