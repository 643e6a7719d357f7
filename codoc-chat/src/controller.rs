//! Chat turn orchestration.
//!
//! The controller is what a front end talks to. It seeds sessions, edits
//! drafts, sends turns, and owns the live [`StreamSession`] of each problem.

use std::sync::Arc;

use codoc_common::util::truncate_chars;
use codoc_common::ChatConfig;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::client::ApiClient;
use crate::error::ChatError;
use crate::message::Message;
use crate::rate_limit::{stream_rate_limit_message, RateLimitGovernor};
use crate::status::ChatStatus;
use crate::store::{SessionPatch, SessionStore, TurnExit};
use crate::stream::{StreamSession, StreamSettings, StreamTarget};

/// Result of [`ChatController::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing sent: empty draft, empty key, or a send already in flight.
    Ignored,
    /// The server finished the turn without a stream.
    Completed,
    Failed,
    /// Conversation-scoped rate limit, with the message shown to the user.
    RateLimited(String),
    /// A stream is open for the turn.
    Streaming { conversation_id: String },
}

#[derive(Clone)]
pub struct ChatController {
    api: ApiClient,
    store: SessionStore,
    streams: Arc<DashMap<String, StreamSession>>,
    settings: StreamSettings,
    max_input_length: usize,
}

impl ChatController {
    pub fn new(api: ApiClient, store: SessionStore, config: &ChatConfig) -> Self {
        Self {
            api,
            store,
            streams: Arc::new(DashMap::new()),
            settings: StreamSettings::from(config),
            max_input_length: config.max_input_length,
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        self.api.governor()
    }

    /// Create the problem's session with the intro message if it is new.
    pub fn open(&self, problem_id: &str) {
        self.store.init(problem_id, vec![Message::intro()]);
    }

    /// Store the draft, capped at the configured length.
    pub fn set_draft(&self, problem_id: &str, text: &str) {
        let draft = truncate_chars(text, self.max_input_length);
        self.store
            .patch(problem_id, SessionPatch::new().draft_input(draft));
    }

    /// Send the current draft as a new turn.
    pub async fn send(&self, problem_id: &str) -> SendOutcome {
        if problem_id.is_empty() {
            return SendOutcome::Ignored;
        }
        self.open(problem_id);

        let text = match self.store.get(problem_id) {
            Some(session) => session.draft_input.trim().to_string(),
            None => return SendOutcome::Ignored,
        };
        if text.is_empty() {
            return SendOutcome::Ignored;
        }

        // A new turn supersedes a live stream.
        if let Some((_, prior)) = self.streams.remove(problem_id) {
            if prior.stop() {
                debug!(problem_id = %problem_id, "Superseded live stream");
            }
        }

        let Some(message_id) = self.store.begin_turn(problem_id, &text) else {
            debug!(problem_id = %problem_id, "Send ignored while a request is in flight");
            return SendOutcome::Ignored;
        };

        info!(problem_id = %problem_id, message_id = %message_id, "Sending chat turn");

        let response = match self.api.send_message(problem_id, &text).await {
            Ok(response) => response,
            Err(e) => return self.fail_turn(problem_id, &message_id, e),
        };

        match response.status {
            Some(ChatStatus::Completed) => {
                return self.end_turn(problem_id, &message_id, TurnExit::Completed);
            }
            Some(ChatStatus::Failed) => {
                return self.end_turn(problem_id, &message_id, TurnExit::Failed);
            }
            Some(ChatStatus::StreamRateLimited) => {
                let notice = stream_rate_limit_message(None);
                return self.end_turn(problem_id, &message_id, TurnExit::RateLimited(notice));
            }
            _ => {}
        }

        let Some(conversation_id) = response.conversation_id else {
            return self.fail_turn(problem_id, &message_id, ChatError::MissingConversationId);
        };

        let stream = match self.api.open_stream(&conversation_id).await {
            Ok(response) => response.bytes_stream(),
            Err(e) => return self.fail_turn(problem_id, &message_id, e),
        };

        if !self.store.bind_stream(problem_id, &message_id, &conversation_id) {
            debug!(problem_id = %problem_id, "Turn was reset before its stream opened");
            return SendOutcome::Ignored;
        }

        let session = StreamSession::start(
            stream,
            StreamTarget {
                problem_id: problem_id.to_string(),
                message_id,
                conversation_id: conversation_id.clone(),
            },
            self.store.clone(),
            self.settings,
        );
        self.streams.insert(problem_id.to_string(), session);

        SendOutcome::Streaming { conversation_id }
    }

    /// User cancellation of the current turn.
    ///
    /// Buffered tokens are kept and the session goes back to idle.
    pub fn stop(&self, problem_id: &str) -> bool {
        if let Some((_, session)) = self.streams.remove(problem_id) {
            return session.stop();
        }
        self.unbind_pending(problem_id)
    }

    /// The view went away: close the stream without flushing and unbind.
    pub fn detach(&self, problem_id: &str) {
        if let Some((_, session)) = self.streams.remove(problem_id) {
            session.close();
            let target = session.target();
            self.store
                .finish_turn(&target.problem_id, &target.message_id, &TurnExit::Stopped);
            debug!(problem_id = %problem_id, "Stream detached");
        }
    }

    /// Close the problem's stream and start its session over.
    pub fn reset(&self, problem_id: &str) {
        if let Some((_, session)) = self.streams.remove(problem_id) {
            session.close();
        }
        self.store.reset(problem_id);
    }

    /// Navigation left the study flow: close every stream and drop all sessions.
    pub fn leave_study_flow(&self) {
        let keys: Vec<String> = self.streams.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, session)) = self.streams.remove(&key) {
                session.close();
            }
        }
        self.store.clear_all();
    }

    /// Wait until the problem's stream task has exited.
    pub async fn wait_idle(&self, problem_id: &str) {
        let session = self.streams.get(problem_id).map(|entry| entry.value().clone());
        if let Some(session) = session {
            session.finished().await;
            self.streams
                .remove_if(problem_id, |_, live| live.is_finished());
        }
    }

    fn end_turn(&self, problem_id: &str, message_id: &str, exit: TurnExit) -> SendOutcome {
        if !self.store.finish_turn(problem_id, message_id, &exit) {
            debug!(problem_id = %problem_id, "Turn was stopped or reset before its response");
            return SendOutcome::Ignored;
        }
        info!(problem_id = %problem_id, exit = ?exit, "Turn ended without a stream");
        match exit {
            TurnExit::Completed => SendOutcome::Completed,
            TurnExit::RateLimited(notice) => SendOutcome::RateLimited(notice),
            TurnExit::Failed | TurnExit::Stopped => SendOutcome::Failed,
        }
    }

    fn fail_turn(&self, problem_id: &str, message_id: &str, error: ChatError) -> SendOutcome {
        warn!(problem_id = %problem_id, error = %error, "Chat turn failed");
        let exit = match error {
            ChatError::StreamRateLimited { retry_after_secs } => {
                TurnExit::RateLimited(stream_rate_limit_message(retry_after_secs))
            }
            _ => TurnExit::Failed,
        };
        self.end_turn(problem_id, message_id, exit)
    }

    fn unbind_pending(&self, problem_id: &str) -> bool {
        let pending = self
            .store
            .get(problem_id)
            .and_then(|session| session.pending_assistant_message_id);
        match pending {
            Some(message_id) => self
                .store
                .finish_turn(problem_id, &message_id, &TurnExit::Stopped),
            None => false,
        }
    }
}
