//! Live stream sessions.
//!
//! A [`StreamSession`] owns one open event stream bound to one pending
//! assistant message. It runs as a spawned task with two halves:
//! - a reader that decodes bytes into [`StreamEvent`]s and sends them over a
//!   bounded channel, in arrival order;
//! - a driver that coalesces tokens, applies the turn state machine, and
//!   writes to the [`SessionStore`].
//!
//! # Cancellation
//!
//! Every store mutation made by the driver runs while holding the session
//! lock, after checking the cancellation token. [`StreamSession::close`]
//! takes the same lock before cancelling, so once it returns the task never
//! touches the store again.
//!
//! # Completion
//!
//! The first terminal transition wins and ends the stream. `FAILED` and the
//! stream rate-limit code beat anything else in their frame. A `COMPLETED`
//! status seen before the `final` frame is remembered, and the turn completes
//! on the `final` frame or on a clean end of stream. A clean end with neither
//! is a dropped stream and fails the turn.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use codoc_common::ChatConfig;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::coalescer::TokenCoalescer;
use crate::rate_limit::stream_rate_limit_message;
use crate::sse::{parse_event, FinalAnswer, Frame, FrameDecoder, StreamEvent};
use crate::status::ChatStatus;
use crate::store::{SessionStore, TurnExit};

/// The message a stream writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub problem_id: String,
    /// Pending assistant message id, used as the generation token.
    pub message_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub flush_interval: Duration,
    pub event_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&ChatConfig::default())
    }
}

impl From<&ChatConfig> for StreamSettings {
    fn from(config: &ChatConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            event_capacity: config.event_channel_capacity,
        }
    }
}

struct Shared {
    target: StreamTarget,
    store: SessionStore,
    coalescer: Mutex<TokenCoalescer>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TokenCoalescer> {
        self.coalescer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the session lock, unless the session is closed.
    fn with_live<R>(&self, f: impl FnOnce(&mut TokenCoalescer) -> R) -> Option<R> {
        let mut coalescer = self.lock();
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(f(&mut coalescer))
    }

    fn append(&self, text: &str) {
        self.store
            .append_to_pending(&self.target.problem_id, &self.target.message_id, text);
    }

    /// Settle the turn in the store and cancel. Caller holds the lock.
    fn finish_locked(&self, coalescer: &mut TokenCoalescer, exit: &TurnExit) {
        match exit {
            TurnExit::Completed | TurnExit::Stopped => {
                if let Some(text) = coalescer.take() {
                    self.append(&text);
                }
            }
            TurnExit::Failed | TurnExit::RateLimited(_) => {
                let dropped = coalescer.discard();
                if dropped > 0 {
                    trace!(dropped_bytes = dropped, "Discarding buffered tokens");
                }
            }
        }

        self.store
            .finish_turn(&self.target.problem_id, &self.target.message_id, exit);
        self.cancel.cancel();

        info!(
            problem_id = %self.target.problem_id,
            conversation_id = %self.target.conversation_id,
            message_id = %self.target.message_id,
            exit = ?exit,
            "Stream finished"
        );
    }
}

/// Handle to a running stream. Clones share the same stream.
#[derive(Clone)]
pub struct StreamSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("target", &self.shared.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamSession {
    /// Spawn the stream task over `source`.
    ///
    /// The session must already be bound in `store` (see
    /// [`SessionStore::bind_stream`]).
    pub fn start<S, B, E>(
        source: S,
        target: StreamTarget,
        store: SessionStore,
        settings: StreamSettings,
    ) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let shared = Arc::new(Shared {
            target,
            store,
            coalescer: Mutex::new(TokenCoalescer::new(settings.flush_interval)),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        });

        debug!(
            problem_id = %shared.target.problem_id,
            conversation_id = %shared.target.conversation_id,
            message_id = %shared.target.message_id,
            "Stream session started"
        );

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _finished = task_shared.finished.clone().drop_guard();

            let (events_tx, events_rx) = mpsc::channel(settings.event_capacity.max(1));
            let reader = read_events(source, events_tx, task_shared.cancel.clone());
            let driver = Driver::new(Arc::clone(&task_shared)).run(events_rx);
            tokio::join!(reader, driver);
        });

        Self { shared }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.shared.target
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Whether the stream task has exited.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.is_cancelled()
    }

    /// Resolve once the stream task has exited.
    pub async fn finished(&self) {
        self.shared.finished.cancelled().await;
    }

    /// Close the stream and discard buffered tokens.
    ///
    /// Idempotent. After it returns the stream makes no further store
    /// mutation. The session stays bound; the caller decides how to settle it.
    pub fn close(&self) {
        let mut coalescer = self.shared.lock();
        if self.shared.cancel.is_cancelled() {
            return;
        }
        let dropped = coalescer.discard();
        self.shared.cancel.cancel();
        drop(coalescer);

        debug!(
            problem_id = %self.shared.target.problem_id,
            conversation_id = %self.shared.target.conversation_id,
            dropped_bytes = dropped,
            "Stream closed"
        );
    }

    /// User cancellation: flush buffered tokens, settle the turn as stopped,
    /// and close. Returns `false` when the stream had already ended.
    pub fn stop(&self) -> bool {
        self.shared
            .with_live(|coalescer| self.shared.finish_locked(coalescer, &TurnExit::Stopped))
            .is_some()
    }
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug)]
enum ReaderEvent {
    Event(StreamEvent),
    TransportError(String),
    Ended,
}

async fn read_events<S, B, E>(source: S, events: mpsc::Sender<ReaderEvent>, cancel: CancellationToken)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    tokio::pin!(source);
    let mut decoder = FrameDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            next = source.next() => next,
        };

        let last = match next {
            Some(Ok(chunk)) => {
                let blocks = decoder.push(chunk.as_ref());
                for event in blocks
                    .iter()
                    .filter_map(|block| Frame::parse(block))
                    .filter_map(|frame| parse_event(&frame))
                {
                    if events.send(ReaderEvent::Event(event)).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            Some(Err(e)) => ReaderEvent::TransportError(e.to_string()),
            None => {
                if let Some(rest) = decoder.finish() {
                    debug!(bytes = rest.len(), "Discarding unterminated frame at end of stream");
                }
                ReaderEvent::Ended
            }
        };

        let _ = events.send(last).await;
        return;
    }
}

// ============================================================================
// Driver
// ============================================================================

struct Driver {
    shared: Arc<Shared>,
    final_received: bool,
    completion_pending: bool,
}

impl Driver {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            final_received: false,
            completion_pending: false,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<ReaderEvent>) {
        let cancel = self.shared.cancel.clone();

        loop {
            let deadline = self.shared.lock().deadline();

            let flow = tokio::select! {
                biased;
                () = cancel.cancelled() => ControlFlow::Break(()),
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                    ControlFlow::Continue(())
                }
                event = events.recv() => self.handle(event.unwrap_or(ReaderEvent::Ended)),
            };

            if flow.is_break() {
                return;
            }
        }
    }

    fn flush(&self) {
        self.shared.with_live(|coalescer| {
            if let Some(text) = coalescer.take() {
                self.shared.append(&text);
            }
        });
    }

    fn finish(&self, exit: TurnExit) -> ControlFlow<()> {
        self.shared
            .with_live(|coalescer| self.shared.finish_locked(coalescer, &exit));
        ControlFlow::Break(())
    }

    fn handle(&mut self, event: ReaderEvent) -> ControlFlow<()> {
        match event {
            ReaderEvent::Event(event) => self.apply(event),
            ReaderEvent::TransportError(error) => {
                warn!(
                    problem_id = %self.shared.target.problem_id,
                    conversation_id = %self.shared.target.conversation_id,
                    error = %error,
                    "Stream transport error"
                );
                self.finish(TurnExit::Failed)
            }
            ReaderEvent::Ended if self.final_received || self.completion_pending => {
                self.finish(TurnExit::Completed)
            }
            ReaderEvent::Ended => {
                warn!(
                    problem_id = %self.shared.target.problem_id,
                    conversation_id = %self.shared.target.conversation_id,
                    "Stream ended without a final answer"
                );
                self.finish(TurnExit::Failed)
            }
        }
    }

    fn apply(&mut self, event: StreamEvent) -> ControlFlow<()> {
        match event {
            StreamEvent::Token(_) if self.final_received => {
                trace!(
                    message_id = %self.shared.target.message_id,
                    "Dropping token after final answer"
                );
                ControlFlow::Continue(())
            }
            StreamEvent::Token(text) => {
                let now = Instant::now();
                self.shared.with_live(|coalescer| {
                    if coalescer.push(&text, now) {
                        trace!(message_id = %self.shared.target.message_id, "Flush scheduled");
                    }
                });
                ControlFlow::Continue(())
            }
            StreamEvent::Status(status) => self.on_status(status),
            StreamEvent::Final(answer) => self.on_final(answer),
            StreamEvent::RateLimited { retry_after_secs } => {
                self.finish(TurnExit::RateLimited(stream_rate_limit_message(retry_after_secs)))
            }
            StreamEvent::Error => self.finish(TurnExit::Failed),
        }
    }

    fn on_status(&mut self, status: ChatStatus) -> ControlFlow<()> {
        match status {
            ChatStatus::Completed if self.final_received => self.finish(TurnExit::Completed),
            ChatStatus::Completed => {
                debug!(
                    conversation_id = %self.shared.target.conversation_id,
                    "Completion seen before final answer"
                );
                self.completion_pending = true;
                ControlFlow::Continue(())
            }
            ChatStatus::Failed => self.finish(TurnExit::Failed),
            ChatStatus::Accepted | ChatStatus::Processing | ChatStatus::StreamRateLimited => {
                trace!(status = %status, "Stream status");
                ControlFlow::Continue(())
            }
        }
    }

    fn on_final(&mut self, answer: FinalAnswer) -> ControlFlow<()> {
        let target = &self.shared.target;
        let applied = self.shared.with_live(|coalescer| {
            if let Some(text) = &answer.text {
                coalescer.discard();
                self.shared
                    .store
                    .replace_pending(&target.problem_id, &target.message_id, text);
            }
            if answer.summary_ready {
                self.shared
                    .store
                    .mark_summary_ready(&target.problem_id, &target.message_id);
            }
        });
        if applied.is_none() {
            return ControlFlow::Break(());
        }
        self.final_received = true;

        match answer.status {
            Some(ChatStatus::Failed) => self.finish(TurnExit::Failed),
            Some(ChatStatus::Completed) => self.finish(TurnExit::Completed),
            _ if self.completion_pending => self.finish(TurnExit::Completed),
            _ => ControlFlow::Continue(()),
        }
    }
}
