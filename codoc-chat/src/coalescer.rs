//! Token coalescing with a debounced flush deadline.
//!
//! Tokens arriving within one flush interval are concatenated and applied
//! to the pending message in a single mutation.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct TokenCoalescer {
    interval: Duration,
    buffer: String,
    /// Set while a flush is scheduled.
    deadline: Option<Instant>,
}

impl TokenCoalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buffer: String::new(),
            deadline: None,
        }
    }

    /// Buffer `text`, scheduling a flush if none is pending.
    ///
    /// Returns `true` when this call scheduled the flush.
    pub fn push(&mut self, text: &str, now: Instant) -> bool {
        if text.is_empty() {
            return false;
        }
        self.buffer.push_str(text);

        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.interval);
        true
    }

    /// When the scheduled flush is due.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_scheduled(&self) -> bool {
        self.deadline.is_some()
    }

    /// Empty the buffer for a flush and unschedule.
    pub fn take(&mut self) -> Option<String> {
        self.deadline = None;
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Drop buffered text and unschedule. Returns the number of bytes dropped.
    pub fn discard(&mut self) -> usize {
        self.deadline = None;
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(16);

    #[test]
    fn test_schedules_once_per_tick() {
        let now = Instant::now();
        let mut coalescer = TokenCoalescer::new(TICK);

        assert!(coalescer.push("Hi", now));
        assert!(!coalescer.push(" there", now + Duration::from_millis(5)));
        assert!(!coalescer.push("!", now + Duration::from_millis(10)));
        assert_eq!(coalescer.deadline(), Some(now + TICK));

        assert_eq!(coalescer.take().as_deref(), Some("Hi there!"));
        assert!(!coalescer.is_scheduled());
        assert_eq!(coalescer.pending_len(), 0);
    }

    #[test]
    fn test_next_push_after_flush_reschedules() {
        let now = Instant::now();
        let mut coalescer = TokenCoalescer::new(TICK);

        coalescer.push("a", now);
        coalescer.take();
        assert!(coalescer.push("b", now + TICK));
        assert_eq!(coalescer.deadline(), Some(now + TICK + TICK));
    }

    #[test]
    fn test_empty_text_is_ignored() {
        let mut coalescer = TokenCoalescer::new(TICK);
        assert!(!coalescer.push("", Instant::now()));
        assert!(!coalescer.is_scheduled());
        assert_eq!(coalescer.take(), None);
    }

    #[test]
    fn test_discard() {
        let mut coalescer = TokenCoalescer::new(TICK);
        coalescer.push("partial", Instant::now());
        assert_eq!(coalescer.discard(), 7);
        assert!(!coalescer.is_scheduled());
        assert_eq!(coalescer.take(), None);
    }
}
