//! Incremental terminal rendering of an assistant reply.

use codoc_chat::{ConversationSession, Role};

/// Tracks what has been printed of the reply that follows a given user turn.
#[derive(Debug)]
pub struct ReplyPrinter {
    /// Index of the user message; the reply sits right after it.
    user_index: usize,
    printed: String,
}

impl ReplyPrinter {
    pub fn new(user_index: usize) -> Self {
        Self {
            user_index,
            printed: String::new(),
        }
    }

    /// Text to write for the latest snapshot, if anything changed.
    ///
    /// Appended tokens produce just the suffix. A replaced reply (final
    /// answer or failure text) is written again on a fresh line.
    pub fn delta(&mut self, session: &ConversationSession) -> Option<String> {
        let reply = session
            .messages
            .get(self.user_index + 1)
            .filter(|message| message.role == Role::Assistant)?;

        if reply.content == self.printed {
            return None;
        }

        let out = match reply.content.strip_prefix(self.printed.as_str()) {
            Some(suffix) => suffix.to_string(),
            None => format!("\n{}", reply.content),
        };
        self.printed = reply.content.clone();
        Some(out)
    }

    pub fn has_output(&self) -> bool {
        !self.printed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codoc_chat::Message;

    fn session(reply: &str) -> ConversationSession {
        let mut placeholder = Message::assistant_placeholder();
        placeholder.content = reply.to_string();
        ConversationSession::with_messages(vec![Message::intro(), Message::user("hi"), placeholder])
    }

    #[test]
    fn appended_tokens_print_suffix() {
        let mut printer = ReplyPrinter::new(1);
        assert_eq!(printer.delta(&session("")), None);
        assert_eq!(printer.delta(&session("Hel")).as_deref(), Some("Hel"));
        assert_eq!(printer.delta(&session("Hello")).as_deref(), Some("lo"));
        assert_eq!(printer.delta(&session("Hello")), None);
        assert!(printer.has_output());
    }

    #[test]
    fn replaced_reply_is_rewritten() {
        let mut printer = ReplyPrinter::new(1);
        printer.delta(&session("Hel"));
        assert_eq!(
            printer.delta(&session("Hi there!")).as_deref(),
            Some("\nHi there!")
        );
    }

    #[test]
    fn missing_reply_prints_nothing() {
        let mut printer = ReplyPrinter::new(1);
        let removed =
            ConversationSession::with_messages(vec![Message::intro(), Message::user("hi")]);
        assert_eq!(printer.delta(&removed), None);
        assert!(!printer.has_output());
    }
}
