//! Chat messages.

use chrono::Utc;
use uuid::Uuid;

/// Id of the greeting message every session starts with.
pub const INTRO_MESSAGE_ID: &str = "assistant-intro";

/// Greeting shown when a problem's chat first opens.
pub const INTRO_MESSAGE: &str = "Hi! I'm Codok, your study partner.\n\
Let's work through this problem in four steps and build its summary card together.\n\
Step 1 is the background: what situation does the problem describe?\n\
(Try to pin down who is involved, what is happening, and how much.)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// Optional per-message flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    /// Offer the "go to summary cards" follow-up after this message.
    pub show_summary_cta: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub meta: MessageMeta,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            meta: MessageMeta::default(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Empty assistant message that streamed tokens are appended to.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new())
    }

    pub fn intro() -> Self {
        Self {
            id: INTRO_MESSAGE_ID.to_string(),
            role: Role::Assistant,
            content: INTRO_MESSAGE.to_string(),
            meta: MessageMeta::default(),
        }
    }

    /// Whether the content is empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Client-side message id: `msg-<unix millis>-<6 random chars>`.
pub fn new_message_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("msg-{}-{}", Utc::now().timestamp_millis(), &random[..6])
}
