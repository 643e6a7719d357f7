//! A single SSE block split into its event type and data.

/// Event type used when a block has no `event:` line.
pub const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    /// `data:` line values joined with `\n`.
    pub data: String,
}

impl Frame {
    /// Parse a block. Blocks without data yield `None`.
    ///
    /// The last `event:` line wins. Other fields (`id:`, `retry:`, comments) are ignored.
    pub fn parse(block: &str) -> Option<Self> {
        let mut event = DEFAULT_EVENT;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event = value.trim();
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.trim());
            }
        }

        let data = data_lines.join("\n");
        if data.is_empty() {
            return None;
        }

        Some(Self {
            event: event.to_string(),
            data,
        })
    }
}
