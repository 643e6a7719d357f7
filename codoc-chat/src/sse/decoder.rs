//! Incremental decoding of an SSE byte stream into text blocks.

/// Splits a chunked byte stream into blank-line-delimited text blocks.
///
/// Multi-byte characters split across chunks are held back until the rest
/// arrives. Invalid byte sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Decoded text not yet terminated by a blank line.
    text: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every block it completes, in order.
    ///
    /// Whitespace-only blocks are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode(chunk);
        self.drain_blocks()
    }

    /// End of stream. Returns the dangling unterminated fragment, if any.
    ///
    /// The fragment is never a complete block and must not be parsed.
    pub fn finish(&mut self) -> Option<String> {
        if !self.partial.is_empty() {
            self.text.push(char::REPLACEMENT_CHARACTER);
            self.partial.clear();
        }
        let rest = std::mem::take(&mut self.text);
        (!rest.trim().is_empty()).then_some(rest)
    }

    /// Bytes held back: undecoded tail plus unterminated text.
    pub fn buffered_len(&self) -> usize {
        self.text.len() + self.partial.len()
    }

    fn decode(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(chunk);

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    return;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.partial = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_blocks(&mut self) -> Vec<String> {
        let mut blocks = Vec::new();
        let mut consumed = 0;

        while let Some((end, next)) = find_delimiter(&self.text[consumed..]) {
            let block = &self.text[consumed..consumed + end];
            if !block.trim().is_empty() {
                blocks.push(block.to_string());
            }
            consumed += next;
        }

        if consumed > 0 {
            self.text.drain(..consumed);
        }
        blocks
    }
}

/// Locate the first `\r?\n\r?\n`, returning `(block_end, delimiter_end)`.
fn find_delimiter(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();

    for (i, byte) in bytes.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let mut j = i + 1;
        if bytes.get(j) == Some(&b'\r') {
            j += 1;
        }
        if bytes.get(j) == Some(&b'\n') {
            let start = if i > 0 && bytes[i - 1] == b'\r' { i - 1 } else { i };
            return Some((start, j + 1));
        }
    }
    None
}
