// src/framing.rs
//
// Line framing for serial byte streams.
// Splits an unbounded, arbitrarily chunked byte stream into messages at a
// configurable delimiter and fans each message out to every subscriber.

use std::sync::Arc;

use crate::io::feed::{MessageFeed, Subscription};
use crate::io::types::DEFAULT_READ_TERMINATION;

// ============================================================================
// Delimiter Parsing
// ============================================================================

/// Parse user-supplied delimiter text into raw bytes.
///
/// Accepts escape sequences (`\r`, `\n`, `\t`, `\0`, `\\`) or a hex form
/// prefixed with `0x` (e.g. `0x0D0A`). Anything else is taken literally.
pub fn parse_delimiter(text: &str) -> Result<Vec<u8>, String> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return parse_hex_delimiter(hex);
    }

    let mut bytes = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => bytes.push(b'\r'),
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('0') => bytes.push(0),
            Some('\\') => bytes.push(b'\\'),
            Some(other) => return Err(format!("Unknown escape sequence: \\{}", other)),
            None => return Err("Trailing backslash in delimiter".to_string()),
        }
    }
    Ok(bytes)
}

/// Parse hex string to bytes (e.g., "0D0A" -> [0x0D, 0x0A])
fn parse_hex_delimiter(hex: &str) -> Result<Vec<u8>, String> {
    let hex = hex.trim();
    if hex.is_empty() || hex.len() % 2 != 0 {
        return Err(format!("Invalid hex delimiter: {}", hex));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| format!("Invalid hex delimiter {}: {}", hex, e))
        })
        .collect()
}

// ============================================================================
// Line Framer
// ============================================================================

/// Stateful delimiter framer.
///
/// Partial fragments are buffered across `feed` calls. Consecutive delimiters
/// produce empty messages; they are not suppressed. Messages are decoded as
/// UTF-8 (lossy) only once complete, so characters split across chunks survive.
pub struct LineFramer {
    buffer: Vec<u8>,
    delimiter: Vec<u8>,
    /// Forced split length (None = unbounded)
    max_length: Option<usize>,
    output: Arc<MessageFeed<String>>,
}

impl LineFramer {
    /// Framer splitting on `delimiter` (empty falls back to "\n"), emitting into `output`
    pub fn new(delimiter: &str, output: Arc<MessageFeed<String>>) -> Self {
        let delimiter = if delimiter.is_empty() {
            DEFAULT_READ_TERMINATION
        } else {
            delimiter
        };
        LineFramer {
            buffer: Vec::new(),
            delimiter: delimiter.as_bytes().to_vec(),
            max_length: None,
            output,
        }
    }

    /// Force a split once the buffered fragment reaches `max_length` bytes
    pub fn with_max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length.filter(|&max| max > 0);
        self
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Bytes buffered since the last emitted message
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Register a consumer for messages emitted from now on
    pub fn subscribe(&self) -> Subscription<String> {
        self.output.subscribe()
    }

    /// Feed a chunk and emit every completed message to all subscribers,
    /// waiting while any subscriber's queue is full.
    /// Returns the number of messages emitted.
    pub async fn feed(&mut self, chunk: &[u8]) -> usize {
        let messages = self.split(chunk);
        let count = messages.len();
        for message in messages {
            self.output.publish(message).await;
        }
        count
    }

    /// Feed a chunk and return the completed messages without emitting them
    pub fn split(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut messages = Vec::new();
        let delimiter_len = self.delimiter.len();

        for &byte in chunk {
            self.buffer.push(byte);

            // Check for delimiter match at end of buffer. The buffer is
            // drained on a match, so matches never overlap.
            if self.buffer.len() >= delimiter_len {
                let start = self.buffer.len() - delimiter_len;
                if self.buffer[start..] == self.delimiter[..] {
                    self.buffer.truncate(start);
                    messages.push(self.take_message());
                    continue;
                }
            }

            if let Some(max) = self.max_length {
                if self.buffer.len() >= max {
                    messages.push(self.take_message());
                }
            }
        }

        messages
    }

    /// Drop any buffered partial fragment
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn take_message(&mut self) -> String {
        let bytes = std::mem::take(&mut self.buffer);
        match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}
