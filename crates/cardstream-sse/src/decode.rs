//! Client-side decoding: split a byte stream into SSE blocks and parse each
//! block's `data:` payload back into a [`Frame`].

use crate::frame::{Frame, FrameError};

/// Parse one blank-line delimited SSE block.
///
/// Returns `Ok(None)` for blocks that carry no `data:` line (comments such as
/// heartbeats, or bare `event:`/`id:` fields). Multiple `data:` lines are
/// joined with `\n` as the SSE standard requires.
pub fn parse_block(block: &str) -> Result<Option<Frame>, FrameError> {
    let mut data: Option<String> = None;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field != "data" {
            continue;
        }
        match data.as_mut() {
            Some(buf) => {
                buf.push('\n');
                buf.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }

    match data {
        Some(json) => serde_json::from_str(&json)
            .map(Some)
            .map_err(FrameError::InvalidJson),
        None => Ok(None),
    }
}

/// Incremental decoder for a chunked SSE body.
///
/// Chunks may split anywhere, including inside a multi-byte UTF-8 sequence
/// or between the two newlines of a delimiter.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_owned();
                self.pending.clear();
                self.push_str(&text);
            }
            Err(err) if err.error_len().is_none() => {
                // Incomplete trailing sequence: keep it for the next chunk.
                let valid = err.valid_up_to();
                let rest = self.pending.split_off(valid);
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = rest;
                self.push_str(&text);
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                self.push_str(&text);
            }
        }
    }

    /// Pop the next complete block (without its delimiter), if any.
    pub fn next_block(&mut self) -> Option<String> {
        let pos = self.buffer.find("\n\n")?;
        let block = self.buffer[..pos].to_string();
        self.buffer.drain(..pos + 2);
        Some(block)
    }

    /// Drain every complete block and parse it. Comment-only blocks are
    /// skipped; unparsable blocks are reported but never stop decoding.
    pub fn frames(&mut self) -> Vec<Result<Frame, FrameError>> {
        let mut out = Vec::new();
        while let Some(block) = self.next_block() {
            match parse_block(&block) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => {}
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Text received after the last complete block.
    pub fn remainder(&self) -> &str {
        &self.buffer
    }
}
