//! Frame decoders for provider response streams.
//!
//! Network reads arrive at arbitrary byte boundaries, including in the
//! middle of a multi-byte UTF-8 character. Both decoders buffer an
//! incomplete trailing sequence and the trailing partial line, so the frame
//! sequence is identical no matter how the bytes were chunked.

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    text: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read; returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        self.decode_pending();

        let mut lines = Vec::new();
        while let Some(newline) = self.text.find('\n') {
            let mut line: String = self.text.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Whatever text remains after the last newline.
    pub fn remainder(&self) -> &str {
        &self.text
    }

    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    self.text
                        .push_str(std::str::from_utf8(&self.pending[..valid_up_to]).unwrap_or(""));
                    match e.error_len() {
                        // Incomplete sequence at the end: hold the bytes
                        // back for the next read.
                        None => {
                            self.pending.drain(..valid_up_to);
                            return;
                        }
                        // Truly invalid bytes: substitute and keep going.
                        Some(len) => {
                            self.text.push('\u{FFFD}');
                            self.pending.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }
    }
}

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Payload of a `data:` line
    Data(String),
    /// The `data: [DONE]` sentinel
    Done,
}

/// Decoder for `data: {...}` server-sent event streams.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: LineBuffer,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read; returns the frames it completed. Blank lines
    /// and non-`data:` fields are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer
            .push(chunk)
            .into_iter()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                let payload = line.strip_prefix("data:")?.trim_start();
                if payload == "[DONE]" {
                    Some(SseFrame::Done)
                } else {
                    Some(SseFrame::Data(payload.to_string()))
                }
            })
            .collect()
    }
}

/// Decoder for newline-delimited JSON streams: one complete JSON object per
/// line, no prefix.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: LineBuffer,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .push(chunk)
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .collect()
    }
}
