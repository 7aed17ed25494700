//! NDJSON framing pump.
//!
//! Splits a concatenated byte stream into one top-level JSON object per
//! callback. The scanner respects string state and brace depth, so payloads
//! with nested objects or braces inside strings never split early. SSE-style
//! `data:` prefixes are stripped and `[DONE]` markers swallowed. The pump
//! never fails; malformed JSON only surfaces when the consumer parses a
//! delivered line.

/// Streaming NDJSON splitter.
#[derive(Debug, Default)]
pub struct NdjsonPump {
    /// Undecodable UTF-8 tail carried to the next push.
    byte_carry: Vec<u8>,
    buf: String,
    start: usize,
    in_string: bool,
    escaped: bool,
    depth: u32,
    /// Byte offset up to which `buf` has already been scanned.
    scanned_watermark: usize,
}

impl NdjsonPump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; `on_line` is called once per complete top-level JSON
    /// object (or non-marker plain line).
    pub fn push(&mut self, bytes: &[u8], on_line: &mut dyn FnMut(&str)) {
        self.absorb(bytes);
        self.scan(on_line);
    }

    /// Feed already-decoded text.
    pub fn push_str(&mut self, text: &str, on_line: &mut dyn FnMut(&str)) {
        self.buf.push_str(text);
        self.scan(on_line);
    }

    /// Deliver any residue and reset.
    pub fn flush(&mut self, on_line: &mut dyn FnMut(&str)) {
        if self.depth == 0 {
            let residue = self.buf[self.start..].to_string();
            deliver(&residue, on_line);
        }
        *self = Self::default();
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.byte_carry.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.byte_carry) {
                Ok(s) => {
                    self.buf.push_str(s);
                    self.byte_carry.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.buf
                        .push_str(std::str::from_utf8(&self.byte_carry[..valid]).unwrap_or(""));
                    match e.error_len() {
                        // Invalid sequence: drop it and keep going.
                        Some(len) => {
                            self.byte_carry.drain(..valid + len);
                        }
                        // Incomplete tail: keep it for the next push.
                        None => {
                            self.byte_carry.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn scan(&mut self, on_line: &mut dyn FnMut(&str)) {
        let bytes_len = self.buf.len();
        let mut pos = self.scan_resume();
        let mut segments: Vec<(usize, usize)> = Vec::new();

        let buf = self.buf.as_bytes();
        while pos < bytes_len {
            // ASCII-driven state machine; multi-byte chars are payload.
            let b = buf[pos];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => {
                        if self.depth > 0 {
                            self.depth -= 1;
                            if self.depth == 0 {
                                segments.push((self.start, pos + 1));
                                self.start = pos + 1;
                            }
                        }
                    }
                    b'\n' if self.depth == 0 => {
                        segments.push((self.start, pos));
                        self.start = pos + 1;
                    }
                    _ => {}
                }
            }
            pos += 1;
        }

        for (s, e) in segments {
            deliver(&self.buf[s..e], on_line);
        }
        self.compact();
    }

    fn scan_resume(&self) -> usize {
        // Everything before `start` was consumed; everything after was
        // already scanned up to the buffer end last time. Scanning resumes
        // where the previous call stopped, which after compaction is always
        // the scanned-length watermark.
        self.scanned_watermark
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.scanned_watermark = self.buf.len();
    }
}

fn deliver(raw: &str, on_line: &mut dyn FnMut(&str)) {
    let mut line = raw.trim();
    if let Some(stripped) = line.strip_prefix("data:") {
        line = stripped.trim_start();
    }
    if line.is_empty() || line == "[DONE]" {
        return;
    }
    on_line(line);
}
