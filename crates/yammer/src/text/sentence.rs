//! Sentence mux: turns a stream of token deltas into whole sentences.
//!
//! Token streams end sentences mid-delta, and the last candidate of a burst
//! may still grow ("etc." is not always the end). The mux therefore holds the
//! most recent sentence back as `pending` until either more content proves it
//! complete or a stability window elapses. The mux itself is synchronous; the
//! owner runs the stability timer (a tokio sleep) and calls [`SentenceMux::on_stable`]
//! when it fires.

use std::time::Duration;

/// Default stability window.
pub const DEFAULT_STABLE_MS: u64 = 250;

/// What the caller should do with its stability timer after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDirective {
    /// (Re)arm the stability timer for the given window.
    Arm(Duration),
    /// Leave the timer alone (nothing pending).
    None,
}

/// Streaming sentence segmenter with a pending/stability stage.
#[derive(Debug)]
pub struct SentenceMux {
    carry: String,
    pending: Option<String>,
    stable: Duration,
}

impl Default for SentenceMux {
    fn default() -> Self {
        Self::new(DEFAULT_STABLE_MS)
    }
}

impl SentenceMux {
    pub fn new(stable_ms: u64) -> Self {
        Self {
            carry: String::new(),
            pending: None,
            stable: Duration::from_millis(stable_ms),
        }
    }

    pub fn stable_interval(&self) -> Duration {
        self.stable
    }

    /// Feed a delta. Complete sentences are passed to `emit` in order; the
    /// returned directive tells the owner whether to (re)arm its stability
    /// timer.
    pub fn push(&mut self, delta: &str, emit: &mut dyn FnMut(String)) -> TimerDirective {
        self.carry.push_str(delta);
        let (mut produced, rest) = scan(&self.carry);
        self.carry = rest;

        if !produced.is_empty() {
            if let Some(prior) = self.pending.take() {
                emit(prior);
            }
            let last = produced.pop();
            for sentence in produced {
                emit(sentence);
            }
            self.pending = last;
            return TimerDirective::Arm(self.stable);
        }

        if self.pending.is_some() && !self.carry.trim().is_empty() {
            // Continuation arrived: whatever was pending is definitely done.
            if let Some(prior) = self.pending.take() {
                emit(prior);
            }
            return TimerDirective::None;
        }

        if self.pending.is_some() {
            TimerDirective::Arm(self.stable)
        } else {
            TimerDirective::None
        }
    }

    /// Stability timer fired with no further input: release the pending
    /// sentence.
    pub fn on_stable(&mut self, emit: &mut dyn FnMut(String)) {
        if let Some(p) = self.pending.take() {
            emit(p);
        }
    }

    /// End of stream: release pending, then any non-empty carry, and reset.
    pub fn flush(&mut self, emit: &mut dyn FnMut(String)) {
        if let Some(p) = self.pending.take() {
            emit(p);
        }
        let rest = self.carry.trim().to_string();
        if !rest.is_empty() {
            emit(rest);
        }
        self.carry.clear();
    }
}

fn is_sentence_punct(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | ':')
}

fn is_closer(c: char) -> bool {
    matches!(c, ')' | ']' | '}' | '"' | '\'' | '\u{201D}' | '\u{2019}' | '»')
}

fn is_bullet(c: char) -> bool {
    matches!(c, '-' | '*' | '•')
}

fn is_emoji(c: char) -> bool {
    matches!(c,
        '\u{1F300}'..='\u{1FAFF}'
        | '\u{2600}'..='\u{27BF}'
        | '\u{2B00}'..='\u{2BFF}'
        | '\u{FE0F}'
        | '\u{200D}')
}

/// Scan `text` for sentence boundaries. Returns the completed sentences and
/// the unconsumed carry. A boundary is sentence punctuation (plus optional
/// closers) followed by whitespace, a paragraph break, a newline before a
/// list bullet, or an emoji run followed by whitespace.
fn scan(text: &str) -> (Vec<String>, String) {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut produced = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    let byte_at = |idx: usize| chars.get(idx).map(|(p, _)| *p).unwrap_or(text.len());

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c == '\n' {
            match chars.get(i + 1).map(|&(_, n)| n) {
                Some('\n') => {
                    push_trimmed(&mut produced, &text[start..pos]);
                    i += 2;
                    start = byte_at(i);
                    continue;
                }
                Some(n) if is_bullet(n) => {
                    push_trimmed(&mut produced, &text[start..pos]);
                    i += 1;
                    // The bullet belongs to the next item; keep it in carry.
                    start = byte_at(i);
                    continue;
                }
                Some(_) => {}
                // Trailing newline: the next delta decides whether this is a
                // paragraph break.
                None => break,
            }
        }

        if is_sentence_punct(c) {
            let mut j = i + 1;
            while j < chars.len() && is_closer(chars[j].1) {
                j += 1;
            }
            if j < chars.len() && chars[j].1.is_whitespace() {
                push_trimmed(&mut produced, &text[start..byte_at(j)]);
                while j < chars.len() && chars[j].1.is_whitespace() {
                    j += 1;
                }
                i = j;
                start = byte_at(j);
                continue;
            }
            i += 1;
            continue;
        }

        if is_emoji(c) {
            let mut j = i + 1;
            while j < chars.len() && is_emoji(chars[j].1) {
                j += 1;
            }
            if j < chars.len() && chars[j].1.is_whitespace() {
                push_trimmed(&mut produced, &text[start..byte_at(j)]);
                while j < chars.len() && chars[j].1.is_whitespace() {
                    j += 1;
                }
                i = j;
                start = byte_at(j);
                continue;
            }
            i = j;
            continue;
        }

        i += 1;
    }

    (produced, text[start..].to_string())
}

fn push_trimmed(out: &mut Vec<String>, raw: &str) {
    let s = raw.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
}
