//! Phrase detector: carves early phrase candidates out of growing partials.
//!
//! Partials usually grow by appending; the detector accumulates those deltas
//! and emits a phrase once enough words piled up and the tail either ends in
//! punctuation or stopped changing. A partial that is not a prefix extension
//! restarts the accumulator (server rewrote its hypothesis).

use std::time::Instant;

fn ends_with_phrase_punct(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .map(|c| matches!(c, '.' | '!' | '?' | ';' | ':' | ','))
        .unwrap_or(false)
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Debug)]
pub struct PhraseDetector {
    min_words: usize,
    stable_ms: u64,
    last_partial: String,
    pend: String,
    pend_since: Option<Instant>,
}

impl PhraseDetector {
    pub fn new(min_words: usize, stable_ms: u64) -> Self {
        Self {
            min_words,
            stable_ms,
            last_partial: String::new(),
            pend: String::new(),
            pend_since: None,
        }
    }

    /// Feed a partial. Returns a phrase when the punctuation condition fires.
    pub fn on_partial(&mut self, text: &str, now: Instant) -> Option<String> {
        if text == self.last_partial {
            return None;
        }
        if let Some(delta) = text.strip_prefix(self.last_partial.as_str()) {
            self.pend.push_str(delta);
        } else {
            // Hypothesis rewritten from scratch.
            self.pend = text.to_string();
        }
        self.last_partial = text.to_string();
        self.pend_since = Some(now);

        if word_count(&self.pend) >= self.min_words && ends_with_phrase_punct(&self.pend) {
            return self.take();
        }
        None
    }

    /// Periodic check: emit the accumulator once it has been stable long
    /// enough.
    pub fn tick(&mut self, now: Instant) -> Option<String> {
        let since = self.pend_since?;
        if word_count(&self.pend) >= self.min_words
            && now.duration_since(since).as_millis() as u64 >= self.stable_ms
        {
            return self.take();
        }
        None
    }

    /// Drop whatever is accumulated (a final supersedes it).
    pub fn clear(&mut self) {
        self.pend.clear();
        self.pend_since = None;
    }

    /// Reset for a new session.
    pub fn reset(&mut self) {
        self.clear();
        self.last_partial.clear();
    }

    fn take(&mut self) -> Option<String> {
        let phrase = self.pend.trim().to_string();
        self.clear();
        if phrase.is_empty() {
            None
        } else {
            Some(phrase)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn punctuated_growth_emits_at_min_words() {
        let mut det = PhraseDetector::new(3, 350);
        let t = Instant::now();
        assert!(det.on_partial("hello", t).is_none());
        assert!(det.on_partial("hello there", t).is_none());
        let phrase = det.on_partial("hello there friend,", t);
        assert_eq!(phrase.as_deref(), Some("hello there friend,"));
    }

    #[test]
    fn too_few_words_waits_even_with_punctuation() {
        let mut det = PhraseDetector::new(3, 350);
        let t = Instant::now();
        assert!(det.on_partial("okay.", t).is_none());
    }

    #[test]
    fn stability_emits_without_punctuation() {
        let mut det = PhraseDetector::new(3, 350);
        let t0 = Instant::now();
        det.on_partial("one two three four", t0);
        assert!(det.tick(t0 + Duration::from_millis(100)).is_none());
        let phrase = det.tick(t0 + Duration::from_millis(400));
        assert_eq!(phrase.as_deref(), Some("one two three four"));
        // Accumulator is drained.
        assert!(det.tick(t0 + Duration::from_millis(900)).is_none());
    }

    #[test]
    fn rewrite_restarts_the_accumulator() {
        let mut det = PhraseDetector::new(2, 350);
        let t = Instant::now();
        det.on_partial("uh hel", t);
        // Not a prefix extension: server rewrote the hypothesis.
        let phrase = det.on_partial("hello world.", t);
        assert_eq!(phrase.as_deref(), Some("hello world."));
    }

    #[test]
    fn clear_discards_pending() {
        let mut det = PhraseDetector::new(2, 350);
        let t = Instant::now();
        det.on_partial("some words here", t);
        det.clear();
        assert!(det.tick(t + Duration::from_millis(1000)).is_none());
    }

    #[test]
    fn duplicate_partial_is_inert() {
        let mut det = PhraseDetector::new(2, 350);
        let t = Instant::now();
        det.on_partial("same text", t);
        let since_before = det.pend_since;
        assert!(det.on_partial("same text", t + Duration::from_millis(50)).is_none());
        assert_eq!(det.pend_since, since_before);
    }
}
