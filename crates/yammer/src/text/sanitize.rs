//! Speech sanitization: strip the markup a chat model emits so the TTS
//! engine reads prose, not punctuation soup.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_`~#]+").unwrap());
static DOTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{3,}|…").unwrap());
static QUOTES_AND_BRACKETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[\u{201C}\u{201D}\u{201E}\u{00AB}\u{00BB}\u{2039}\u{203A}()\\[\\]{}]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([.,!?;:])").unwrap());

/// Normalize `input` for a speech request.
pub fn sanitize_for_speech(input: &str) -> String {
    let normalized: String = input.nfkc().collect();

    // Curly single quotes become plain apostrophes so contractions survive.
    let normalized = normalized.replace(['\u{2018}', '\u{2019}'], "'");

    let no_urls = URL.replace_all(&normalized, " ");
    let no_marks = EMPHASIS.replace_all(&no_urls, "");
    let no_dots = DOTS.replace_all(&no_marks, ".");
    let no_quotes = QUOTES_AND_BRACKETS.replace_all(&no_dots, " ");
    let compact = WHITESPACE.replace_all(&no_quotes, " ");
    let spaced = SPACE_BEFORE_PUNCT.replace_all(&compact, "$1");

    spaced.trim().to_string()
}
