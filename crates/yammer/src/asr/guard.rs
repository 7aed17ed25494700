//! Hallucination guard for recognition finals.
//!
//! Speech models trained on broadcast data hallucinate sign-off phrases
//! ("thanks for watching") out of silence. A final is dropped only when the
//! sign-off pattern matches AND it is short AND something corroborates the
//! hallucination: no speech observed yet, the detector currently reads
//! silence, or the server's own confidence metadata is poor.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Maximum word count for a droppable sign-off.
pub const MAX_SIGNOFF_WORDS: usize = 7;

static SIGNOFF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:",
        r"thanks?\s+for\s+watching",
        r"|thank\s+you\s+for\s+watching",
        r"|like\s+and\s+subscribe",
        r"|like,?\s+comment,?\s+and\s+subscribe",
        r"|don'?t\s+forget\s+to\s+subscribe",
        r"|subscribe\s+to\s+(?:my|the|our)\s+channel",
        r"|link\s+in\s+the\s+description",
        r"|see\s+you\s+(?:in\s+the\s+)?next\s+(?:video|time|one)",
        r"|thanks?\s+for\s+listening",
        r")\b",
    ))
    .expect("sign-off pattern compiles")
});

/// Server confidence metadata attached to a final.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FinalMeta {
    pub no_speech_prob: Option<f64>,
    pub avg_logprob: Option<f64>,
    pub compression_ratio: Option<f64>,
}

impl FinalMeta {
    /// Pull the fields from a final event, top level or nested under
    /// `meta`/`metrics`.
    pub fn from_value(value: &Value) -> Self {
        let probe = |key: &str| {
            value
                .get(key)
                .or_else(|| value.pointer(&format!("/meta/{key}")))
                .or_else(|| value.pointer(&format!("/metrics/{key}")))
                .and_then(Value::as_f64)
        };
        Self {
            no_speech_prob: probe("no_speech_prob"),
            avg_logprob: probe("avg_logprob"),
            compression_ratio: probe("compression_ratio"),
        }
    }

    /// Whether the server itself doubts this segment.
    pub fn low_confidence(&self) -> bool {
        self.no_speech_prob.map(|p| p > 0.6).unwrap_or(false)
            || self.avg_logprob.map(|p| p < -1.0).unwrap_or(false)
            || self.compression_ratio.map(|r| r > 2.4).unwrap_or(false)
    }
}

/// Whether the sign-off pattern matches at all.
pub fn matches_signoff(text: &str) -> bool {
    SIGNOFF.is_match(text)
}

/// Decide whether to drop a final as hallucinated.
pub fn is_hallucinated_final(
    text: &str,
    speech_observed: bool,
    vad_silent: bool,
    meta: &FinalMeta,
) -> bool {
    if !SIGNOFF.is_match(text) {
        return false;
    }
    if text.split_whitespace().count() > MAX_SIGNOFF_WORDS {
        return false;
    }
    !speech_observed || vad_silent || meta.low_confidence()
}
