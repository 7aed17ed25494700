//! Text plumbing: sentence muxing, NDJSON framing, speech sanitization.

pub mod ndjson;
pub mod sanitize;
pub mod sentence;

pub use ndjson::NdjsonPump;
pub use sanitize::sanitize_for_speech;
pub use sentence::{SentenceMux, TimerDirective};
