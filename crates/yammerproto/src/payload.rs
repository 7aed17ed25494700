//! Best-effort payload hydration and text extraction.
//!
//! Inbound datagrams arrive as strings, byte arrays, or already-parsed
//! objects, and peers sometimes double-wrap: a JSON document inside a string
//! inside base64. [`hydrate`] keeps unwrapping until the value stops
//! changing. The extraction helpers pick a canonical textual rendering so
//! downstream sinks never have to care which key a sender used.

use base64::Engine as _;
use serde_json::Value;

/// Keys probed, in order, when a sink wants "the text" of a routed message.
const DISPLAY_KEYS: [&str; 4] = ["text", "value", "content", "data"];

/// Keys probed, in order, when rendering a peer DM for the user. Broader than
/// [`DISPLAY_KEYS`] because DMs come from foreign senders.
const DM_TEXT_KEYS: [&str; 13] = [
    "text",
    "message",
    "content",
    "value",
    "body",
    "payload",
    "data",
    "note",
    "detail",
    "result",
    "entry",
    "summary",
    "description",
];

/// Unwrap limit. Two levels of wrapping occur in practice; four is already
/// paranoid.
const MAX_HYDRATION_ROUNDS: usize = 4;

/// Repeatedly unwrap a payload: JSON strings are parsed, byte arrays are
/// decoded as UTF-8 and re-parsed, base64-looking strings are decoded and
/// re-parsed. Anything that fails to unwrap is returned as-is.
pub fn hydrate(value: Value) -> Value {
    let mut current = value;
    for _ in 0..MAX_HYDRATION_ROUNDS {
        let next = hydrate_once(&current);
        match next {
            Some(v) if v != current => current = v,
            _ => break,
        }
    }
    current
}

fn hydrate_once(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    return Some(parsed);
                }
            }
            if looks_base64(trimmed) {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
                    if let Ok(text) = String::from_utf8(bytes) {
                        let inner = text.trim();
                        if inner.starts_with('{') || inner.starts_with('[') {
                            if let Ok(parsed) = serde_json::from_str::<Value>(inner) {
                                return Some(parsed);
                            }
                        }
                        return Some(Value::String(text));
                    }
                }
            }
            None
        }
        Value::Array(items) => {
            // A byte array (all small integers) is decoded as UTF-8.
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect();
            let bytes = bytes?;
            if bytes.is_empty() {
                return None;
            }
            let text = String::from_utf8(bytes).ok()?;
            Some(Value::String(text))
        }
        _ => None,
    }
}

/// Heuristic base64 check: long enough to matter, valid alphabet, length
/// divisible by four.
pub fn looks_base64(s: &str) -> bool {
    s.len() >= 16
        && s.len() % 4 == 0
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

/// Canonical text of a routed message: a string `text`, else `value`,
/// `content`, or `data`, else the payload stringified.
pub fn display_text(value: &Value) -> String {
    if let Value::String(s) = value {
        return s.clone();
    }
    if let Value::Object(map) = value {
        for key in DISPLAY_KEYS {
            if let Some(Value::String(s)) = map.get(key) {
                return s.clone();
            }
        }
    }
    value.to_string()
}

/// Best textual rendering of a peer DM payload, probing the broad key list.
/// Returns `None` when nothing string-like is found.
pub fn best_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            for key in DM_TEXT_KEYS {
                match map.get(key) {
                    Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                    Some(other @ Value::Object(_)) => {
                        if let Some(nested) = best_text(other) {
                            return Some(nested);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        _ => None,
    }
}

/// Pretty-print a payload for the `raw` output port.
pub fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
