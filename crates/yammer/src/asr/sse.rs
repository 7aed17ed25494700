//! SSE framing for the recognition event stream.
//!
//! Events arrive as `data:` lines terminated by a blank line, over direct
//! HTTP or re-chunked through the relay. The parser accumulates raw bytes,
//! splits lines, joins the `data:` payloads of one event, and hands the
//! parsed JSON to the caller. Malformed events are skipped; the stream keeps
//! going.

use serde_json::Value;

use super::guard::FinalMeta;

/// Incremental SSE event parser.
#[derive(Debug, Default)]
pub struct SseParser {
    byte_carry: Vec<u8>,
    buf: String,
    data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; `on_event` receives one parsed JSON value per event.
    pub fn push(&mut self, bytes: &[u8], on_event: &mut dyn FnMut(Value)) {
        self.byte_carry.extend_from_slice(bytes);
        match std::str::from_utf8(&self.byte_carry) {
            Ok(s) => {
                self.buf.push_str(s);
                self.byte_carry.clear();
            }
            Err(e) => {
                let valid = e.valid_up_to();
                self.buf
                    .push_str(std::str::from_utf8(&self.byte_carry[..valid]).unwrap_or(""));
                self.byte_carry.drain(..valid);
            }
        }

        while let Some(idx) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=idx).collect();
            self.handle_line(line.trim_end_matches(['\n', '\r']), on_event);
        }
    }

    /// Feed one already-split line (relay line streams).
    pub fn push_line(&mut self, line: &str, on_event: &mut dyn FnMut(Value)) {
        self.handle_line(line.trim_end_matches(['\n', '\r']), on_event);
    }

    /// Parse any trailing event that was never blank-line terminated.
    pub fn flush(&mut self, on_event: &mut dyn FnMut(Value)) {
        self.dispatch(on_event);
        self.buf.clear();
        self.byte_carry.clear();
    }

    fn handle_line(&mut self, line: &str, on_event: &mut dyn FnMut(Value)) {
        if line.is_empty() {
            self.dispatch(on_event);
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data.push_str(rest.trim_start());
        }
        // `event:`/`id:`/comment lines carry nothing we need.
    }

    fn dispatch(&mut self, on_event: &mut dyn FnMut(Value)) {
        if self.data.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.data);
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => on_event(value),
            Err(_) => {
                // Not JSON (keepalive comment or junk); skip the event.
            }
        }
    }
}

/// A recognized recognition event. Type names are matched
/// case-insensitively, with or without the `asr.` prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum AsrEvent {
    Partial { text: String },
    Detected { text: String },
    Final { text: String, meta: FinalMeta },
}

/// Interpret one event JSON value. Unknown types return `None`.
pub fn parse_event(value: &Value) -> Option<AsrEvent> {
    let kind = value
        .get("event")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)?
        .to_ascii_lowercase();
    let text = value
        .get("text")
        .or_else(|| value.get("transcript"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match kind.as_str() {
        "asr.partial" | "partial" => Some(AsrEvent::Partial { text }),
        "asr.detected" | "detected" => Some(AsrEvent::Detected { text }),
        "asr.final" | "final" => Some(AsrEvent::Final {
            text,
            meta: FinalMeta::from_value(value),
        }),
        _ => None,
    }
}

/// The session id an event belongs to, when the server tags it.
pub fn event_sid(value: &Value) -> Option<&str> {
    value
        .get("sid")
        .or_else(|| value.get("session"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(chunks: &[&[u8]]) -> Vec<Value> {
        let mut parser = SseParser::new();
        let mut out = Vec::new();
        for c in chunks {
            parser.push(c, &mut |v| out.push(v));
        }
        parser.flush(&mut |v| out.push(v));
        out
    }

    #[test]
    fn events_split_on_blank_lines() {
        let out = collect(&[b"data: {\"event\":\"partial\",\"text\":\"he\"}\n\ndata: {\"event\":\"partial\",\"text\":\"hello\"}\n\n"]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["text"], "hello");
    }

    #[test]
    fn event_split_across_pushes() {
        let out = collect(&[
            b"data: {\"event\":\"fin",
            b"al\",\"text\":\"done\"}\n",
            b"\n",
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["event"], "final");
    }

    #[test]
    fn multiline_data_joins() {
        let out = collect(&[b"data: {\"a\":\ndata: 1}\n\n"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["a"], 1);
    }

    #[test]
    fn non_json_events_are_skipped() {
        let out = collect(&[b"data: keepalive\n\ndata: {\"event\":\"partial\",\"text\":\"x\"}\n\n"]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn event_kinds_parse_case_insensitively() {
        let v = json!({"event": "ASR.Partial", "text": "t"});
        assert_eq!(parse_event(&v), Some(AsrEvent::Partial { text: "t".into() }));
        let v = json!({"type": "detected", "text": "p"});
        assert_eq!(parse_event(&v), Some(AsrEvent::Detected { text: "p".into() }));
        let v = json!({"event": "asr.final", "transcript": "f"});
        match parse_event(&v) {
            Some(AsrEvent::Final { text, .. }) => assert_eq!(text, "f"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_event(&json!({"event": "noise"})), None);
    }

    #[test]
    fn sid_extraction() {
        assert_eq!(event_sid(&json!({"sid": "s1"})), Some("s1"));
        assert_eq!(event_sid(&json!({"session": "s2"})), Some("s2"));
        assert_eq!(event_sid(&json!({})), None);
    }
}
