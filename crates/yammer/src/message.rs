//! Messages carried by wires.
//!
//! A message is any structured payload, immutable in transit. Cloning is
//! cheap (shared `Arc`), so fan-out delivery never copies the body.

use std::sync::Arc;

use serde_json::{json, Value};

/// An immutable payload travelling on a wire.
#[derive(Debug, Clone)]
pub struct Message {
    value: Arc<Value>,
}

impl Message {
    pub fn new(value: Value) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// The standard text message shape emitted by producing nodes.
    pub fn text(node_id: &str, text: impl Into<String>) -> Self {
        Self::new(json!({
            "nodeId": node_id,
            "type": "text",
            "text": text.into(),
            "eos": true,
        }))
    }

    /// A status message for a node's `status` port.
    pub fn status(node_id: &str, level: &str, code: &str, detail: impl Into<String>) -> Self {
        Self::new(json!({
            "nodeId": node_id,
            "type": "status",
            "level": level,
            "code": code,
            "detail": detail.into(),
        }))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Canonical text: string `text`, else `value`, `content`, `data`, else
    /// the payload stringified.
    pub fn display_text(&self) -> String {
        yammerproto::payload::display_text(&self.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_shape() {
        let msg = Message::text("llm-1", "hello");
        assert_eq!(msg.get_str("type"), Some("text"));
        assert_eq!(msg.get_str("nodeId"), Some("llm-1"));
        assert_eq!(msg.display_text(), "hello");
        assert_eq!(msg.value()["eos"], true);
    }

    #[test]
    fn display_text_falls_through_keys() {
        let msg = Message::new(json!({"content": "via content"}));
        assert_eq!(msg.display_text(), "via content");
        let msg = Message::new(json!(42));
        assert_eq!(msg.display_text(), "42");
    }
}
