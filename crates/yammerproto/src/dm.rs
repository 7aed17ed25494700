//! Peer DM overlay envelopes: handshake, heartbeat, chunked data, debug.
//!
//! Two graph instances form a directed, authenticated channel by exchanging
//! these envelopes over the datagram transport. Every envelope carries the
//! sender address, the component id (`<graphId>:<nodeId>`), an optional
//! target component id, the sender's graph id, and a millisecond timestamp.
//!
//! Text payloads larger than one datagram are split into `data` envelopes
//! sharing a batch `id`; the receiver reassembles them by `seq` slot via
//! [`DmInbox`].

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default datagram budget for one wrapped `data` envelope.
pub const DEFAULT_CHUNK_BYTES: usize = 1800;

/// Floor for the configured datagram budget.
pub const MIN_CHUNK_BYTES: usize = 512;

/// Default heartbeat interval in seconds.
pub const HEARTBEAT_DEFAULT_SECS: u64 = 15;

/// Minimum heartbeat interval in seconds.
pub const HEARTBEAT_MIN_SECS: u64 = 5;

/// Missed beats before the peer indicator turns to warning.
pub const MISSED_BEATS_WARNING: u32 = 1;

/// Missed beats before the peer indicator turns critical.
pub const MISSED_BEATS_CRITICAL: u32 = 5;

/// Fields every DM envelope carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DmMeta {
    pub from: String,
    pub component_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub graph_id: String,
    pub ts: i64,
}

impl DmMeta {
    pub fn new(
        from: impl Into<String>,
        component_id: impl Into<String>,
        graph_id: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            component_id: component_id.into(),
            target_id: None,
            graph_id: graph_id.into(),
            ts: crate::now_ms(),
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeAction {
    Request,
    Accept,
    Decline,
    Sync,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatAction {
    Ping,
    Pong,
}

/// A peer DM envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DmEnvelope {
    Handshake {
        #[serde(flatten)]
        meta: DmMeta,
        action: HandshakeAction,
        /// Advertised heartbeat interval in seconds, on request/accept.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat: Option<u64>,
    },
    Heartbeat {
        #[serde(flatten)]
        meta: DmMeta,
        action: HeartbeatAction,
    },
    Data {
        #[serde(flatten)]
        meta: DmMeta,
        /// Batch id shared by every chunk of one logical payload.
        id: String,
        /// 1-based chunk index.
        seq: u32,
        total: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        b64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_b64: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body_b64: Option<String>,
    },
    Debug {
        #[serde(flatten)]
        meta: DmMeta,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl DmEnvelope {
    pub fn meta(&self) -> &DmMeta {
        match self {
            DmEnvelope::Handshake { meta, .. }
            | DmEnvelope::Heartbeat { meta, .. }
            | DmEnvelope::Data { meta, .. }
            | DmEnvelope::Debug { meta, .. } => meta,
        }
    }

    /// Parse an inbound datagram. Returns `None` for payloads that are not
    /// DM envelopes (relay replies travel on the same transport).
    pub fn parse(value: &Value) -> Option<Self> {
        value.get("type")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The chunk text of a `data` envelope, decoding any of the base64
    /// carriers a sender may have used.
    pub fn data_text(&self) -> Option<String> {
        let DmEnvelope::Data {
            text,
            b64,
            payload_b64,
            body_b64,
            ..
        } = self
        else {
            return None;
        };
        if let Some(t) = text {
            return Some(t.clone());
        }
        for carrier in [b64, payload_b64, body_b64].into_iter().flatten() {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(carrier) {
                if let Ok(t) = String::from_utf8(bytes) {
                    return Some(t);
                }
            }
        }
        None
    }
}

/// Split `text` into `data` envelopes that each encode within `chunk_bytes`.
///
/// Starts from a chunk size of `max(64, chunk_bytes - 200)` to leave room for
/// the envelope wrapper, verifies every encoded envelope, and shrinks the
/// chunk size by 0.8 until everything fits. If no split fits, the whole text
/// goes out as a single best-effort chunk.
pub fn split_text(meta: &DmMeta, batch_id: &str, text: &str, chunk_bytes: usize) -> Vec<DmEnvelope> {
    let budget = chunk_bytes.max(MIN_CHUNK_BYTES);
    let mut size = budget.saturating_sub(200).max(64);

    loop {
        let pieces = split_utf8(text, size);
        let total = pieces.len() as u32;
        let envelopes: Vec<DmEnvelope> = pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| DmEnvelope::Data {
                meta: meta.clone(),
                id: batch_id.to_string(),
                seq: i as u32 + 1,
                total,
                text: Some((*piece).to_string()),
                b64: None,
                payload_b64: None,
                body_b64: None,
            })
            .collect();

        let fits = envelopes
            .iter()
            .all(|e| serde_json::to_string(e).map(|s| s.len() <= budget).unwrap_or(false));
        if fits {
            return envelopes;
        }

        let next = size * 4 / 5;
        if next < 16 {
            // Nothing fits; ship the whole thing in one chunk and hope.
            return vec![DmEnvelope::Data {
                meta: meta.clone(),
                id: batch_id.to_string(),
                seq: 1,
                total: 1,
                text: Some(text.to_string()),
                b64: None,
                payload_b64: None,
                body_b64: None,
            }];
        }
        size = next;
    }
}

/// Split on char boundaries into pieces of at most `max_bytes` bytes.
fn split_utf8(text: &str, max_bytes: usize) -> Vec<&str> {
    if text.is_empty() {
        return vec![""];
    }
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            pieces.push(rest);
            break;
        }
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces
}

/// Reassembly state for inbound `data` batches, keyed by batch id.
#[derive(Debug, Default)]
pub struct DmInbox {
    entries: std::collections::HashMap<String, InboxEntry>,
}

#[derive(Debug)]
struct InboxEntry {
    total: u32,
    parts: Vec<Option<String>>,
}

impl DmInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one chunk. Returns the assembled text once every slot of the
    /// batch holds a string. Frames with an out-of-range `seq`, a `total`
    /// that disagrees with the first frame of the batch, or a missing body
    /// are ignored.
    pub fn accept(&mut self, id: &str, seq: u32, total: u32, text: String) -> Option<String> {
        if total == 0 || seq == 0 || seq > total {
            return None;
        }
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| InboxEntry {
            total,
            parts: vec![None; total as usize],
        });
        if entry.total != total {
            return None;
        }
        entry.parts[(seq - 1) as usize] = Some(text);

        if entry.parts.iter().all(Option::is_some) {
            let entry = self.entries.remove(id)?;
            Some(entry.parts.into_iter().flatten().collect())
        } else {
            None
        }
    }

    /// Batches still awaiting chunks.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Drop a partially received batch.
    pub fn evict(&mut self, id: &str) {
        self.entries.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn meta() -> DmMeta {
        DmMeta::new("peer.alpha", "g1:node-a", "g1")
    }

    #[test]
    fn envelope_roundtrip() {
        let env = DmEnvelope::Handshake {
            meta: meta().with_target("g2:node-b"),
            action: HandshakeAction::Request,
            heartbeat: Some(15),
        };
        let value = env.to_value();
        assert_eq!(value["type"], "handshake");
        assert_eq!(value["action"], "request");
        assert_eq!(value["componentId"], "g1:node-a");
        assert_eq!(value["targetId"], "g2:node-b");

        let back = DmEnvelope::parse(&value).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn data_text_decodes_base64_carriers() {
        let env = DmEnvelope::Data {
            meta: meta(),
            id: "batch".into(),
            seq: 1,
            total: 1,
            text: None,
            b64: None,
            payload_b64: Some(base64::engine::general_purpose::STANDARD.encode("hidden")),
            body_b64: None,
        };
        assert_eq!(env.data_text().as_deref(), Some("hidden"));
    }

    #[test]
    fn split_respects_budget_and_reassembles() {
        let text: String = std::iter::repeat("the quick brown fox ").take(300).collect();
        assert_eq!(text.len(), 6000);
        let chunks = split_text(&meta(), "batch-1", &text, 1800);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(serde_json::to_string(c).unwrap().len() <= 1800);
        }

        let mut inbox = DmInbox::new();
        let mut assembled = None;
        for c in &chunks {
            if let DmEnvelope::Data { id, seq, total, .. } = c {
                assembled = inbox.accept(id, *seq, *total, c.data_text().unwrap());
            }
        }
        assert_eq!(assembled.as_deref(), Some(text.as_str()));
        assert_eq!(inbox.pending(), 0);
    }

    #[test]
    fn missing_chunk_blocks_completion_until_it_arrives() {
        let text: String = std::iter::repeat("abcdefghij").take(600).collect();
        let chunks = split_text(&meta(), "batch-2", &text, 1800);
        assert!(chunks.len() >= 3);

        let mut inbox = DmInbox::new();
        let mut done = None;
        // Deliver everything except seq 2.
        for c in &chunks {
            if let DmEnvelope::Data { id, seq, total, .. } = c {
                if *seq == 2 {
                    continue;
                }
                done = inbox.accept(id, *seq, *total, c.data_text().unwrap());
            }
        }
        assert!(done.is_none());
        assert_eq!(inbox.pending(), 1);

        // The straggler completes the batch.
        if let DmEnvelope::Data { id, seq, total, .. } = &chunks[1] {
            done = inbox.accept(id, *seq, *total, chunks[1].data_text().unwrap());
        }
        assert_eq!(done.as_deref(), Some(text.as_str()));
    }

    #[test]
    fn permuted_chunks_reassemble_identically() {
        let text = "0123456789".repeat(120);
        let mut chunks = split_text(&meta(), "batch-3", &text, 512);
        chunks.reverse();

        let mut inbox = DmInbox::new();
        let mut out = None;
        for c in &chunks {
            if let DmEnvelope::Data { id, seq, total, .. } = c {
                out = inbox.accept(id, *seq, *total, c.data_text().unwrap()).or(out);
            }
        }
        assert_eq!(out.as_deref(), Some(text.as_str()));
    }

    #[test]
    fn out_of_batch_frames_are_ignored() {
        let mut inbox = DmInbox::new();
        assert!(inbox.accept("b", 0, 3, "x".into()).is_none());
        assert!(inbox.accept("b", 4, 3, "x".into()).is_none());
        assert!(inbox.accept("b", 1, 3, "one".into()).is_none());
        // Disagreeing total is dropped, original batch stays live.
        assert!(inbox.accept("b", 2, 5, "two".into()).is_none());
        assert!(inbox.accept("b", 2, 3, "two".into()).is_none());
        assert_eq!(
            inbox.accept("b", 3, 3, "three".into()).as_deref(),
            Some("onetwothree")
        );
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllø wörld ".repeat(200);
        let chunks = split_text(&meta(), "batch-4", &text, 512);
        let mut inbox = DmInbox::new();
        let mut out = None;
        for c in &chunks {
            if let DmEnvelope::Data { id, seq, total, .. } = c {
                out = inbox.accept(id, *seq, *total, c.data_text().unwrap());
            }
        }
        assert_eq!(out.as_deref(), Some(text.as_str()));
    }
}
