//! Bounded per-node log surface.
//!
//! Every node keeps its last hundred log entries for the embedder's
//! inspection panel. Controllers record through [`NodeLogs::record`]; a
//! status wire can also be pointed at [`NodeLogs::handler`] to capture
//! status messages as they flow.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::message::Message;
use crate::router::Handler;

/// Entries kept per node.
pub const LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogEntry {
    pub ts: i64,
    pub level: String,
    pub text: String,
}

/// Ring of recent log entries per node id.
#[derive(Default)]
pub struct NodeLogs {
    entries: Mutex<HashMap<String, VecDeque<LogEntry>>>,
}

impl NodeLogs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, node_id: &str, level: &str, text: impl Into<String>) {
        let entry = LogEntry {
            ts: yammerproto::now_ms(),
            level: level.to_string(),
            text: text.into(),
        };
        let mut entries = self.entries.lock().unwrap();
        let ring = entries.entry(node_id.to_string()).or_default();
        if ring.len() == LOG_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// The retained entries, oldest first.
    pub fn tail(&self, node_id: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(node_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, node_id: &str) {
        self.entries.lock().unwrap().remove(node_id);
    }

    /// A router handler that records status messages for `node_id`. Wire a
    /// node's `status` output at it to capture warnings as they flow.
    pub fn handler(self: &Arc<Self>, node_id: &str) -> Handler {
        let logs = Arc::clone(self);
        let id = node_id.to_string();
        Arc::new(move |msg: &Message| {
            let level = msg.get_str("level").unwrap_or("info").to_string();
            let code = msg.get_str("code").unwrap_or("");
            let detail = msg.get_str("detail").unwrap_or("");
            let text = if code.is_empty() {
                detail.to_string()
            } else if detail.is_empty() {
                code.to_string()
            } else {
                format!("{code}: {detail}")
            };
            logs.record(&id, &level, text);
            Ok(())
        })
    }
}
