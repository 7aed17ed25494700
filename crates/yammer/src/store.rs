//! Node records and graph configuration over a KV abstraction.
//!
//! Each node persists one record under `graph.node.<id>`; the graph itself
//! keeps `{transport, wires, graphId}` under `graph.cfg`, and the relay seed
//! under `graph.relay.seed`. The KV store is single-writer; concurrent
//! updates to one node use read-modify-write and must not assume atomicity
//! across independent patches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::router::Wire;

/// Key of the graph-level configuration record.
pub const GRAPH_CFG_KEY: &str = "graph.cfg";

/// Key of the persisted relay seed.
pub const RELAY_SEED_KEY: &str = "graph.relay.seed";

/// Key of the editor-owned workspace snapshot, consumed here only on restore.
pub const WORKSPACE_KEY: &str = "graph.workspace";

/// Key of a node record.
pub fn node_key(id: &str) -> String {
    format!("graph.node.{id}")
}

/// String-key → JSON-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: &str, value: Value);
    fn delete(&self, key: &str);
}

/// In-memory store for tests and ephemeral graphs.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<Value> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) {
        self.map.lock().unwrap().insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        self.map.lock().unwrap().remove(key);
    }
}

/// File-backed store: one JSON object per graph, rewritten on every put.
/// Write volume is a handful of small records, so simplicity wins.
pub struct FileKv {
    path: PathBuf,
    map: Mutex<HashMap<String, Value>>,
}

impl FileKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("corrupt kv file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn persist(&self, map: &HashMap<String, Value>) {
        let encoded = match serde_json::to_string_pretty(map) {
            Ok(s) => s,
            Err(e) => {
                warn!("kv encode failed: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, encoded) {
            warn!(path = %self.path.display(), "kv write failed: {e}");
        }
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> Option<Value> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) {
        let mut map = self.map.lock().unwrap();
        map.insert(key.to_string(), value);
        self.persist(&map);
    }

    fn delete(&self, key: &str) {
        let mut map = self.map.lock().unwrap();
        map.remove(key);
        self.persist(&map);
    }
}

/// Node kinds with fixed port maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Asr,
    Llm,
    Tts,
    TextInput,
    Template,
    PeerDm,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Asr => "asr",
            NodeKind::Llm => "llm",
            NodeKind::Tts => "tts",
            NodeKind::TextInput => "text-input",
            NodeKind::Template => "template",
            NodeKind::PeerDm => "peer-dm",
        }
    }

    /// Default config seeded into a fresh record.
    pub fn default_config(&self) -> Map<String, Value> {
        let value = match self {
            NodeKind::Asr => json!({
                "base": "http://127.0.0.1:8126",
                "api_key": "",
                "rate": 16000,
                "chunk_ms": 120,
                "live": true,
                "mode": "fast",
                "model": "",
                "prompt": "",
                "rms_threshold": 0.012,
                "ema_ms": 120,
                "hold_ms": 250,
                "pre_ms": 450,
                "silence_ms": 900,
                "min_tail_ms": 350,
                "phrase_min_words": 3,
                "phrase_stable_ms": 350,
                "suppress_partials": false,
            }),
            NodeKind::Llm => json!({
                "base": "http://127.0.0.1:11434",
                "api_key": "",
                "model": "",
                "stream": true,
                "memory_on": true,
                "max_turns": 8,
                "use_system": false,
                "system": "",
                "memory": [],
            }),
            NodeKind::Tts => json!({
                "base": "http://127.0.0.1:8123",
                "api_key": "",
                "mode": "stream",
                "model": "",
                "voice": "",
            }),
            NodeKind::TextInput => json!({}),
            NodeKind::Template => json!({
                "template": "",
            }),
            NodeKind::PeerDm => json!({
                "peer_address": "",
                "auto_accept": false,
                "allowed_peers": [],
                "heartbeat_s": 15,
                "chunk_bytes": 1800,
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// One node's durable record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub config: Map<String, Value>,
}

/// Which transport the graph currently runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Relay,
}

/// Graph-level durable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub wires: Vec<Wire>,
    #[serde(default, rename = "graphId")]
    pub graph_id: String,
}

/// Store of node records and graph config.
#[derive(Clone)]
pub struct NodeStore {
    kv: Arc<dyn KvStore>,
}

impl NodeStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Load the record for `id`, creating a fresh one with typed defaults
    /// when the key is absent or the stored kind disagrees with `kind`.
    pub fn ensure(&self, id: &str, kind: NodeKind) -> NodeRecord {
        if let Some(record) = self.load(id) {
            if record.kind == kind {
                return record;
            }
        }
        let record = NodeRecord {
            id: id.to_string(),
            kind,
            config: kind.default_config(),
        };
        self.save(&record);
        record
    }

    pub fn load(&self, id: &str) -> Option<NodeRecord> {
        let value = self.kv.get(&node_key(id))?;
        serde_json::from_value(value).ok()
    }

    pub fn save(&self, record: &NodeRecord) {
        if let Ok(value) = serde_json::to_value(record) {
            self.kv.put(&node_key(&record.id), value);
        }
    }

    /// Shallow-merge `patch` into the record's config and persist.
    pub fn update(&self, id: &str, patch: Map<String, Value>) -> Option<NodeRecord> {
        let mut record = self.load(id)?;
        for (k, v) in patch {
            record.config.insert(k, v);
        }
        self.save(&record);
        Some(record)
    }

    pub fn erase(&self, id: &str) {
        self.kv.delete(&node_key(id));
    }

    /// Record the relay address a node is bound to.
    pub fn set_relay(&self, id: &str, kind: NodeKind, relay: Option<&str>) {
        let mut record = self.ensure(id, kind);
        match relay {
            Some(addr) => {
                record
                    .config
                    .insert("relay".to_string(), Value::String(addr.to_string()));
            }
            None => {
                record.config.remove("relay");
            }
        }
        self.save(&record);
    }

    /// Graph config, generating and persisting a graph id on first use.
    pub fn graph_config(&self) -> GraphConfig {
        let mut cfg: GraphConfig = self
            .kv
            .get(GRAPH_CFG_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        if cfg.graph_id.is_empty() {
            cfg.graph_id = fresh_graph_id();
            self.save_graph_config(&cfg);
        }
        cfg
    }

    pub fn save_graph_config(&self, cfg: &GraphConfig) {
        if let Ok(value) = serde_json::to_value(cfg) {
            self.kv.put(GRAPH_CFG_KEY, value);
        }
    }

    /// Editor-owned workspace snapshot, if one was persisted.
    pub fn workspace(&self) -> Option<Value> {
        self.kv.get(WORKSPACE_KEY)
    }
}

/// 128-bit random graph identifier: UUID normally, time+random if the UUID
/// source is somehow unusable.
fn fresh_graph_id() -> String {
    let id = uuid::Uuid::new_v4();
    if !id.is_nil() {
        return id.simple().to_string();
    }
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u128;
    let noise: u64 = rand::random();
    format!("{:016x}{:016x}", nanos as u64, noise)
}
