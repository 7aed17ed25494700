//! LLM controller: prompt in, sentence-muxed token stream out.
//!
//! A `prompt` message starts a turn. The controller builds the message list
//! (system + memory window + the new user message), streams NDJSON from
//! `/api/chat`, extracts token deltas, and pushes them through the sentence
//! mux; every completed sentence is routed on both `delta` and `final`.
//! After a successful turn the memory window is rebuilt, persisted, and
//! announced on `memory`. Failures are logged and the turn emits nothing
//! further; the graph keeps running.

pub mod memory;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use yammerproto::relay::RelayLine;
use yammerproto::{RelayHttpRequest, SeqBuffer};

use crate::message::Message;
use crate::router::{PortAddress, Router};
use crate::store::{NodeKind, NodeStore, TransportKind};
use crate::text::ndjson::NdjsonPump;
use crate::text::sentence::{SentenceMux, TimerDirective};
use crate::transport::{StreamHandlers, TransportMux, STREAM_TIMEOUT};

/// Literal terminator tokens some models leak into their output.
const TERMINATORS: [&str; 2] = ["</s>", "<|eot_id|>"];

/// Per-turn configuration, read from the node record at turn start.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base: String,
    pub api_key: String,
    pub model: String,
    pub stream: bool,
    pub memory_on: bool,
    pub max_turns: usize,
    pub use_system: bool,
    pub system: String,
    pub use_relay: bool,
    pub relay: String,
}

impl LlmConfig {
    pub fn from_store(store: &NodeStore, node_id: &str) -> Self {
        let record = store.ensure(node_id, NodeKind::Llm);
        let cfg = &record.config;
        let s = |k: &str| cfg.get(k).and_then(Value::as_str).unwrap_or("").to_string();
        let b = |k: &str, d: bool| cfg.get(k).and_then(Value::as_bool).unwrap_or(d);
        let relay = s("relay");
        let use_relay =
            store.graph_config().transport == TransportKind::Relay && !relay.is_empty();
        Self {
            base: s("base"),
            api_key: s("api_key"),
            model: s("model"),
            stream: b("stream", true),
            memory_on: b("memory_on", true),
            max_turns: cfg.get("max_turns").and_then(Value::as_u64).unwrap_or(8) as usize,
            use_system: b("use_system", false),
            system: s("system"),
            use_relay,
            relay,
        }
    }
}

/// Pick the token delta out of one NDJSON line, first non-empty of
/// `message.content`, `response`, `delta` — in that order. Changing this
/// order changes which text wins when a server sets several; keep it.
pub fn extract_delta(line: &Value) -> Option<String> {
    let candidates = [
        line.pointer("/message/content"),
        line.get("response"),
        line.get("delta"),
    ];
    for c in candidates.into_iter().flatten() {
        if let Some(s) = c.as_str() {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Whether this line terminates the stream.
pub fn is_terminal(line: &Value) -> bool {
    line.get("done").and_then(Value::as_bool).unwrap_or(false)
        || line.get("complete").and_then(Value::as_bool).unwrap_or(false)
}

/// Terminal lines may carry the last chunk under `final` too.
pub fn terminal_text(line: &Value) -> Option<String> {
    if let Some(s) = line.get("final").and_then(Value::as_str) {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    line.pointer("/message/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Remove terminator tokens by literal substring removal.
pub fn strip_terminators(text: &str) -> String {
    let mut out = text.to_string();
    for t in TERMINATORS {
        out = out.replace(t, "");
    }
    out
}

/// Sentence mux plus its stability timer, shared between the stream callback
/// and the timer task.
struct SentencePipe {
    mux: Mutex<SentenceMux>,
    timer: Mutex<Option<JoinHandle<()>>>,
    emit: Box<dyn Fn(String) + Send + Sync>,
}

impl SentencePipe {
    fn new(emit: Box<dyn Fn(String) + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            mux: Mutex::new(SentenceMux::default()),
            timer: Mutex::new(None),
            emit,
        })
    }

    fn push(self: &Arc<Self>, delta: &str) {
        let directive = {
            let mut mux = self.mux.lock().unwrap();
            mux.push(delta, &mut |s| (self.emit)(s))
        };
        if let TimerDirective::Arm(window) = directive {
            self.rearm(window);
        }
    }

    fn rearm(self: &Arc<Self>, window: Duration) {
        let mut slot = self.timer.lock().unwrap();
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let pipe = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut mux = pipe.mux.lock().unwrap();
            mux.on_stable(&mut |s| (pipe.emit)(s));
        }));
    }

    fn flush(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
        let mut mux = self.mux.lock().unwrap();
        mux.flush(&mut |s| (self.emit)(s));
    }
}

/// The controller. One instance serves every LLM node in the graph.
pub struct LlmController {
    router: Arc<Router>,
    mux: Arc<TransportMux>,
    store: NodeStore,
}

impl LlmController {
    pub fn new(router: Arc<Router>, mux: Arc<TransportMux>, store: NodeStore) -> Arc<Self> {
        Arc::new(Self { router, mux, store })
    }

    /// Register the node's input handlers: `prompt` starts a turn, `system`
    /// updates the system message and enables it.
    pub fn attach(self: &Arc<Self>, node_id: &str) {
        self.store.ensure(node_id, NodeKind::Llm);

        let ctl = Arc::clone(self);
        let id = node_id.to_string();
        self.router.register(
            PortAddress::input(node_id, "prompt"),
            Arc::new(move |msg: &Message| {
                let text = msg.display_text();
                if text.trim().is_empty() {
                    return Ok(());
                }
                let ctl = Arc::clone(&ctl);
                let id = id.clone();
                tokio::spawn(async move {
                    ctl.run_turn(&id, &text).await;
                });
                Ok(())
            }),
        );

        let store = self.store.clone();
        let id = node_id.to_string();
        self.router.register(
            PortAddress::input(node_id, "system"),
            Arc::new(move |msg: &Message| {
                let patch = json!({
                    "system": msg.display_text(),
                    "use_system": true,
                });
                store.update(&id, patch.as_object().cloned().unwrap_or_default());
                Ok(())
            }),
        );
    }

    pub fn detach(&self, node_id: &str) {
        self.router.unregister(&PortAddress::input(node_id, "prompt"));
        self.router.unregister(&PortAddress::input(node_id, "system"));
    }

    /// Run one turn. All failures are logged here and kept out of the graph.
    pub async fn run_turn(self: &Arc<Self>, node_id: &str, user_text: &str) {
        let cfg = LlmConfig::from_store(&self.store, node_id);
        if cfg.base.is_empty() {
            warn!(node = node_id, "llm node has no base url configured");
            return;
        }

        let record = self.store.ensure(node_id, NodeKind::Llm);
        let remembered = memory::memory_from_value(record.config.get("memory"));
        let messages = memory::build_messages(
            &cfg.system,
            cfg.use_system,
            &remembered,
            cfg.memory_on,
            user_text,
            cfg.max_turns,
        );

        let assistant = match self.complete(node_id, &cfg, &messages).await {
            Ok(text) => text,
            Err(e) => {
                warn!(node = node_id, "llm turn failed: {e:#}");
                return;
            }
        };

        if cfg.memory_on {
            let memory =
                memory::rebuild_memory(&remembered, user_text, Some(&assistant), cfg.max_turns);
            let patch = json!({"memory": memory::memory_to_value(&memory)});
            self.store
                .update(node_id, patch.as_object().cloned().unwrap_or_default());
            self.router.send_from(
                node_id,
                "memory",
                Message::new(json!({
                    "nodeId": node_id,
                    "type": "updated",
                    "size": memory.len(),
                })),
            );
        }
    }

    /// Perform the request and drive deltas through the sentence pipe.
    /// Returns the accumulated assistant text.
    async fn complete(
        self: &Arc<Self>,
        node_id: &str,
        cfg: &LlmConfig,
        messages: &[memory::ChatMessage],
    ) -> anyhow::Result<String> {
        let mut body = json!({
            "messages": messages,
            "stream": cfg.stream,
        });
        if !cfg.model.is_empty() {
            body["model"] = Value::String(cfg.model.clone());
        }

        let router = Arc::clone(&self.router);
        let id = node_id.to_string();
        let pipe = SentencePipe::new(Box::new(move |sentence: String| {
            let msg = Message::text(&id, sentence);
            router.send_from(&id, "delta", msg.clone());
            router.send_from(&id, "final", msg);
        }));
        let assistant = Arc::new(Mutex::new(String::new()));

        if !cfg.stream {
            let response = self
                .mux
                .post_json(
                    &cfg.base,
                    "/api/chat",
                    body,
                    &cfg.api_key,
                    cfg.use_relay,
                    &cfg.relay,
                    crate::transport::POST_TIMEOUT,
                )
                .await?;
            let text = extract_delta(&response)
                .or_else(|| terminal_text(&response))
                .unwrap_or_default();
            let clean = strip_terminators(&text);
            pipe.push(&clean);
            pipe.flush();
            return Ok(clean);
        }

        let line_pipe = Arc::clone(&pipe);
        let line_acc = Arc::clone(&assistant);
        let mut on_line = move |line: &str| {
            let parsed: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    debug!("skipping unparseable llm line: {e}");
                    return;
                }
            };
            let chunk = if is_terminal(&parsed) {
                extract_delta(&parsed).or_else(|| terminal_text(&parsed))
            } else {
                extract_delta(&parsed)
            };
            if let Some(chunk) = chunk {
                let clean = strip_terminators(&chunk);
                if !clean.is_empty() {
                    line_acc.lock().unwrap().push_str(&clean);
                    line_pipe.push(&clean);
                }
            }
        };

        if cfg.use_relay {
            let url = format!("{}/api/chat", cfg.base.trim_end_matches('/'));
            let req = RelayHttpRequest::post_json(url, body)
                .with_timeout_ms(STREAM_TIMEOUT.as_millis() as u64);
            // Lines may arrive permuted across datagrams; restore seq order
            // before the pump sees them. Every relay line is newline-closed,
            // so the pump never holds residue here.
            let mut order: SeqBuffer<RelayLine> = SeqBuffer::starting_at(1);
            let mut pump = NdjsonPump::new();
            let handlers = StreamHandlers {
                on_lines: Some(Box::new(move |batch: Vec<RelayLine>| {
                    for line in batch {
                        for ready in order.push(line.seq, line) {
                            pump.push_str(&ready.line, &mut on_line);
                            pump.push_str("\n", &mut on_line);
                        }
                    }
                })),
                ..Default::default()
            };
            self.mux
                .send_stream(&cfg.relay, req, handlers, STREAM_TIMEOUT)
                .await?;
        } else {
            let mut pump = NdjsonPump::new();
            let url = format!("{}/api/chat", cfg.base.trim_end_matches('/'));
            self.mux
                .stream_http(&url, &cfg.api_key, Some(body), STREAM_TIMEOUT, |bytes| {
                    pump.push(&bytes, &mut on_line);
                })
                .await?;
            pump.flush(&mut on_line);
        }

        pipe.flush();
        let text = assistant.lock().unwrap().clone();
        Ok(text)
    }

    /// Enumerate models: `/api/tags`, then `/v1/models`, then `/models`,
    /// first endpoint that answers wins.
    pub async fn list_models(&self, node_id: &str) -> Vec<String> {
        let cfg = LlmConfig::from_store(&self.store, node_id);
        for path in ["/api/tags", "/v1/models", "/models"] {
            match self
                .mux
                .get_json(&cfg.base, path, &cfg.api_key, cfg.use_relay, &cfg.relay)
                .await
            {
                Ok(value) => {
                    let names = model_names(&value);
                    if !names.is_empty() {
                        return names;
                    }
                }
                Err(e) => debug!("model listing via {path} failed: {e}"),
            }
        }
        Vec::new()
    }
}

/// Pull model names out of the assorted listing shapes.
fn model_names(value: &Value) -> Vec<String> {
    let arrays = [
        value.get("models").and_then(Value::as_array),
        value.get("data").and_then(Value::as_array),
        value.as_array(),
    ];
    for arr in arrays.into_iter().flatten() {
        let names: Vec<String> = arr
            .iter()
            .filter_map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .or_else(|| item.get("name").and_then(Value::as_str).map(str::to_string))
                    .or_else(|| item.get("id").and_then(Value::as_str).map(str::to_string))
            })
            .collect();
        if !names.is_empty() {
            return names;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_extraction_order() {
        let line = json!({"message": {"content": "mc"}, "response": "r", "delta": "d"});
        assert_eq!(extract_delta(&line).as_deref(), Some("mc"));
        let line = json!({"response": "r", "delta": "d"});
        assert_eq!(extract_delta(&line).as_deref(), Some("r"));
        let line = json!({"delta": "d"});
        assert_eq!(extract_delta(&line).as_deref(), Some("d"));
        // Empty strings do not win.
        let line = json!({"message": {"content": ""}, "delta": "d"});
        assert_eq!(extract_delta(&line).as_deref(), Some("d"));
        assert_eq!(extract_delta(&json!({})), None);
    }

    #[test]
    fn terminal_detection() {
        assert!(is_terminal(&json!({"done": true})));
        assert!(is_terminal(&json!({"complete": true})));
        assert!(!is_terminal(&json!({"done": false})));
        assert_eq!(
            terminal_text(&json!({"done": true, "final": "tail"})).as_deref(),
            Some("tail")
        );
        assert_eq!(
            terminal_text(&json!({"done": true, "message": {"content": "mc"}})).as_deref(),
            Some("mc")
        );
    }

    #[test]
    fn terminator_stripping_is_literal() {
        assert_eq!(strip_terminators("hello</s>"), "hello");
        assert_eq!(strip_terminators("a<|eot_id|>b</s>c"), "abc");
        assert_eq!(strip_terminators("plain"), "plain");
    }

    #[test]
    fn model_name_shapes() {
        let tags = json!({"models": [{"name": "llama3"}, {"name": "phi"}]});
        assert_eq!(model_names(&tags), vec!["llama3", "phi"]);
        let v1 = json!({"data": [{"id": "m-1"}]});
        assert_eq!(model_names(&v1), vec!["m-1"]);
        let flat = json!(["a", "b"]);
        assert_eq!(model_names(&flat), vec!["a", "b"]);
        assert!(model_names(&json!({})).is_empty());
    }
}
