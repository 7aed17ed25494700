//! TTS controller: serializes text into a contiguous audio stream.
//!
//! Each TTS node owns a worker task draining an unbounded queue, so speech
//! requests play to completion in FIFO order and a failing request logs and
//! yields to the next. Stream mode decodes raw PCM16LE at 22 050 Hz with
//! odd-byte carry and resamples to the sink rate; file mode fetches the
//! rendered file (or decodes an inline base64 body) and plays it through
//! the node's sink. Short silence runs bracket each utterance to keep
//! chunk boundaries from clicking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use yammerproto::{RelayHttpRequest, SeqBuffer};

use crate::audio::{silence, AudioSink, Pcm16Decoder, resample_linear};
use crate::message::Message;
use crate::router::{PortAddress, Router};
use crate::store::{NodeKind, NodeStore, TransportKind};
use crate::text::sanitize_for_speech;
use crate::transport::{StreamHandlers, TransportMux, POST_TIMEOUT, STREAM_TIMEOUT};

/// Raw stream synthesis rate.
pub const SOURCE_RATE: u32 = 22_050;

/// Silence queued before each utterance.
const PREROLL_MS: u64 = 40;

/// Silence queued after each utterance.
const SPACER_MS: u64 = 30;

/// Per-request configuration, read from the node record.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub base: String,
    pub api_key: String,
    pub mode: String,
    pub model: String,
    pub voice: String,
    pub use_relay: bool,
    pub relay: String,
}

impl TtsConfig {
    pub fn from_store(store: &NodeStore, node_id: &str) -> Self {
        let record = store.ensure(node_id, NodeKind::Tts);
        let cfg = &record.config;
        let s = |k: &str| cfg.get(k).and_then(Value::as_str).unwrap_or("").to_string();
        let relay = s("relay");
        let use_relay =
            store.graph_config().transport == TransportKind::Relay && !relay.is_empty();
        let mode = {
            let m = s("mode");
            if m.is_empty() {
                "stream".to_string()
            } else {
                m
            }
        };
        Self {
            base: s("base"),
            api_key: s("api_key"),
            mode,
            model: s("model"),
            voice: s("voice"),
            use_relay,
            relay,
        }
    }
}

struct NodeEntry {
    queue: mpsc::UnboundedSender<String>,
    worker: JoinHandle<()>,
}

/// The controller. One instance serves every TTS node.
pub struct TtsController {
    router: Arc<Router>,
    mux: Arc<TransportMux>,
    store: NodeStore,
    nodes: Mutex<HashMap<String, NodeEntry>>,
}

impl TtsController {
    pub fn new(router: Arc<Router>, mux: Arc<TransportMux>, store: NodeStore) -> Arc<Self> {
        Arc::new(Self {
            router,
            mux,
            store,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Bind a node to its audio sink and register the `text` input.
    pub fn attach(self: &Arc<Self>, node_id: &str, sink: Arc<dyn AudioSink>) {
        self.store.ensure(node_id, NodeKind::Tts);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let ctl = Arc::clone(self);
        let id = node_id.to_string();
        let worker = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = ctl.speak(&id, &sink, &text).await {
                    warn!(node = %id, "speech task failed: {e:#}");
                    ctl.router.send_from(
                        &id,
                        "status",
                        Message::status(&id, "warn", "speak-failed", e.to_string()),
                    );
                }
            }
        });

        let queue = tx.clone();
        let router = Arc::clone(&self.router);
        let id = node_id.to_string();
        self.router.register(
            PortAddress::input(node_id, "text"),
            Arc::new(move |msg: &Message| {
                let text = msg.display_text();
                if text.trim().is_empty() {
                    router.send_from(
                        &id,
                        "status",
                        Message::status(&id, "warn", "missing-text", "empty speech request"),
                    );
                    return Ok(());
                }
                let _ = queue.send(text);
                Ok(())
            }),
        );

        let mut nodes = self.nodes.lock().unwrap();
        if let Some(old) = nodes.insert(node_id.to_string(), NodeEntry { queue: tx, worker }) {
            old.worker.abort();
        }
    }

    /// Tear a node down: the queue closes, the worker stops, the sink drops.
    pub fn detach(&self, node_id: &str) {
        self.router.unregister(&PortAddress::input(node_id, "text"));
        if let Some(entry) = self.nodes.lock().unwrap().remove(node_id) {
            drop(entry.queue);
            entry.worker.abort();
        }
    }

    /// Synthesize one utterance.
    async fn speak(
        &self,
        node_id: &str,
        sink: &Arc<dyn AudioSink>,
        raw_text: &str,
    ) -> anyhow::Result<()> {
        let text = sanitize_for_speech(raw_text);
        if text.is_empty() {
            return Ok(());
        }
        let cfg = TtsConfig::from_store(&self.store, node_id);
        if cfg.base.is_empty() {
            anyhow::bail!("tts node has no base url configured");
        }

        if cfg.mode == "file" {
            self.speak_file(&cfg, sink, &text).await
        } else {
            self.speak_stream(&cfg, sink, &text).await
        }
    }

    async fn speak_stream(
        &self,
        cfg: &TtsConfig,
        sink: &Arc<dyn AudioSink>,
        text: &str,
    ) -> anyhow::Result<()> {
        let mut body = json!({
            "text": text,
            "mode": "stream",
            "format": "raw",
        });
        if !cfg.model.is_empty() {
            body["model"] = Value::String(cfg.model.clone());
        }
        if !cfg.voice.is_empty() {
            body["voice"] = Value::String(cfg.voice.clone());
        }

        sink.resume();
        sink.enqueue(&silence(sink.sample_rate(), PREROLL_MS));

        let sink_rate = sink.sample_rate();
        let url = format!("{}/speak", cfg.base.trim_end_matches('/'));

        if cfg.use_relay {
            let req = RelayHttpRequest::post_json(url, body)
                .with_timeout_ms(STREAM_TIMEOUT.as_millis() as u64);
            let mut order: SeqBuffer<bytes::Bytes> = SeqBuffer::starting_at(1);
            let mut decoder = Pcm16Decoder::new();
            let out = Arc::clone(sink);
            let handlers = StreamHandlers {
                on_chunk: Some(Box::new(move |seq, chunk| {
                    for ready in order.push(seq, chunk) {
                        enqueue_pcm(&out, &mut decoder, &ready, sink_rate);
                    }
                })),
                ..Default::default()
            };
            self.mux
                .send_stream(&cfg.relay, req, handlers, STREAM_TIMEOUT)
                .await?;
        } else {
            let mut decoder = Pcm16Decoder::new();
            let out = Arc::clone(sink);
            self.mux
                .stream_http(&url, &cfg.api_key, Some(body), STREAM_TIMEOUT, |chunk| {
                    enqueue_pcm(&out, &mut decoder, &chunk, sink_rate);
                })
                .await?;
        }

        sink.enqueue(&silence(sink.sample_rate(), SPACER_MS));
        let underruns = sink.underruns();
        if underruns > 0 {
            debug!(underruns, "sink reported underruns");
        }
        Ok(())
    }

    async fn speak_file(
        &self,
        cfg: &TtsConfig,
        sink: &Arc<dyn AudioSink>,
        text: &str,
    ) -> anyhow::Result<()> {
        let mut body = json!({
            "text": text,
            "mode": "file",
            "format": "ogg",
        });
        if !cfg.model.is_empty() {
            body["model"] = Value::String(cfg.model.clone());
        }
        if !cfg.voice.is_empty() {
            body["voice"] = Value::String(cfg.voice.clone());
        }

        let response = self
            .mux
            .post_json(
                &cfg.base,
                "/speak",
                body,
                &cfg.api_key,
                cfg.use_relay,
                &cfg.relay,
                POST_TIMEOUT,
            )
            .await?;

        if let Some(url) = response
            .pointer("/files/0/url")
            .and_then(Value::as_str)
        {
            let full = if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("{}/{}", cfg.base.trim_end_matches('/'), url.trim_start_matches('/'))
            };
            let blob = self
                .mux
                .fetch_blob(&full, cfg.use_relay, &cfg.relay, &cfg.api_key)
                .await?;
            sink.play_encoded(&blob.content_type, blob.bytes).await?;
            return Ok(());
        }

        if let Some(b64) = response.get("audio_b64").and_then(Value::as_str) {
            let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
            sink.play_encoded("audio/ogg", bytes).await?;
            return Ok(());
        }

        anyhow::bail!("speak response carried neither files nor audio_b64")
    }

    /// Enumerate voices/models from `GET /models`.
    pub async fn list_voices(&self, node_id: &str) -> Vec<String> {
        let cfg = TtsConfig::from_store(&self.store, node_id);
        match self
            .mux
            .get_json(&cfg.base, "/models", &cfg.api_key, cfg.use_relay, &cfg.relay)
            .await
        {
            Ok(value) => value
                .get("models")
                .or_else(|| value.get("voices"))
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| {
                            v.as_str()
                                .map(str::to_string)
                                .or_else(|| v.get("name").and_then(Value::as_str).map(str::to_string))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                debug!("voice listing failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Decode a PCM16LE chunk and hand it to the sink, resampling when the sink
/// rate differs from the synthesis rate.
fn enqueue_pcm(
    sink: &Arc<dyn AudioSink>,
    decoder: &mut Pcm16Decoder,
    chunk: &[u8],
    sink_rate: u32,
) {
    let samples = decoder.push(chunk);
    if samples.is_empty() {
        return;
    }
    if sink_rate != SOURCE_RATE {
        sink.enqueue(&resample_linear(&samples, SOURCE_RATE, sink_rate));
    } else {
        sink.enqueue(&samples);
    }
}
