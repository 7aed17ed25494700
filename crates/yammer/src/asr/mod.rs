//! ASR controller: a live microphone stream in, partial/phrase/final text out.
//!
//! One node owns the microphone at a time. Captured audio is downmixed,
//! resampled to the session rate, and gated by the VAD; on voice onset the
//! pre-roll ring and live samples feed an uplink pacer that posts PCM16LE
//! frames to the recognition session, while an event task ingests the
//! partial/detected/final stream. Finals pass the dedup window and the
//! hallucination guard before they reach the `final` port.

pub mod guard;
pub mod phrase;
pub mod sse;
pub mod vad;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use yammerproto::relay::RelayLine;
use yammerproto::{RelayHttpRequest, SeqBuffer};

use crate::audio::{downmix_mono, encode_wav_pcm16, f32_to_pcm16le, resample_linear, rms, CaptureSource, CaptureStream};
use crate::clock::Clock;
use crate::message::Message;
use crate::router::Router;
use crate::store::{NodeKind, NodeStore, TransportKind};
use crate::transport::{StreamHandlers, TransportMux, POST_TIMEOUT, STREAM_TIMEOUT};

use guard::{is_hallucinated_final, FinalMeta};
use phrase::PhraseDetector;
use sse::{parse_event, AsrEvent, SseParser};
use vad::{Vad, VadConfig, VadEdge, VadState};

/// Quiet window both the audio pump and the partial stream must hold before
/// a session is finalized.
const LINGER_MS: u64 = 700;

/// Hard cap on waiting for quiescence.
const FORCE_QUIET_MAX_MS: u64 = 2800;

/// Identical finals inside this window are dropped.
const FINAL_DEDUP_MS: u64 = 1500;

/// Outstanding audio posts per session.
const INFLIGHT_CAP: usize = 4;

/// Timeout for the session end call.
const END_TIMEOUT: Duration = Duration::from_secs(20);

/// Node configuration, read at capture start.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub base: String,
    pub api_key: String,
    pub rate: u32,
    pub chunk_ms: u64,
    pub live: bool,
    pub mode: String,
    pub model: String,
    pub prompt: String,
    pub rms_threshold: f32,
    pub ema_ms: u64,
    pub hold_ms: u64,
    pub pre_ms: u64,
    pub silence_ms: u64,
    pub min_tail_ms: u64,
    pub phrase_min_words: usize,
    pub phrase_stable_ms: u64,
    pub suppress_partials: bool,
    pub use_relay: bool,
    pub relay: String,
}

impl AsrConfig {
    pub fn from_store(store: &NodeStore, node_id: &str) -> Self {
        let record = store.ensure(node_id, NodeKind::Asr);
        let cfg = &record.config;
        let s = |k: &str| cfg.get(k).and_then(Value::as_str).unwrap_or("").to_string();
        let n = |k: &str, d: u64| cfg.get(k).and_then(Value::as_u64).unwrap_or(d);
        let relay = s("relay");
        let use_relay =
            store.graph_config().transport == TransportKind::Relay && !relay.is_empty();
        Self {
            base: s("base"),
            api_key: s("api_key"),
            rate: n("rate", 16_000) as u32,
            chunk_ms: n("chunk_ms", 120),
            live: cfg.get("live").and_then(Value::as_bool).unwrap_or(true),
            mode: s("mode"),
            model: s("model"),
            prompt: s("prompt"),
            rms_threshold: cfg
                .get("rms_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(0.012) as f32,
            ema_ms: n("ema_ms", 120),
            hold_ms: n("hold_ms", 250),
            pre_ms: n("pre_ms", 450),
            silence_ms: n("silence_ms", 900),
            min_tail_ms: n("min_tail_ms", 350),
            phrase_min_words: n("phrase_min_words", 3) as usize,
            phrase_stable_ms: n("phrase_stable_ms", 350),
            suppress_partials: cfg
                .get("suppress_partials")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            use_relay,
            relay,
        }
    }

    fn tail(&self) -> Duration {
        Duration::from_millis(self.silence_ms.max(self.min_tail_ms))
    }
}

/// Everything one capture session shares between its tasks.
struct Session {
    node: String,
    cfg: AsrConfig,
    router: Arc<Router>,
    mux: Arc<TransportMux>,
    clock: Arc<dyn Clock>,

    stop: AtomicBool,
    uplink_open: AtomicBool,
    finalizing: AtomicBool,
    vad_silent: AtomicBool,
    speech_observed: AtomicBool,

    sid: Mutex<Option<String>>,
    /// Serializes session creation so two pump iterations never race a start.
    session_gate: tokio::sync::Mutex<()>,

    buffer: Mutex<Vec<f32>>,
    inflight: AtomicUsize,
    permits: Arc<Semaphore>,

    last_post_at: Mutex<Option<Instant>>,
    last_partial_at: Mutex<Option<Instant>>,
    last_final: Mutex<Option<(String, Instant)>>,
    partial_text: Mutex<String>,
    finals: Mutex<Vec<String>>,
    phrase: Mutex<PhraseDetector>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    fn new(
        node: &str,
        cfg: AsrConfig,
        router: Arc<Router>,
        mux: Arc<TransportMux>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let phrase = PhraseDetector::new(cfg.phrase_min_words, cfg.phrase_stable_ms);
        Arc::new(Self {
            node: node.to_string(),
            cfg,
            router,
            mux,
            clock,
            stop: AtomicBool::new(false),
            uplink_open: AtomicBool::new(false),
            finalizing: AtomicBool::new(false),
            vad_silent: AtomicBool::new(true),
            speech_observed: AtomicBool::new(false),
            sid: Mutex::new(None),
            session_gate: tokio::sync::Mutex::new(()),
            buffer: Mutex::new(Vec::new()),
            inflight: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(INFLIGHT_CAP)),
            last_post_at: Mutex::new(None),
            last_partial_at: Mutex::new(None),
            last_final: Mutex::new(None),
            partial_text: Mutex::new(String::new()),
            finals: Mutex::new(Vec::new()),
            phrase: Mutex::new(phrase),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    // ---- routing -----------------------------------------------------

    fn route_partial(&self, text: &str) {
        self.router
            .send_from(&self.node, "partial", Message::text(&self.node, text));
    }

    fn route_phrase(&self, text: &str) {
        self.router
            .send_from(&self.node, "phrase", Message::text(&self.node, text));
    }

    /// Guard, dedup, then route a final. Returns whether it was routed.
    fn try_route_final(&self, text: &str, meta: &FinalMeta) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        if is_hallucinated_final(
            text,
            self.speech_observed.load(Ordering::Relaxed),
            self.vad_silent.load(Ordering::Relaxed),
            meta,
        ) {
            debug!(node = %self.node, "dropping hallucinated final: {text:?}");
            return false;
        }
        let now = self.clock.now();
        {
            let mut last = self.last_final.lock().unwrap();
            if let Some((prev, at)) = last.as_ref() {
                if prev == text
                    && (now.duration_since(*at).as_millis() as u64) < FINAL_DEDUP_MS
                {
                    debug!(node = %self.node, "dropping duplicate final");
                    return false;
                }
            }
            *last = Some((text.to_string(), now));
        }
        self.finals.lock().unwrap().push(text.to_string());
        self.phrase.lock().unwrap().clear();
        self.router
            .send_from(&self.node, "final", Message::text(&self.node, text));
        true
    }

    // ---- session lifecycle -------------------------------------------

    /// Lazily create the server session; concurrent callers share one start.
    async fn ensure_sid(self: &Arc<Self>) -> Result<String> {
        if let Some(sid) = self.sid.lock().unwrap().clone() {
            return Ok(sid);
        }
        let _gate = self.session_gate.lock().await;
        if let Some(sid) = self.sid.lock().unwrap().clone() {
            return Ok(sid);
        }

        let mut body = json!({
            "temperature": 0.0,
            "condition_on_previous_text": false,
            "no_speech_threshold": 0.6,
            "logprob_threshold": -1.0,
        });
        if !self.cfg.mode.is_empty() {
            body["mode"] = Value::String(self.cfg.mode.clone());
        }
        if !self.cfg.prompt.is_empty() {
            body["prompt"] = Value::String(self.cfg.prompt.clone());
        }
        if !self.cfg.model.is_empty() {
            body["model"] = Value::String(self.cfg.model.clone());
        }

        let response = self
            .mux
            .post_json(
                &self.cfg.base,
                "/recognize/stream/start",
                body,
                &self.cfg.api_key,
                self.cfg.use_relay,
                &self.cfg.relay,
                POST_TIMEOUT,
            )
            .await
            .context("starting recognition session")?;

        let sid = response
            .get("sid")
            .or_else(|| response.get("id"))
            .or_else(|| response.get("session"))
            .and_then(Value::as_str)
            .context("session start response carried no sid")?
            .to_string();

        *self.sid.lock().unwrap() = Some(sid.clone());

        let session = Arc::clone(self);
        let events_sid = sid.clone();
        let handle = tokio::spawn(async move {
            session.events_loop(events_sid).await;
        });
        self.track(handle);

        Ok(sid)
    }

    /// Ingest the session's SSE (or relay-chunked) event stream.
    async fn events_loop(self: Arc<Self>, sid: String) {
        let path = format!("/recognize/stream/{sid}/events");
        let url = format!("{}{}", self.cfg.base.trim_end_matches('/'), path);

        let result = if self.cfg.use_relay {
            let req = RelayHttpRequest::get(url)
                .with_header("Accept", "text/event-stream")
                .with_timeout_ms(STREAM_TIMEOUT.as_millis() as u64);
            let session = Arc::clone(&self);
            let line_sid = sid.clone();
            let mut line_order: SeqBuffer<RelayLine> = SeqBuffer::starting_at(1);
            let mut line_parser = SseParser::new();
            let chunk_session = Arc::clone(&self);
            let chunk_sid = sid.clone();
            let mut chunk_order: SeqBuffer<bytes::Bytes> = SeqBuffer::starting_at(1);
            let mut chunk_parser = SseParser::new();
            let handlers = StreamHandlers {
                on_lines: Some(Box::new(move |batch: Vec<RelayLine>| {
                    for line in batch {
                        for ready in line_order.push(line.seq, line) {
                            line_parser.push_line(&ready.line, &mut |v| {
                                session.handle_event(&line_sid, v)
                            });
                        }
                    }
                })),
                on_chunk: Some(Box::new(move |seq, bytes| {
                    for ready in chunk_order.push(seq, bytes) {
                        chunk_parser.push(&ready, &mut |v| {
                            chunk_session.handle_event(&chunk_sid, v)
                        });
                    }
                })),
                ..Default::default()
            };
            self.mux
                .send_stream(&self.cfg.relay, req, handlers, STREAM_TIMEOUT)
                .await
                .map(|_| ())
        } else {
            let mut parser = SseParser::new();
            let session = Arc::clone(&self);
            let stream_sid = sid.clone();
            self.mux
                .stream_http(&url, &self.cfg.api_key, None, STREAM_TIMEOUT, |bytes| {
                    parser.push(&bytes, &mut |v| session.handle_event(&stream_sid, v));
                })
                .await
        };

        if let Err(e) = result {
            if !self.stopped() {
                debug!(node = %self.node, %sid, "event stream closed: {e}");
            }
        }
    }

    /// Process one recognition event for session `task_sid`.
    fn handle_event(&self, task_sid: &str, value: Value) {
        if self.stopped() {
            return;
        }
        // Only the current session's events are honored.
        if let Some(event_sid) = sse::event_sid(&value) {
            if event_sid != task_sid {
                return;
            }
        }
        if self.sid.lock().unwrap().as_deref() != Some(task_sid) {
            return;
        }

        match parse_event(&value) {
            Some(AsrEvent::Partial { text }) => {
                if self.finalizing.load(Ordering::Relaxed)
                    || !self.uplink_open.load(Ordering::Relaxed)
                    || self.vad_silent.load(Ordering::Relaxed)
                    || self.cfg.suppress_partials
                {
                    return;
                }
                let now = self.clock.now();
                *self.partial_text.lock().unwrap() = text.clone();
                *self.last_partial_at.lock().unwrap() = Some(now);
                self.route_partial(&text);
                let phrase = self.phrase.lock().unwrap().on_partial(&text, now);
                if let Some(p) = phrase {
                    self.route_phrase(&p);
                }
            }
            Some(AsrEvent::Detected { text }) => {
                if !text.trim().is_empty()
                    && !is_hallucinated_final(
                        &text,
                        self.speech_observed.load(Ordering::Relaxed),
                        self.vad_silent.load(Ordering::Relaxed),
                        &FinalMeta::default(),
                    )
                {
                    self.route_phrase(&text);
                }
            }
            Some(AsrEvent::Final { text, meta }) => {
                self.try_route_final(&text, &meta);
            }
            None => {}
        }
    }

    // ---- audio path ---------------------------------------------------

    /// Drive the capture stream: VAD, pre-roll, uplink buffering, tail
    /// deadline, and (batch mode) utterance accumulation.
    async fn run_capture(self: Arc<Self>, mut stream: CaptureStream) {
        let mut vad = Vad::new(VadConfig {
            on_threshold: self.cfg.rms_threshold,
            hold_ms: self.cfg.hold_ms,
            ema_ms: self.cfg.ema_ms as f64,
        });
        let preroll_cap = (self.cfg.rate as u64 * self.cfg.pre_ms / 1000) as usize;
        let mut preroll: VecDeque<f32> = VecDeque::with_capacity(preroll_cap);
        let mut tail_deadline: Option<Instant> = None;
        let mut utterance: Vec<f32> = Vec::new();

        while !self.stopped() {
            let Some(frame) = stream.frames.recv().await else {
                break;
            };
            let mono = downmix_mono(&frame, stream.channels);
            let samples = resample_linear(&mono, stream.rate, self.cfg.rate);
            if samples.is_empty() {
                continue;
            }
            let dt_ms = samples.len() as f64 * 1000.0 / self.cfg.rate as f64;
            let level = rms(&samples);
            let now = self.clock.now();
            let edge = vad.update(level, dt_ms, now);
            self.vad_silent
                .store(vad.state() == VadState::Silence, Ordering::Relaxed);

            if edge == Some(VadEdge::VoiceStart) {
                self.speech_observed.store(true, Ordering::Relaxed);
                let pre: Vec<f32> = preroll.drain(..).collect();
                if self.cfg.live {
                    self.uplink_open.store(true, Ordering::Relaxed);
                    self.buffer.lock().unwrap().extend(pre);
                } else {
                    utterance.extend(pre);
                }
                tail_deadline = Some(now + self.cfg.tail());
            }

            match vad.state() {
                VadState::Voice => {
                    if self.cfg.live {
                        self.buffer.lock().unwrap().extend_from_slice(&samples);
                    } else {
                        utterance.extend_from_slice(&samples);
                    }
                    if vad.above_off() {
                        tail_deadline = Some(now + self.cfg.tail());
                    }
                }
                VadState::Silence => {
                    for s in samples {
                        if preroll.len() == preroll_cap && preroll_cap > 0 {
                            preroll.pop_front();
                        }
                        preroll.push_back(s);
                    }
                }
            }

            if edge == Some(VadEdge::VoiceEnd) && !self.cfg.live && !utterance.is_empty() {
                let clip = std::mem::take(&mut utterance);
                let session = Arc::clone(&self);
                let handle = tokio::spawn(async move {
                    session.batch_recognize(clip).await;
                });
                self.track(handle);
            }

            if self.cfg.live
                && self.uplink_open.load(Ordering::Relaxed)
                && vad.state() == VadState::Silence
            {
                if let Some(deadline) = tail_deadline {
                    if now > deadline {
                        self.uplink_open.store(false, Ordering::Relaxed);
                        tail_deadline = None;
                        if let Some(sid) = self.sid.lock().unwrap().clone() {
                            let session = Arc::clone(&self);
                            let handle = tokio::spawn(async move {
                                session.drain_and_end(sid).await;
                            });
                            self.track(handle);
                        }
                    }
                }
            }
        }
    }

    /// Pace PCM frames to the session with a bounded in-flight window.
    async fn pump_loop(self: Arc<Self>) {
        let frame_len = (self.cfg.rate as u64 * self.cfg.chunk_ms / 1000) as usize;
        let wait = Duration::from_millis(10u64.max(self.cfg.chunk_ms / 2));

        while !self.stopped() {
            tokio::time::sleep(wait).await;

            // Phrase stability rides the pump cadence.
            let now = self.clock.now();
            let phrase = self.phrase.lock().unwrap().tick(now);
            if let Some(p) = phrase {
                self.route_phrase(&p);
            }

            let chunk: Option<Vec<f32>> = {
                let mut buf = self.buffer.lock().unwrap();
                if buf.len() >= frame_len && frame_len > 0 {
                    Some(buf.drain(..frame_len).collect())
                } else if !self.uplink_open.load(Ordering::Relaxed) && !buf.is_empty() {
                    Some(buf.drain(..).collect())
                } else {
                    None
                }
            };
            let Some(chunk) = chunk else {
                continue;
            };

            let sid = match self.ensure_sid().await {
                Ok(sid) => sid,
                Err(e) => {
                    warn!(node = %self.node, "cannot open recognition session: {e:#}");
                    self.buffer.lock().unwrap().clear();
                    continue;
                }
            };

            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let url = format!(
                "{}/recognize/stream/{}/audio?format=pcm16&sr={}",
                self.cfg.base.trim_end_matches('/'),
                sid,
                self.cfg.rate
            );
            let body = f32_to_pcm16le(&chunk);
            let session = Arc::clone(&self);
            self.inflight.fetch_add(1, Ordering::Relaxed);
            // Frame posts are short-lived; the permit bounds them, so they
            // are not tracked for abort.
            tokio::spawn(async move {
                let _permit = permit;
                let result = session
                    .mux
                    .post_binary(
                        &url,
                        body,
                        &session.cfg.api_key,
                        session.cfg.use_relay,
                        &session.cfg.relay,
                        POST_TIMEOUT,
                    )
                    .await;
                *session.last_post_at.lock().unwrap() = Some(session.clock.now());
                session.inflight.fetch_sub(1, Ordering::Relaxed);
                if let Err(e) = result {
                    debug!(node = %session.node, "audio frame post failed: {e}");
                }
            });
        }
    }

    /// Wait for quiescence, then end the session and emit any leftover text.
    async fn drain_and_end(self: Arc<Self>, sid: String) {
        let started = self.clock.now();
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.stopped() {
                break;
            }
            let now = self.clock.now();
            let hard = now.duration_since(started).as_millis() as u64 >= FORCE_QUIET_MAX_MS;
            let drained = self.inflight.load(Ordering::Relaxed) == 0
                && self.buffer.lock().unwrap().is_empty();
            let quiet = |slot: &Mutex<Option<Instant>>| {
                slot.lock()
                    .unwrap()
                    .map(|at| now.duration_since(at).as_millis() as u64 >= LINGER_MS)
                    .unwrap_or(true)
            };
            if (drained && quiet(&self.last_post_at) && quiet(&self.last_partial_at)) || hard {
                break;
            }
        }

        self.finalizing.store(true, Ordering::Relaxed);
        let path = format!("/recognize/stream/{sid}/end");
        if let Err(e) = self
            .mux
            .post_json(
                &self.cfg.base,
                &path,
                json!({}),
                &self.cfg.api_key,
                self.cfg.use_relay,
                &self.cfg.relay,
                END_TIMEOUT,
            )
            .await
        {
            warn!(node = %self.node, %sid, "session end failed: {e}");
        }

        // No final arrived but a partial did: emit it rather than lose the
        // utterance.
        let leftover = {
            let finals_empty = self.finals.lock().unwrap().is_empty();
            let partial = self.partial_text.lock().unwrap().clone();
            if finals_empty && !partial.trim().is_empty() {
                Some(partial)
            } else {
                None
            }
        };
        if let Some(text) = leftover {
            self.try_route_final(&text, &FinalMeta::default());
        }

        // Reset per-session state; the next utterance starts a new sid.
        {
            let mut slot = self.sid.lock().unwrap();
            if slot.as_deref() == Some(sid.as_str()) {
                *slot = None;
            }
        }
        self.partial_text.lock().unwrap().clear();
        self.finals.lock().unwrap().clear();
        self.phrase.lock().unwrap().reset();
        self.speech_observed.store(false, Ordering::Relaxed);
        self.finalizing.store(false, Ordering::Relaxed);
    }

    /// Batch mode: one-shot recognition of the whole utterance as WAV.
    async fn batch_recognize(self: Arc<Self>, samples: Vec<f32>) {
        let wav = match encode_wav_pcm16(&samples, self.cfg.rate) {
            Ok(w) => w,
            Err(e) => {
                warn!(node = %self.node, "wav encode failed: {e:#}");
                return;
            }
        };
        let mut body = json!({
            "audio_b64": base64::engine::general_purpose::STANDARD.encode(&wav),
            "sr": self.cfg.rate,
        });
        if !self.cfg.model.is_empty() {
            body["model"] = Value::String(self.cfg.model.clone());
        }

        match self
            .mux
            .post_json(
                &self.cfg.base,
                "/recognize",
                body,
                &self.cfg.api_key,
                self.cfg.use_relay,
                &self.cfg.relay,
                POST_TIMEOUT,
            )
            .await
        {
            Ok(response) => {
                let text = response
                    .get("text")
                    .or_else(|| response.get("transcript"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                self.try_route_final(&text, &FinalMeta::from_value(&response));
            }
            Err(e) => warn!(node = %self.node, "batch recognition failed: {e}"),
        }
    }
}

struct ActiveCapture {
    node: String,
    session: Arc<Session>,
}

/// The controller. Owns the single microphone slot.
pub struct AsrController {
    router: Arc<Router>,
    mux: Arc<TransportMux>,
    store: NodeStore,
    clock: Arc<dyn Clock>,
    active: Mutex<Option<ActiveCapture>>,
}

impl AsrController {
    pub fn new(
        router: Arc<Router>,
        mux: Arc<TransportMux>,
        store: NodeStore,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            mux,
            store,
            clock,
            active: Mutex::new(None),
        })
    }

    /// Node currently holding the microphone.
    pub fn owner(&self) -> Option<String> {
        self.active.lock().unwrap().as_ref().map(|a| a.node.clone())
    }

    /// Start capturing for `node_id`, stopping any prior owner first.
    pub fn start(self: &Arc<Self>, node_id: &str, mic: &dyn CaptureSource) -> Result<()> {
        self.stop();

        let cfg = AsrConfig::from_store(&self.store, node_id);
        if cfg.base.is_empty() {
            anyhow::bail!("asr node has no base url configured");
        }
        let stream = mic.open().context("opening capture stream")?;

        let session = Session::new(
            node_id,
            cfg,
            Arc::clone(&self.router),
            Arc::clone(&self.mux),
            Arc::clone(&self.clock),
        );

        let capture = Arc::clone(&session);
        session.track(tokio::spawn(async move {
            capture.run_capture(stream).await;
        }));
        if session.cfg.live {
            let pump = Arc::clone(&session);
            session.track(tokio::spawn(async move {
                pump.pump_loop().await;
            }));
        }

        *self.active.lock().unwrap() = Some(ActiveCapture {
            node: node_id.to_string(),
            session,
        });
        Ok(())
    }

    /// Stop the current owner, if any. Guards flip first so in-flight
    /// callbacks become no-ops, then the tasks are torn down.
    pub fn stop(&self) {
        if let Some(active) = self.active.lock().unwrap().take() {
            active.session.shutdown();
        }
    }
}
