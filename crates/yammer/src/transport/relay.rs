//! Datagram relay client abstraction and the inbound dispatcher.
//!
//! One relay client exists per process. A single pump task drains its
//! inbound datagrams: `relay.response*` frames resolve pending requests and
//! feed stream handler entries; everything else (peer DM envelopes) is
//! re-broadcast for the peer controller. Stream `end` frames linger briefly
//! before closing so stragglers that were reordered in flight still reach
//! the handlers; a timed-out stream is gone for good and cannot be
//! resurrected by a late linger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use yammerproto::relay::{BeginBody, EndBody, RelayLine, RelayReply, RequestFrame, ResponseBody};
use yammerproto::RelayHttpRequest;

use super::TransportError;

/// Default linger after an `end` frame before the stream closes.
pub const LINGER_END: Duration = Duration::from_millis(150);

/// Hold hint passed with `http.request` datagrams so the relay keeps trying
/// to deliver the eventual response while we are slow to ack.
pub const REQUEST_HOLD_MS: u64 = 120_000;

/// Send options for a datagram.
#[derive(Debug, Clone, Default)]
pub struct DmOptions {
    /// Fire-and-forget: the response, if any, arrives on the message channel.
    pub no_reply: bool,
    /// How long the transport should retry delivery, in milliseconds.
    pub hold_ms: Option<u64>,
}

impl DmOptions {
    pub fn fire_and_forget() -> Self {
        Self {
            no_reply: true,
            hold_ms: Some(REQUEST_HOLD_MS),
        }
    }
}

/// An inbound datagram.
#[derive(Debug, Clone)]
pub struct InboundDm {
    pub from: String,
    pub payload: Value,
}

/// The datagram transport itself. Implementations wrap whatever overlay the
/// embedder ships; tests use a channel-backed fake.
#[async_trait::async_trait]
pub trait DatagramRelay: Send + Sync {
    /// Our address on the overlay.
    fn address(&self) -> String;

    /// The client's identity seed (string or byte array), for persistence.
    fn seed(&self) -> Option<Value>;

    async fn send(&self, to: &str, payload: Value, opts: DmOptions) -> Result<()>;
}

/// Creates relay clients, optionally from a persisted seed.
#[async_trait::async_trait]
pub trait RelayFactory: Send + Sync {
    async fn connect(
        &self,
        seed: Option<Value>,
    ) -> Result<(Arc<dyn DatagramRelay>, mpsc::Receiver<InboundDm>)>;
}

/// Factory for graphs that only ever use direct HTTP; `ensure_relay` fails
/// cleanly instead of hanging.
pub struct NoRelayFactory;

#[async_trait::async_trait]
impl RelayFactory for NoRelayFactory {
    async fn connect(
        &self,
        _seed: Option<Value>,
    ) -> Result<(Arc<dyn DatagramRelay>, mpsc::Receiver<InboundDm>)> {
        anyhow::bail!("no relay transport configured")
    }
}

/// Callbacks for one logical response stream. Handlers run on the dispatcher
/// task and must not call back into the link.
#[derive(Default)]
pub struct StreamHandlers {
    pub on_begin: Option<Box<dyn FnMut(&BeginBody) + Send>>,
    pub on_chunk: Option<Box<dyn FnMut(u64, Bytes) + Send>>,
    pub on_lines: Option<Box<dyn FnMut(Vec<RelayLine>) + Send>>,
    pub on_end: Option<Box<dyn FnOnce(&EndBody) + Send>>,
}

struct StreamEntry {
    handlers: StreamHandlers,
    done: Option<oneshot::Sender<EndBody>>,
    ended: bool,
}

/// The per-process relay connection plus its request/stream dispatcher.
pub struct RelayLink {
    client: Arc<dyn DatagramRelay>,
    pend: Mutex<HashMap<String, oneshot::Sender<Result<ResponseBody, TransportError>>>>,
    streams: Arc<Mutex<HashMap<String, StreamEntry>>>,
    dm_events: broadcast::Sender<InboundDm>,
    linger_end: Duration,
}

impl RelayLink {
    pub fn new(client: Arc<dyn DatagramRelay>) -> Arc<Self> {
        let (dm_events, _) = broadcast::channel(256);
        Arc::new(Self {
            client,
            pend: Mutex::new(HashMap::new()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            dm_events,
            linger_end: LINGER_END,
        })
    }

    /// Our overlay address.
    pub fn address(&self) -> String {
        self.client.address()
    }

    /// Non-relay datagrams (peer DM envelopes and friends).
    pub fn subscribe_dms(&self) -> broadcast::Receiver<InboundDm> {
        self.dm_events.subscribe()
    }

    /// Raw datagram send, for the peer DM overlay.
    pub async fn send_dm(&self, to: &str, payload: Value, opts: DmOptions) -> Result<(), TransportError> {
        self.client
            .send(to, payload, opts)
            .await
            .map_err(|e| TransportError::Relay(e.to_string()))
    }

    /// Start the pump draining inbound datagrams.
    pub fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<InboundDm>) {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(dm) = rx.recv().await {
                link.handle(dm);
            }
            debug!("relay message channel closed");
        });
    }

    fn handle(self: &Arc<Self>, dm: InboundDm) {
        let reply = match RelayReply::parse(&dm.payload) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                let _ = self.dm_events.send(dm);
                return;
            }
            Err(e) => {
                warn!("dropping malformed relay frame: {e}");
                return;
            }
        };

        match reply {
            RelayReply::Response(body) => {
                let waiter = self.pend.lock().unwrap().remove(&body.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(body));
                    }
                    None => debug!(id = %body.id, "response for unknown request"),
                }
            }
            RelayReply::Redirect(redirect) => {
                let target = redirect
                    .addr
                    .clone()
                    .or(redirect.node.clone())
                    .unwrap_or_else(|| "unknown".into());
                let err = TransportError::Redirected {
                    service: redirect.service.clone().unwrap_or_default(),
                    target,
                };
                if let Some(tx) = self.pend.lock().unwrap().remove(&redirect.id) {
                    let _ = tx.send(Err(err));
                } else {
                    self.finish_stream(&redirect.id, EndBody {
                        id: redirect.id.clone(),
                        ok: false,
                        error: Some(err.to_string()),
                        ..Default::default()
                    });
                }
            }
            RelayReply::Begin(body) => {
                let mut streams = self.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(&body.id) {
                    if let Some(cb) = entry.handlers.on_begin.as_mut() {
                        cb(&body);
                    }
                }
            }
            RelayReply::Chunk(chunk) => {
                let bytes = match chunk.decode() {
                    Ok(b) => Bytes::from(b),
                    Err(e) => {
                        warn!(id = %chunk.id, "undecodable chunk: {e}");
                        return;
                    }
                };
                let mut streams = self.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(&chunk.id) {
                    if let Some(cb) = entry.handlers.on_chunk.as_mut() {
                        cb(chunk.seq, bytes);
                    }
                }
            }
            RelayReply::Lines(batch) => {
                let mut streams = self.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(&batch.id) {
                    if let Some(cb) = entry.handlers.on_lines.as_mut() {
                        cb(batch.lines);
                    }
                }
            }
            RelayReply::Keepalive { id, .. } => {
                debug!(%id, "stream keepalive");
            }
            RelayReply::End(body) => {
                let id = body.id.clone();
                let should_linger = {
                    let mut streams = self.streams.lock().unwrap();
                    match streams.get_mut(&id) {
                        Some(entry) if !entry.ended => {
                            entry.ended = true;
                            true
                        }
                        _ => false,
                    }
                };
                if should_linger {
                    let link = Arc::clone(self);
                    let linger = self.linger_end;
                    tokio::spawn(async move {
                        tokio::time::sleep(linger).await;
                        link.finish_stream(&id, body);
                    });
                }
            }
        }
    }

    /// Close a stream: remove it, fire `on_end`, resolve the waiter. A
    /// no-op if the stream already timed out and was removed.
    fn finish_stream(&self, id: &str, body: EndBody) {
        let entry = self.streams.lock().unwrap().remove(id);
        if let Some(mut entry) = entry {
            if let Some(cb) = entry.handlers.on_end.take() {
                cb(&body);
            }
            if let Some(done) = entry.done.take() {
                let _ = done.send(body);
            }
        }
    }

    /// Send one tunnelled request and wait for its single response.
    pub async fn send_request(
        &self,
        to: &str,
        req: RelayHttpRequest,
        timeout: Duration,
    ) -> Result<ResponseBody, TransportError> {
        let id = yammerproto::correlation_id();
        let (tx, rx) = oneshot::channel();
        self.pend.lock().unwrap().insert(id.clone(), tx);

        let frame = RequestFrame::new(id.clone(), req).to_value();
        if let Err(e) = self.send_dm(to, frame, DmOptions::fire_and_forget()).await {
            self.pend.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Relay("response channel dropped".into())),
            Err(_) => {
                self.pend.lock().unwrap().remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Send a streaming request; resolves when the stream ends. On timeout
    /// the stream entry is torn down so late frames fall on the floor.
    pub async fn send_stream(
        &self,
        to: &str,
        req: RelayHttpRequest,
        handlers: StreamHandlers,
        timeout: Duration,
    ) -> Result<EndBody, TransportError> {
        let id = yammerproto::correlation_id();
        let (done_tx, done_rx) = oneshot::channel();
        self.streams.lock().unwrap().insert(
            id.clone(),
            StreamEntry {
                handlers,
                done: Some(done_tx),
                ended: false,
            },
        );

        let frame = RequestFrame::new(id.clone(), req.streaming()).to_value();
        if let Err(e) = self.send_dm(to, frame, DmOptions::fire_and_forget()).await {
            self.streams.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(end)) => {
                if end.ok {
                    Ok(end)
                } else {
                    Err(TransportError::Relay(
                        end.error.clone().unwrap_or_else(|| "stream failed".into()),
                    ))
                }
            }
            Ok(Err(_)) => Err(TransportError::Relay("stream channel dropped".into())),
            Err(_) => {
                self.streams.lock().unwrap().remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

}
