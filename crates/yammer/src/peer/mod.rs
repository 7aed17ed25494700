//! Peer DM controller: directed, authenticated text channels between two
//! graph instances over the datagram transport.
//!
//! Each peer node walks the handshake state machine (idle → pending →
//! accepted/declined), keeps the channel alive with ping/pong heartbeats,
//! and ships text as chunked `data` envelopes reassembled on the far side.
//! Inbound frames are routed to the best node: explicit target component id
//! first, then source address match, then any unassigned/whitelisted/
//! auto-accepting node on the same graph.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use yammerproto::dm::{
    DmEnvelope, DmInbox, DmMeta, HandshakeAction, HeartbeatAction, DEFAULT_CHUNK_BYTES,
    HEARTBEAT_DEFAULT_SECS, HEARTBEAT_MIN_SECS, MISSED_BEATS_CRITICAL, MISSED_BEATS_WARNING,
};
use yammerproto::payload;

use crate::clock::Clock;
use crate::message::Message;
use crate::router::{PortAddress, Router};
use crate::store::{NodeKind, NodeStore};
use crate::transport::{DmOptions, TransportMux};

/// Handshake progress of a peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Pending,
    Accepted,
    Declined,
}

/// Which side initiated, while pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeDirection {
    Idle,
    Outgoing,
    Incoming,
    Accepted,
    Declined,
}

/// Liveness indicator derived from missed heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Online,
    Warning,
    Critical,
}

pub fn indicator_for(missed: u32) -> Indicator {
    if missed >= MISSED_BEATS_CRITICAL {
        Indicator::Critical
    } else if missed >= MISSED_BEATS_WARNING {
        Indicator::Warning
    } else {
        Indicator::Online
    }
}

/// Node configuration snapshot.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub peer_address: String,
    pub auto_accept: bool,
    pub allowed_peers: Vec<String>,
    pub heartbeat: Duration,
    pub chunk_bytes: usize,
}

impl PeerConfig {
    pub fn from_store(store: &NodeStore, node_id: &str) -> Self {
        let record = store.ensure(node_id, NodeKind::PeerDm);
        let cfg = &record.config;
        let secs = cfg
            .get("heartbeat_s")
            .and_then(Value::as_u64)
            .unwrap_or(HEARTBEAT_DEFAULT_SECS)
            .max(HEARTBEAT_MIN_SECS);
        Self {
            peer_address: cfg
                .get("peer_address")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            auto_accept: cfg
                .get("auto_accept")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            allowed_peers: cfg
                .get("allowed_peers")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            heartbeat: Duration::from_secs(secs),
            chunk_bytes: cfg
                .get("chunk_bytes")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_CHUNK_BYTES as u64) as usize,
        }
    }
}

struct PeerNode {
    cfg: PeerConfig,
    handshake: HandshakeState,
    direction: HandshakeDirection,
    peer_address: String,
    remote_component_id: Option<String>,
    last_seen: Option<Instant>,
    missed: u32,
    indicator: Indicator,
    timed_out: bool,
    inbox: DmInbox,
    heartbeat_task: Option<JoinHandle<()>>,
    resend_task: Option<JoinHandle<()>>,
}

impl PeerNode {
    fn new(cfg: PeerConfig) -> Self {
        let peer_address = cfg.peer_address.clone();
        Self {
            cfg,
            handshake: HandshakeState::Idle,
            direction: HandshakeDirection::Idle,
            peer_address,
            remote_component_id: None,
            last_seen: None,
            missed: 0,
            indicator: Indicator::Online,
            timed_out: false,
            inbox: DmInbox::new(),
            heartbeat_task: None,
            resend_task: None,
        }
    }

    fn stop_tasks(&mut self) {
        if let Some(t) = self.heartbeat_task.take() {
            t.abort();
        }
        if let Some(t) = self.resend_task.take() {
            t.abort();
        }
    }

    fn allows(&self, from: &str) -> bool {
        self.cfg.auto_accept || self.cfg.allowed_peers.iter().any(|p| p == from)
    }
}

/// The controller. One instance serves every peer-DM node in the graph.
pub struct PeerDmController {
    router: Arc<Router>,
    mux: Arc<TransportMux>,
    store: NodeStore,
    clock: Arc<dyn Clock>,
    graph_id: String,
    nodes: Mutex<HashMap<String, PeerNode>>,
}

impl PeerDmController {
    pub fn new(
        router: Arc<Router>,
        mux: Arc<TransportMux>,
        store: NodeStore,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let graph_id = store.graph_config().graph_id;
        Arc::new(Self {
            router,
            mux,
            store,
            clock,
            graph_id,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// `<graphId>:<nodeId>`, the addressable target for peer DMs.
    pub fn component_id(&self, node_id: &str) -> String {
        format!("{}:{}", self.graph_id, node_id)
    }

    fn meta_for(&self, node_id: &str, our_address: &str) -> DmMeta {
        DmMeta::new(our_address, self.component_id(node_id), &self.graph_id)
    }

    /// Register the node and its `text` input.
    pub fn attach(self: &Arc<Self>, node_id: &str) {
        let cfg = PeerConfig::from_store(&self.store, node_id);
        self.nodes
            .lock()
            .unwrap()
            .insert(node_id.to_string(), PeerNode::new(cfg));

        let ctl = Arc::clone(self);
        let id = node_id.to_string();
        self.router.register(
            PortAddress::input(node_id, "text"),
            Arc::new(move |msg: &Message| {
                let text = msg.display_text();
                let ctl = Arc::clone(&ctl);
                let id = id.clone();
                tokio::spawn(async move {
                    ctl.send_text(&id, &text).await;
                });
                Ok(())
            }),
        );
    }

    /// Tear a node down, keeping nothing.
    pub fn detach(&self, node_id: &str) {
        self.router.unregister(&PortAddress::input(node_id, "text"));
        if let Some(mut node) = self.nodes.lock().unwrap().remove(node_id) {
            node.stop_tasks();
        }
    }

    /// Start listening for inbound DMs on the relay.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let link = self.mux.ensure_relay().await?;
        let mut rx = link.subscribe_dms();
        let ctl = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(dm) => ctl.handle_dm(&dm.from, dm.payload).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("peer dm listener lagged, dropped {n} frames");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }

    fn status(&self, node_id: &str, level: &str, code: &str, detail: impl Into<String>) {
        self.router
            .send_from(node_id, "status", Message::status(node_id, level, code, detail));
    }

    async fn dm(&self, to: &str, envelope: DmEnvelope) {
        let link = match self.mux.ensure_relay().await {
            Ok(l) => l,
            Err(e) => {
                warn!("relay unavailable for peer dm: {e}");
                return;
            }
        };
        let opts = DmOptions {
            no_reply: true,
            hold_ms: Some(30_000),
        };
        if let Err(e) = link.send_dm(to, envelope.to_value(), opts).await {
            debug!("peer dm send failed: {e}");
        }
    }

    async fn our_address(&self) -> String {
        match self.mux.ensure_relay().await {
            Ok(link) => link.address(),
            Err(_) => String::new(),
        }
    }

    // ---- user-facing operations --------------------------------------

    /// Supply a peer address: sends `handshake(request)` and re-sends on the
    /// heartbeat interval until the peer answers.
    pub async fn connect(self: &Arc<Self>, node_id: &str, peer: &str) {
        if peer.trim().is_empty() {
            self.status(node_id, "error", "missing-peer", "no peer address configured");
            return;
        }
        let our_address = self.our_address().await;
        let interval = {
            let mut nodes = self.nodes.lock().unwrap();
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            node.stop_tasks();
            node.peer_address = peer.to_string();
            node.handshake = HandshakeState::Pending;
            node.direction = HandshakeDirection::Outgoing;
            node.cfg.heartbeat
        };
        self.store.update(
            node_id,
            serde_json::json!({"peer_address": peer})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );

        let request = DmEnvelope::Handshake {
            meta: self.meta_for(node_id, &our_address),
            action: HandshakeAction::Request,
            heartbeat: Some(interval.as_secs()),
        };
        self.dm(peer, request.clone()).await;

        // Re-send the request until the handshake resolves.
        let ctl = Arc::clone(self);
        let id = node_id.to_string();
        let peer = peer.to_string();
        let resend = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let still_pending = {
                    let nodes = ctl.nodes.lock().unwrap();
                    nodes
                        .get(&id)
                        .map(|n| n.handshake == HandshakeState::Pending)
                        .unwrap_or(false)
                };
                if !still_pending {
                    break;
                }
                ctl.dm(&peer, request.clone()).await;
            }
        });
        if let Some(node) = self.nodes.lock().unwrap().get_mut(node_id) {
            node.resend_task = Some(resend);
        }
    }

    /// User approved a pending incoming request.
    pub async fn accept_invite(self: &Arc<Self>, node_id: &str) {
        let peer = {
            let nodes = self.nodes.lock().unwrap();
            match nodes.get(node_id) {
                Some(n)
                    if n.handshake == HandshakeState::Pending
                        && n.direction == HandshakeDirection::Incoming =>
                {
                    n.peer_address.clone()
                }
                _ => return,
            }
        };
        self.accept_peer(node_id, &peer).await;
    }

    /// User declined a pending incoming request.
    pub async fn decline_invite(self: &Arc<Self>, node_id: &str) {
        let peer = {
            let mut nodes = self.nodes.lock().unwrap();
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            node.handshake = HandshakeState::Declined;
            node.direction = HandshakeDirection::Declined;
            node.stop_tasks();
            node.peer_address.clone()
        };
        let our_address = self.our_address().await;
        self.dm(
            &peer,
            DmEnvelope::Handshake {
                meta: self.meta_for(node_id, &our_address),
                action: HandshakeAction::Decline,
                heartbeat: None,
            },
        )
        .await;
        self.status(node_id, "info", "declined", peer);
    }

    /// Drop the session entirely.
    pub fn revoke(&self, node_id: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(node_id) {
            node.stop_tasks();
            node.handshake = HandshakeState::Idle;
            node.direction = HandshakeDirection::Idle;
            node.remote_component_id = None;
            node.last_seen = None;
            node.missed = 0;
            node.timed_out = false;
        }
    }

    /// Current handshake state, for the embedder's indicator.
    pub fn state_of(&self, node_id: &str) -> Option<(HandshakeState, HandshakeDirection, Indicator)> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(node_id)
            .map(|n| (n.handshake, n.direction, n.indicator))
    }

    /// Ship text to the peer as a chunked batch.
    pub async fn send_text(self: &Arc<Self>, node_id: &str, text: &str) {
        let (peer, chunk_bytes, accepted) = {
            let nodes = self.nodes.lock().unwrap();
            match nodes.get(node_id) {
                Some(n) => (
                    n.peer_address.clone(),
                    n.cfg.chunk_bytes,
                    n.handshake == HandshakeState::Accepted,
                ),
                None => return,
            }
        };
        if !accepted {
            self.status(
                node_id,
                "warn",
                "handshake-not-accepted",
                "peer channel not accepted yet",
            );
            return;
        }
        if text.trim().is_empty() {
            self.status(node_id, "warn", "missing-text", "empty dm payload");
            return;
        }

        let our_address = self.our_address().await;
        let mut meta = self.meta_for(node_id, &our_address);
        if let Some(remote) = self
            .nodes
            .lock()
            .unwrap()
            .get(node_id)
            .and_then(|n| n.remote_component_id.clone())
        {
            meta = meta.with_target(remote);
        }
        let batch_id = yammerproto::correlation_id();
        for envelope in yammerproto::dm::split_text(&meta, &batch_id, text, chunk_bytes) {
            self.dm(&peer, envelope).await;
        }
    }

    // ---- inbound -----------------------------------------------------

    /// Handle one inbound datagram (already known not to be a relay reply).
    pub async fn handle_dm(self: &Arc<Self>, from: &str, raw: Value) {
        let hydrated = payload::hydrate(raw);
        let Some(envelope) = DmEnvelope::parse(&hydrated) else {
            self.route_raw(from, &hydrated);
            return;
        };

        match &envelope {
            DmEnvelope::Handshake { action, .. } => {
                self.handle_handshake(from, *action, &envelope).await;
            }
            DmEnvelope::Heartbeat { action, .. } => {
                self.handle_heartbeat(from, *action, &envelope).await;
            }
            DmEnvelope::Data {
                id, seq, total, ..
            } => {
                let text = envelope.data_text().unwrap_or_default();
                self.handle_data(from, &envelope, id, *seq, *total, text);
            }
            DmEnvelope::Debug { action, note, .. } => {
                if let Some(node_id) = self.candidate_for(from, envelope.meta().target_id.as_deref())
                {
                    let detail = note.clone().unwrap_or_else(|| action.clone());
                    self.router.send_from(
                        &node_id,
                        "raw",
                        Message::new(serde_json::json!({
                            "type": "debug",
                            "from": from,
                            "text": detail,
                        })),
                    );
                }
            }
        }
    }

    async fn handle_handshake(
        self: &Arc<Self>,
        from: &str,
        action: HandshakeAction,
        envelope: &DmEnvelope,
    ) {
        let remote_component = envelope.meta().component_id.clone();
        match action {
            HandshakeAction::Request => {
                let target = envelope.meta().target_id.as_deref();
                let Some(node_id) = self.candidate_for(from, target) else {
                    debug!(%from, "handshake request with no candidate node");
                    return;
                };
                let decision = {
                    let mut nodes = self.nodes.lock().unwrap();
                    let Some(node) = nodes.get_mut(&node_id) else {
                        return;
                    };
                    node.remote_component_id = Some(remote_component);
                    match node.handshake {
                        // Re-assertion from an accepted peer: stay accepted.
                        HandshakeState::Accepted if node.peer_address == from => "accept",
                        HandshakeState::Declined => "ignore",
                        _ if node.allows(from) => "accept",
                        _ => {
                            node.handshake = HandshakeState::Pending;
                            node.direction = HandshakeDirection::Incoming;
                            node.peer_address = from.to_string();
                            "invite"
                        }
                    }
                };
                match decision {
                    "accept" => self.accept_peer(&node_id, from).await,
                    "invite" => self.status(&node_id, "info", "invite", from),
                    _ => {}
                }
            }
            HandshakeAction::Accept => {
                let node_id = {
                    let mut nodes = self.nodes.lock().unwrap();
                    let found = nodes.iter_mut().find(|(_, n)| {
                        n.peer_address == from
                            && n.handshake == HandshakeState::Pending
                            && n.direction == HandshakeDirection::Outgoing
                    });
                    match found {
                        Some((id, node)) => {
                            node.handshake = HandshakeState::Accepted;
                            node.direction = HandshakeDirection::Accepted;
                            node.remote_component_id = Some(remote_component);
                            node.last_seen = Some(self.clock.now());
                            node.stop_tasks();
                            Some(id.clone())
                        }
                        None => None,
                    }
                };
                if let Some(node_id) = node_id {
                    self.start_heartbeat(&node_id).await;
                    self.status(&node_id, "info", "accepted", from);
                }
            }
            HandshakeAction::Decline => {
                let declined = {
                    let mut nodes = self.nodes.lock().unwrap();
                    let found = nodes.iter_mut().find(|(_, n)| {
                        n.peer_address == from && n.handshake == HandshakeState::Pending
                    });
                    match found {
                        Some((id, node)) => {
                            node.handshake = HandshakeState::Declined;
                            node.direction = HandshakeDirection::Declined;
                            node.stop_tasks();
                            Some(id.clone())
                        }
                        None => None,
                    }
                };
                if let Some(id) = declined {
                    self.status(&id, "warn", "declined", from);
                }
            }
            HandshakeAction::Sync => {
                let known = {
                    let nodes = self.nodes.lock().unwrap();
                    nodes
                        .iter()
                        .find(|(_, n)| {
                            n.peer_address == from && n.handshake == HandshakeState::Accepted
                        })
                        .map(|(id, _)| id.clone())
                };
                if let Some(node_id) = known {
                    self.accept_peer(&node_id, from).await;
                }
            }
        }
    }

    /// Send accept and (re)start the heartbeat.
    async fn accept_peer(self: &Arc<Self>, node_id: &str, peer: &str) {
        {
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get_mut(node_id) {
                node.handshake = HandshakeState::Accepted;
                node.direction = HandshakeDirection::Accepted;
                node.peer_address = peer.to_string();
                node.last_seen = Some(self.clock.now());
                node.missed = 0;
                node.timed_out = false;
                node.stop_tasks();
            }
        }
        let our_address = self.our_address().await;
        self.dm(
            peer,
            DmEnvelope::Handshake {
                meta: self.meta_for(node_id, &our_address),
                action: HandshakeAction::Accept,
                heartbeat: None,
            },
        )
        .await;
        self.start_heartbeat(node_id).await;
    }

    async fn handle_heartbeat(
        self: &Arc<Self>,
        from: &str,
        action: HeartbeatAction,
        _envelope: &DmEnvelope,
    ) {
        let now = self.clock.now();
        let node_id = {
            let mut nodes = self.nodes.lock().unwrap();
            let found = nodes
                .iter_mut()
                .find(|(_, n)| n.peer_address == from && n.handshake == HandshakeState::Accepted);
            match found {
                Some((id, node)) => {
                    node.last_seen = Some(now);
                    node.missed = 0;
                    node.indicator = Indicator::Online;
                    node.timed_out = false;
                    Some(id.clone())
                }
                None => None,
            }
        };
        // Mirror pings with pongs.
        if action == HeartbeatAction::Ping {
            if let Some(node_id) = node_id {
                let our_address = self.our_address().await;
                self.dm(
                    from,
                    DmEnvelope::Heartbeat {
                        meta: self.meta_for(&node_id, &our_address),
                        action: HeartbeatAction::Pong,
                    },
                )
                .await;
            }
        }
    }

    /// Ping on the configured interval and track missed beats.
    async fn start_heartbeat(self: &Arc<Self>, node_id: &str) {
        let (peer, interval) = {
            let nodes = self.nodes.lock().unwrap();
            match nodes.get(node_id) {
                Some(n) => (n.peer_address.clone(), n.cfg.heartbeat),
                None => return,
            }
        };

        let ctl = Arc::clone(self);
        let id = node_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let now = ctl.clock.now();
                let beat = {
                    let mut nodes = ctl.nodes.lock().unwrap();
                    let Some(node) = nodes.get_mut(&id) else {
                        break;
                    };
                    if node.handshake != HandshakeState::Accepted {
                        break;
                    }
                    let silent_for = node
                        .last_seen
                        .map(|at| now.duration_since(at))
                        .unwrap_or(interval);
                    if silent_for >= interval {
                        node.missed += 1;
                    }
                    node.indicator = indicator_for(node.missed);
                    let timed_out = silent_for > interval * 5;
                    let newly_timed_out = timed_out && !node.timed_out;
                    node.timed_out = timed_out;
                    (node.indicator, newly_timed_out)
                };
                let (indicator, newly_timed_out) = beat;
                if newly_timed_out {
                    // Disconnected, but the session survives until revoke.
                    ctl.status(&id, "error", "timeout", peer.clone());
                } else if indicator == Indicator::Warning {
                    ctl.status(&id, "warn", "heartbeat-missed", peer.clone());
                }
                let our_address = ctl.our_address().await;
                ctl.dm(
                    &peer,
                    DmEnvelope::Heartbeat {
                        meta: ctl.meta_for(&id, &our_address),
                        action: HeartbeatAction::Ping,
                    },
                )
                .await;
            }
        });

        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(node_id) {
            if let Some(old) = node.heartbeat_task.replace(task) {
                old.abort();
            }
        }
    }

    fn handle_data(
        self: &Arc<Self>,
        from: &str,
        envelope: &DmEnvelope,
        batch_id: &str,
        seq: u32,
        total: u32,
        text: String,
    ) {
        let target = envelope.meta().target_id.as_deref();
        let Some(node_id) = self.candidate_for(from, target) else {
            warn!(%from, "peer data with no candidate node");
            for node_id in self.guess_nodes(target) {
                self.status(
                    &node_id,
                    "warn",
                    "no-candidate",
                    format!("unrouted dm from {from}"),
                );
            }
            return;
        };

        let (denied, assembled) = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(&node_id) {
                Some(node) => {
                    if node.handshake != HandshakeState::Accepted && !node.allows(from) {
                        (true, None)
                    } else {
                        node.last_seen = Some(self.clock.now());
                        (false, node.inbox.accept(batch_id, seq, total, text))
                    }
                }
                None => (false, None),
            }
        };
        if denied {
            self.status(&node_id, "warn", "handshake-not-accepted", from);
            return;
        }

        if let Some(text) = assembled {
            self.router.send_from(
                &node_id,
                "incoming",
                Message::new(serde_json::json!({
                    "nodeId": node_id,
                    "type": "text",
                    "text": text,
                    "from": from,
                    "componentId": envelope.meta().component_id,
                    "ts": envelope.meta().ts,
                })),
            );
        }
    }

    fn route_raw(&self, from: &str, value: &Value) {
        if let Some(node_id) = self.candidate_for(from, None) {
            self.router.send_from(
                &node_id,
                "raw",
                Message::new(serde_json::json!({
                    "type": "raw",
                    "from": from,
                    "text": payload::best_text(value)
                        .unwrap_or_else(|| payload::pretty(value)),
                })),
            );
        }
    }

    /// Routing priority: explicit target component id, then source address
    /// match, then (same graph or untargeted) unassigned/whitelisted/
    /// auto-accept nodes.
    fn candidate_for(&self, from: &str, target_id: Option<&str>) -> Option<String> {
        let nodes = self.nodes.lock().unwrap();

        if let Some(target) = target_id {
            for (id, _) in nodes.iter() {
                if self.component_id(id) == target {
                    return Some(id.clone());
                }
            }
            // Targeted at a different graph: not ours.
            if let Some((graph, _)) = target.split_once(':') {
                if graph != self.graph_id {
                    return None;
                }
            }
        }

        for (id, node) in nodes.iter() {
            if !node.peer_address.is_empty() && node.peer_address == from {
                return Some(id.clone());
            }
        }

        for (id, node) in nodes.iter() {
            if node.peer_address.is_empty() || node.allows(from) {
                return Some(id.clone());
            }
        }
        None
    }

    /// Best-guess nodes for the `no-candidate` hint. Heuristic, not a
    /// correctness property.
    fn guess_nodes(&self, target_id: Option<&str>) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .filter(|(id, node)| {
                target_id
                    .map(|t| t.starts_with(&self.graph_id) || self.component_id(id) == t)
                    .unwrap_or(true)
                    || node.peer_address.is_empty()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}
