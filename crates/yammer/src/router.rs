//! Typed port/wire router.
//!
//! Output ports publish, input ports subscribe, and wires are the durable
//! edges between them. Inputs are exclusive (at most one wire in), outputs
//! fan out. Delivery runs against a snapshot of the wire table, so handlers
//! may mutate wires mid-delivery without skipping or duplicating anyone in
//! the current send.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::message::Message;

/// Port direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::In => "in",
            Direction::Out => "out",
        })
    }
}

/// `(nodeId, direction, portName)`, rendered `"<node>:(in|out):<port>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddress {
    pub node: String,
    pub direction: Direction,
    pub port: String,
}

impl PortAddress {
    pub fn input(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            direction: Direction::In,
            port: port.into(),
        }
    }

    pub fn output(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            direction: Direction::Out,
            port: port.into(),
        }
    }
}

impl fmt::Display for PortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node, self.direction, self.port)
    }
}

impl FromStr for PortAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (node, dir, port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(d), Some(p)) if !n.is_empty() && !p.is_empty() => (n, d, p),
            _ => return Err(WireError::BadAddress(s.to_string())),
        };
        let direction = match dir {
            "in" => Direction::In,
            "out" => Direction::Out,
            _ => return Err(WireError::BadAddress(s.to_string())),
        };
        Ok(Self {
            node: node.to_string(),
            direction,
            port: port.to_string(),
        })
    }
}

/// A directed edge from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wire {
    pub from: PortAddress,
    pub to: PortAddress,
}

impl Wire {
    pub fn new(from: PortAddress, to: PortAddress) -> Self {
        Self { from, to }
    }
}

/// Wire table mutation errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WireError {
    #[error("wire source must be an output and target an input")]
    WrongDirection,
    #[error("wire may not connect a node to itself")]
    SelfLoop,
    #[error("malformed port address: {0}")]
    BadAddress(String),
}

/// Wire table change notifications, for the editor surface and persistence.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    WireAdded(Wire),
    WireRemoved(Wire),
}

/// Input handlers receive the message synchronously during delivery; anything
/// async spawns its own task. Errors are logged and never abort delivery to
/// other subscribers.
pub type Handler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Inner {
    handlers: HashMap<PortAddress, Handler>,
    wires: Vec<Wire>,
}

/// The message router.
pub struct Router {
    inner: RwLock<Inner>,
    events: broadcast::Sender<RouterEvent>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Subscribe to wire table changes.
    pub fn events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Attach an input handler. Replaces any prior handler on the address.
    pub fn register(&self, address: PortAddress, handler: Handler) {
        let mut inner = self.inner.write().unwrap();
        inner.handlers.insert(address, handler);
    }

    /// Detach an input handler. Wires pointing at the address stay; delivery
    /// to it becomes a no-op until something re-registers.
    pub fn unregister(&self, address: &PortAddress) {
        let mut inner = self.inner.write().unwrap();
        inner.handlers.remove(address);
    }

    /// Add a wire. Idempotent: an identical wire is a no-op. Adding a second
    /// wire into an occupied input replaces the prior wire and emits a
    /// `WireRemoved` for it.
    pub fn add_wire(&self, from: PortAddress, to: PortAddress) -> Result<(), WireError> {
        if from.direction != Direction::Out || to.direction != Direction::In {
            return Err(WireError::WrongDirection);
        }
        if from.node == to.node {
            return Err(WireError::SelfLoop);
        }
        let wire = Wire::new(from, to);

        let replaced = {
            let mut inner = self.inner.write().unwrap();
            if inner.wires.contains(&wire) {
                return Ok(());
            }
            let replaced = inner
                .wires
                .iter()
                .position(|w| w.to == wire.to)
                .map(|idx| inner.wires.remove(idx));
            inner.wires.push(wire.clone());
            replaced
        };

        if let Some(old) = replaced {
            debug!(input = %old.to, "input rewired, dropping {}", old.from);
            let _ = self.events.send(RouterEvent::WireRemoved(old));
        }
        let _ = self.events.send(RouterEvent::WireAdded(wire));
        Ok(())
    }

    /// Remove a wire if present.
    pub fn remove_wire(&self, from: &PortAddress, to: &PortAddress) {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            inner
                .wires
                .iter()
                .position(|w| &w.from == from && &w.to == to)
                .map(|idx| inner.wires.remove(idx))
        };
        if let Some(wire) = removed {
            let _ = self.events.send(RouterEvent::WireRemoved(wire));
        }
    }

    /// Current wire set, in insertion order.
    pub fn list_wires(&self) -> Vec<Wire> {
        self.inner.read().unwrap().wires.clone()
    }

    /// Replace the whole wire set (graph restore). Invalid wires are skipped.
    pub fn restore_wires(&self, wires: Vec<Wire>) {
        for wire in wires {
            if let Err(e) = self.add_wire(wire.from.clone(), wire.to.clone()) {
                warn!(%wire.from, %wire.to, "skipping restored wire: {e}");
            }
        }
    }

    /// Remove every wire touching a node and its handlers (node teardown).
    pub fn detach_node(&self, node_id: &str) {
        let removed = {
            let mut inner = self.inner.write().unwrap();
            inner.handlers.retain(|addr, _| addr.node != node_id);
            let (gone, keep): (Vec<Wire>, Vec<Wire>) = inner
                .wires
                .drain(..)
                .partition(|w| w.from.node == node_id || w.to.node == node_id);
            inner.wires = keep;
            gone
        };
        for wire in removed {
            let _ = self.events.send(RouterEvent::WireRemoved(wire));
        }
    }

    /// Publish from an output port. Every handler wired to it is invoked in
    /// wire insertion order, against a snapshot taken at entry. Handlers for
    /// torn-down inputs are silent no-ops; handler errors are logged.
    pub fn send_from(&self, node_id: &str, port: &str, message: Message) {
        let targets: Vec<(PortAddress, Option<Handler>)> = {
            let inner = self.inner.read().unwrap();
            inner
                .wires
                .iter()
                .filter(|w| w.from.node == node_id && w.from.port == port)
                .map(|w| (w.to.clone(), inner.handlers.get(&w.to).cloned()))
                .collect()
        };

        for (to, handler) in targets {
            match handler {
                Some(handler) => {
                    if let Err(e) = handler(&message) {
                        warn!(input = %to, "handler failed: {e:#}");
                    }
                }
                None => {
                    // Node may be mid-teardown; nothing to do.
                }
            }
        }
    }
}
