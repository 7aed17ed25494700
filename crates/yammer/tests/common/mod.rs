//! Shared test fixtures: an in-memory datagram hub standing in for the
//! relay overlay, plus factories wired to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use yammer::transport::{DatagramRelay, DmOptions, InboundDm, RelayFactory};

/// An in-memory datagram network. Every connected address gets an inbox;
/// sends are delivered immediately, with an optional per-hub tap for
/// assertions.
pub struct FakeHub {
    inboxes: Mutex<HashMap<String, mpsc::Sender<InboundDm>>>,
    sent: Mutex<Vec<(String, String, Value)>>,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn register(self: &Arc<Self>, addr: &str) -> mpsc::Receiver<InboundDm> {
        let (tx, rx) = mpsc::channel(256);
        self.inboxes.lock().unwrap().insert(addr.to_string(), tx);
        rx
    }

    pub async fn deliver(&self, from: &str, to: &str, payload: Value) {
        self.sent
            .lock()
            .unwrap()
            .push((from.to_string(), to.to_string(), payload.clone()));
        let tx = self.inboxes.lock().unwrap().get(to).cloned();
        if let Some(tx) = tx {
            let _ = tx
                .send(InboundDm {
                    from: from.to_string(),
                    payload,
                })
                .await;
        }
    }

    pub fn sent_log(&self) -> Vec<(String, String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

/// One endpoint on the hub.
pub struct FakeRelay {
    pub addr: String,
    pub hub: Arc<FakeHub>,
}

#[async_trait::async_trait]
impl DatagramRelay for FakeRelay {
    fn address(&self) -> String {
        self.addr.clone()
    }

    fn seed(&self) -> Option<Value> {
        Some(json!(format!("seed-{}", self.addr)))
    }

    async fn send(&self, to: &str, payload: Value, _opts: DmOptions) -> Result<()> {
        self.hub.deliver(&self.addr, to, payload).await;
        Ok(())
    }
}

/// Factory producing one endpoint at a fixed address. Set `fail_with_seed`
/// to make the first (seeded) connect fail, exercising the retry-fresh path.
pub struct FakeFactory {
    pub hub: Arc<FakeHub>,
    pub addr: String,
    pub fail_with_seed: bool,
}

impl FakeFactory {
    pub fn new(hub: Arc<FakeHub>, addr: &str) -> Arc<Self> {
        Arc::new(Self {
            hub,
            addr: addr.to_string(),
            fail_with_seed: false,
        })
    }
}

#[async_trait::async_trait]
impl RelayFactory for FakeFactory {
    async fn connect(
        &self,
        seed: Option<Value>,
    ) -> Result<(Arc<dyn DatagramRelay>, mpsc::Receiver<InboundDm>)> {
        if self.fail_with_seed && seed.is_some() {
            anyhow::bail!("seed rejected");
        }
        let rx = self.hub.register(&self.addr);
        let relay: Arc<dyn DatagramRelay> = Arc::new(FakeRelay {
            addr: self.addr.clone(),
            hub: Arc::clone(&self.hub),
        });
        Ok((relay, rx))
    }
}

/// Poll until `check` passes or the deadline hits.
pub async fn wait_for(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
