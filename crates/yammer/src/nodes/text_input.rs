//! Text input node: the user's typed text enters the graph here.

use std::sync::Arc;

use crate::message::Message;
use crate::router::Router;
use crate::store::{NodeKind, NodeStore};

/// A trivial producer. The embedding UI calls [`TextInput::send`] when the
/// user submits a line; it fans out through the node's `text` output.
pub struct TextInput {
    router: Arc<Router>,
}

impl TextInput {
    pub fn new(router: Arc<Router>, store: &NodeStore, node_id: &str) -> Self {
        store.ensure(node_id, NodeKind::TextInput);
        Self { router }
    }

    pub fn send(&self, node_id: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.router
            .send_from(node_id, "text", Message::text(node_id, text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::PortAddress;
    use crate::store::MemoryKv;
    use std::sync::Mutex;

    #[test]
    fn typed_text_fans_out() {
        let router = Arc::new(Router::new());
        let store = NodeStore::new(Arc::new(MemoryKv::new()));
        let input = TextInput::new(router.clone(), &store, "in-1");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.register(
            PortAddress::input("llm-1", "prompt"),
            Arc::new(move |msg| {
                sink.lock().unwrap().push(msg.display_text());
                Ok(())
            }),
        );
        router
            .add_wire(
                PortAddress::output("in-1", "text"),
                PortAddress::input("llm-1", "prompt"),
            )
            .unwrap();

        input.send("in-1", "hello graph");
        input.send("in-1", "   ");
        assert_eq!(seen.lock().unwrap().as_slice(), ["hello graph"]);
    }
}
