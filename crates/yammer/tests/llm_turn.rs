//! A full LLM turn over the relay: NDJSON lines arrive permuted, deltas are
//! sentence-muxed onto the output ports, and the memory window persists.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;

use common::{wait_for, FakeFactory, FakeHub};
use yammer::llm::LlmController;
use yammer::router::{PortAddress, Router};
use yammer::store::{GraphConfig, MemoryKv, NodeKind, NodeStore, TransportKind};
use yammer::transport::TransportMux;
use yammer::Message;

const PEER: &str = "relay.llm";
const US: &str = "graph.llm-client";

#[tokio::test]
async fn relay_streamed_turn_produces_sentences_and_memory() {
    let hub = FakeHub::new();

    // Scripted relay peer: answers /api/chat with out-of-order NDJSON lines.
    let mut peer_rx = hub.register(PEER);
    let peer_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        while let Some(dm) = peer_rx.recv().await {
            let req = &dm.payload;
            assert_eq!(req["event"], "http.request");
            assert!(req["req"]["url"].as_str().unwrap().ends_with("/api/chat"));
            assert_eq!(req["req"]["headers"]["X-Relay-Stream"], "chunks");
            // The message build put the user text last.
            let messages = req["req"]["json"]["messages"].as_array().unwrap();
            assert_eq!(messages.last().unwrap()["role"], "user");

            let id = req["id"].as_str().unwrap();
            let line = |seq: u64, line: &str| {
                json!({"event": "relay.response.lines", "id": id, "lines": [
                    {"seq": seq, "ts": seq, "line": line},
                ]})
            };
            for frame in [
                json!({"event": "relay.response.begin", "id": id, "ok": true, "status": 200, "headers": {}}),
                line(2, "{\"message\":{\"content\":\" world. Over</s>\"}}"),
                line(1, "{\"message\":{\"content\":\"Hello\"}}"),
                line(3, "{\"done\":true}"),
                json!({"event": "relay.response.end", "id": id, "ok": true, "lines": 3}),
            ] {
                peer_hub.deliver(PEER, &dm.from, frame).await;
            }
        }
    });

    let router = Arc::new(Router::new());
    let store = NodeStore::new(Arc::new(MemoryKv::new()));
    let mux = TransportMux::new(store.kv().clone(), FakeFactory::new(Arc::clone(&hub), US));

    // Graph runs over the relay; the node is bound to the peer address.
    let mut graph_cfg: GraphConfig = store.graph_config();
    graph_cfg.transport = TransportKind::Relay;
    store.save_graph_config(&graph_cfg);
    store.ensure("llm-1", NodeKind::Llm);
    store.update(
        "llm-1",
        json!({"base": "http://llm:11434", "relay": PEER})
            .as_object()
            .cloned()
            .unwrap(),
    );

    let ctl = LlmController::new(router.clone(), mux, store.clone());
    ctl.attach("llm-1");

    // Collect the three output ports.
    let finals: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let deltas: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let memory_events: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    for (port, sink) in [("final", finals.clone()), ("delta", deltas.clone())] {
        let collector = format!("sink-{port}");
        router.register(
            PortAddress::input(&collector, "in"),
            Arc::new(move |msg: &Message| {
                sink.lock().unwrap().push(msg.display_text());
                Ok(())
            }),
        );
        router
            .add_wire(
                PortAddress::output("llm-1", port),
                PortAddress::input(&collector, "in"),
            )
            .unwrap();
    }
    let mem_sink = memory_events.clone();
    router.register(
        PortAddress::input("sink-memory", "in"),
        Arc::new(move |msg: &Message| {
            mem_sink.lock().unwrap().push(msg.clone());
            Ok(())
        }),
    );
    router
        .add_wire(
            PortAddress::output("llm-1", "memory"),
            PortAddress::input("sink-memory", "in"),
        )
        .unwrap();

    // The prompt arrives through the router, like any other wire.
    router
        .add_wire(
            PortAddress::output("in-1", "text"),
            PortAddress::input("llm-1", "prompt"),
        )
        .unwrap();
    router.send_from("in-1", "text", Message::text("in-1", "greet me"));

    wait_for(
        || memory_events.lock().unwrap().len() == 1,
        "turn completion (memory update)",
    )
    .await;

    // Reordered lines produced in-order sentences; the terminator was
    // stripped literally.
    assert_eq!(
        finals.lock().unwrap().as_slice(),
        ["Hello world.", "Over"]
    );
    assert_eq!(deltas.lock().unwrap().as_slice(), ["Hello world.", "Over"]);

    // Memory persisted: user turn plus assistant reply.
    let record = store.load("llm-1").unwrap();
    let memory = record.config.get("memory").unwrap().as_array().unwrap();
    assert_eq!(memory.len(), 2);
    assert_eq!(memory[0]["role"], "user");
    assert_eq!(memory[0]["content"], "greet me");
    assert_eq!(memory[1]["role"], "assistant");
    assert_eq!(memory[1]["content"], "Hello world. Over");

    let announced = &memory_events.lock().unwrap()[0];
    assert_eq!(announced.value()["type"], "updated");
    assert_eq!(announced.value()["size"], 2);
}
