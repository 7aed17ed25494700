//! ASR live session over the relay: VAD-gated uplink, paced audio posts,
//! SSE event ingest, phrase/final routing, dedup, and finalization.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use common::{wait_for, FakeFactory, FakeHub};
use yammer::asr::AsrController;
use yammer::audio::{CaptureSource, CaptureStream};
use yammer::clock::SystemClock;
use yammer::router::{PortAddress, Router};
use yammer::store::{GraphConfig, MemoryKv, NodeKind, NodeStore, TransportKind};
use yammer::transport::TransportMux;
use yammer::Message;

const PEER: &str = "relay.asr";
const US: &str = "graph.asr-client";

/// Capture source fed by the test.
struct ScriptedMic {
    frames: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
}

impl CaptureSource for ScriptedMic {
    fn open(&self) -> anyhow::Result<CaptureStream> {
        let rx = self
            .frames
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("mic already open"))?;
        Ok(CaptureStream {
            rate: 16_000,
            channels: 1,
            frames: rx,
        })
    }
}

fn sse_line(seq: u64, data: &str) -> serde_json::Value {
    json!({"seq": seq, "ts": seq, "line": format!("data: {data}")})
}

fn blank_line(seq: u64) -> serde_json::Value {
    json!({"seq": seq, "ts": seq, "line": ""})
}

#[tokio::test(flavor = "multi_thread")]
async fn live_session_routes_partials_phrases_and_deduped_finals() {
    let hub = FakeHub::new();

    // Scripted recognition service behind the relay.
    let mut peer_rx = hub.register(PEER);
    let peer_hub = Arc::clone(&hub);
    let audio_posts = Arc::new(Mutex::new(0usize));
    let audio_counter = Arc::clone(&audio_posts);
    tokio::spawn(async move {
        while let Some(dm) = peer_rx.recv().await {
            let req = dm.payload.clone();
            let url = req["req"]["url"].as_str().unwrap_or("").to_string();
            let id = req["id"].as_str().unwrap_or("").to_string();
            let from = dm.from.clone();

            if url.ends_with("/recognize/stream/start") {
                assert_eq!(req["req"]["json"]["temperature"], 0.0);
                assert_eq!(req["req"]["json"]["condition_on_previous_text"], false);
                peer_hub
                    .deliver(PEER, &from, json!({
                        "event": "relay.response", "id": id, "ok": true, "status": 200,
                        "headers": {"content-type": "application/json"},
                        "json": {"sid": "s1"},
                    }))
                    .await;
            } else if url.contains("/audio") {
                assert!(url.contains("format=pcm16"));
                assert!(url.contains("sr=16000"));
                *audio_counter.lock().unwrap() += 1;
                peer_hub
                    .deliver(PEER, &from, json!({
                        "event": "relay.response", "id": id, "ok": true, "status": 200,
                        "headers": {}, "json": {"ok": true},
                    }))
                    .await;
            } else if url.contains("/events") {
                let hub = Arc::clone(&peer_hub);
                tokio::spawn(async move {
                    hub.deliver(PEER, &from, json!({
                        "event": "relay.response.begin", "id": id, "ok": true,
                        "status": 200, "headers": {},
                    }))
                    .await;
                    // Growing partials, then a final, a near-duplicate final,
                    // and the same text again outside the dedup window.
                    let events = [
                        (150u64, sse_line(1, "{\"event\":\"partial\",\"sid\":\"s1\",\"text\":\"hello\"}")),
                        (150, blank_line(2)),
                        (300, sse_line(3, "{\"event\":\"partial\",\"sid\":\"s1\",\"text\":\"hello there\"}")),
                        (300, blank_line(4)),
                        // Leaves room for the 200 ms phrase-stability window
                        // before the final clears the accumulator.
                        (700, sse_line(5, "{\"event\":\"asr.final\",\"sid\":\"s1\",\"text\":\"hello there\"}")),
                        (700, blank_line(6)),
                        (1200, sse_line(7, "{\"event\":\"asr.final\",\"sid\":\"s1\",\"text\":\"hello there\"}")),
                        (1200, blank_line(8)),
                        (2400, sse_line(9, "{\"event\":\"asr.final\",\"sid\":\"s1\",\"text\":\"hello there\"}")),
                        (2400, blank_line(10)),
                    ];
                    let start = tokio::time::Instant::now();
                    for (at_ms, frame) in events {
                        tokio::time::sleep_until(start + Duration::from_millis(at_ms)).await;
                        hub.deliver(PEER, &from, json!({
                            "event": "relay.response.lines", "id": id,
                            "lines": [frame],
                        }))
                        .await;
                    }
                });
            } else if url.ends_with("/recognize/stream/s1/end") {
                peer_hub
                    .deliver(PEER, &from, json!({
                        "event": "relay.response", "id": id, "ok": true, "status": 200,
                        "headers": {}, "json": {"ok": true},
                    }))
                    .await;
            }
        }
    });

    let router = Arc::new(Router::new());
    let store = NodeStore::new(Arc::new(MemoryKv::new()));
    let mux = TransportMux::new(store.kv().clone(), FakeFactory::new(Arc::clone(&hub), US));

    let mut graph_cfg: GraphConfig = store.graph_config();
    graph_cfg.transport = TransportKind::Relay;
    store.save_graph_config(&graph_cfg);
    store.ensure("asr-1", NodeKind::Asr);
    store.update(
        "asr-1",
        json!({
            "base": "http://asr:8126",
            "relay": PEER,
            "chunk_ms": 40,
            "ema_ms": 30,
            "hold_ms": 60,
            "pre_ms": 100,
            "silence_ms": 200,
            "min_tail_ms": 100,
            "phrase_min_words": 2,
            "phrase_stable_ms": 200,
        })
        .as_object()
        .cloned()
        .unwrap(),
    );

    // Collect the three output ports.
    let collect = |port: &str| {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
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
                PortAddress::output("asr-1", port),
                PortAddress::input(&collector, "in"),
            )
            .unwrap();
        seen
    };
    let partials = collect("partial");
    let phrases = collect("phrase");
    let finals = collect("final");

    let (frames_tx, frames_rx) = mpsc::channel(64);
    let mic = ScriptedMic {
        frames: Mutex::new(Some(frames_rx)),
    };

    let ctl = AsrController::new(
        router.clone(),
        mux,
        store.clone(),
        Arc::new(SystemClock),
    );
    ctl.start("asr-1", &mic).unwrap();
    assert_eq!(ctl.owner().as_deref(), Some("asr-1"));

    // 2.6 s of speech-level audio in 40 ms frames, then a second of silence.
    let loud: Vec<f32> = vec![0.05; 640];
    let quiet: Vec<f32> = vec![0.0; 640];
    for _ in 0..65 {
        frames_tx.send(loud.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    for _ in 0..25 {
        frames_tx.send(quiet.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    // Finals: the duplicate inside the 1500 ms window was dropped, the one
    // outside it was routed.
    wait_for(
        || finals.lock().unwrap().len() >= 2,
        "two deduped finals",
    )
    .await;
    assert_eq!(
        finals.lock().unwrap().as_slice(),
        ["hello there", "hello there"]
    );

    // Partials flowed while the uplink was open.
    assert!(partials.lock().unwrap().len() >= 2);
    assert_eq!(partials.lock().unwrap()[0], "hello");

    // The phrase detector saw the growing partial.
    assert!(!phrases.lock().unwrap().is_empty());

    // Audio was paced to the session, and the session was finalized.
    assert!(*audio_posts.lock().unwrap() > 1);
    wait_for(
        || {
            hub.sent_log().iter().any(|(_, _, v)| {
                v["req"]["url"]
                    .as_str()
                    .map(|u| u.ends_with("/recognize/stream/s1/end"))
                    .unwrap_or(false)
            })
        },
        "session end request",
    )
    .await;

    ctl.stop();
    assert!(ctl.owner().is_none());
}
