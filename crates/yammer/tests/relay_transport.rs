//! Relay transport behavior: request correlation, ordered streaming,
//! linger, timeouts, and seed persistence.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use common::{FakeFactory, FakeHub};
use yammer::store::{KvStore, MemoryKv, RELAY_SEED_KEY};
use yammer::transport::{StreamHandlers, TransportMux};
use yammerproto::RelayHttpRequest;

const PEER: &str = "relay.peer";
const US: &str = "graph.client";

fn mux_on(hub: &Arc<FakeHub>) -> (Arc<TransportMux>, Arc<MemoryKv>) {
    let kv = Arc::new(MemoryKv::new());
    let factory = FakeFactory::new(Arc::clone(hub), US);
    (TransportMux::new(kv.clone(), factory), kv)
}

/// A scripted relay peer answering `http.request` frames.
async fn run_peer(hub: Arc<FakeHub>, mut respond: impl FnMut(&Value) -> Vec<Value> + Send + 'static) {
    let mut rx = hub.register(PEER);
    tokio::spawn(async move {
        while let Some(dm) = rx.recv().await {
            for frame in respond(&dm.payload) {
                hub.deliver(PEER, &dm.from, frame).await;
            }
        }
    });
}

#[tokio::test]
async fn single_request_resolves_by_id() {
    let hub = FakeHub::new();
    run_peer(Arc::clone(&hub), |req| {
        let id = req["id"].as_str().unwrap().to_string();
        assert_eq!(req["event"], "http.request");
        assert_eq!(req["req"]["method"], "POST");
        vec![json!({
            "event": "relay.response",
            "id": id,
            "ok": true,
            "status": 200,
            "headers": {"content-type": "application/json"},
            "json": {"answer": 42},
        })]
    })
    .await;

    let (mux, _) = mux_on(&hub);
    let value = mux
        .post_json(
            "http://svc:9",
            "/api/chat",
            json!({"q": 1}),
            "",
            true,
            PEER,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(value["answer"], 42);
}

#[tokio::test]
async fn stream_chunks_reorder_by_seq() {
    let hub = FakeHub::new();
    run_peer(Arc::clone(&hub), |req| {
        let id = req["id"].as_str().unwrap().to_string();
        let chunk = |seq: u64, text: &str| {
            json!({
                "event": "relay.response.chunk",
                "id": id,
                "seq": seq,
                "b64": base64_encode(text.as_bytes()),
            })
        };
        vec![
            json!({"event": "relay.response.begin", "id": id, "ok": true, "status": 200, "headers": {}}),
            chunk(2, "cc"),
            chunk(0, "aa"),
            chunk(1, "bb"),
            chunk(1, "bb-dup"),
            chunk(3, "dd"),
            json!({"event": "relay.response.end", "id": id, "ok": true, "last_seq": 3}),
        ]
    })
    .await;

    let (mux, _) = mux_on(&hub);
    let got: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&got);
    let order = Arc::new(Mutex::new(yammerproto::SeqBuffer::starting_at(0)));
    let handlers = StreamHandlers {
        on_chunk: Some(Box::new(move |seq, bytes| {
            for (s, b) in order.lock().unwrap().push(seq, (seq, bytes.to_vec())) {
                sink.lock().unwrap().push((s, b));
            }
        })),
        ..Default::default()
    };

    let end = mux
        .send_stream(
            PEER,
            RelayHttpRequest::get("http://svc:9/stream"),
            handlers,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(end.last_seq, Some(3));

    let observed = got.lock().unwrap().clone();
    let seqs: Vec<u64> = observed.iter().map(|(s, _)| *s).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    let body: Vec<u8> = observed.into_iter().flat_map(|(_, b)| b).collect();
    assert_eq!(body, b"aabbccdd");
}

#[tokio::test]
async fn stream_lines_and_end_callback() {
    let hub = FakeHub::new();
    run_peer(Arc::clone(&hub), |req| {
        let id = req["id"].as_str().unwrap().to_string();
        vec![
            json!({"event": "relay.response.lines", "id": id, "lines": [
                {"seq": 1, "ts": 1, "line": "{\"a\":1}"},
                {"seq": 2, "ts": 2, "line": "{\"b\":2}"},
            ]}),
            json!({"event": "relay.response.keepalive", "id": id}),
            json!({"event": "relay.response.end", "id": id, "ok": true, "lines": 2}),
        ]
    })
    .await;

    let (mux, _) = mux_on(&hub);
    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let ended: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
    let lines_sink = Arc::clone(&lines);
    let end_sink = Arc::clone(&ended);
    let handlers = StreamHandlers {
        on_lines: Some(Box::new(move |batch| {
            for l in batch {
                lines_sink.lock().unwrap().push(l.line);
            }
        })),
        on_end: Some(Box::new(move |end| {
            assert!(end.ok);
            *end_sink.lock().unwrap() = true;
        })),
        ..Default::default()
    };

    mux.send_stream(
        PEER,
        RelayHttpRequest::get("http://svc:9/events"),
        handlers,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    assert_eq!(lines.lock().unwrap().as_slice(), ["{\"a\":1}", "{\"b\":2}"]);
    assert!(*ended.lock().unwrap());
}

#[tokio::test]
async fn request_timeout_rejects_and_late_response_is_dropped() {
    let hub = FakeHub::new();
    // Peer that never answers.
    run_peer(Arc::clone(&hub), |_| Vec::new()).await;

    let (mux, _) = mux_on(&hub);
    let err = mux
        .post_json(
            "http://svc:9",
            "/x",
            json!({}),
            "",
            true,
            PEER,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[tokio::test]
async fn stream_timeout_is_not_resurrected_by_late_end() {
    let hub = FakeHub::new();
    let late_id: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let capture = Arc::clone(&late_id);
    run_peer(Arc::clone(&hub), move |req| {
        *capture.lock().unwrap() = Some(req["id"].as_str().unwrap().to_string());
        Vec::new()
    })
    .await;

    let (mux, _) = mux_on(&hub);
    let ended: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
    let end_sink = Arc::clone(&ended);
    let handlers = StreamHandlers {
        on_end: Some(Box::new(move |_| {
            *end_sink.lock().unwrap() = true;
        })),
        ..Default::default()
    };
    let err = mux
        .send_stream(
            PEER,
            RelayHttpRequest::get("http://svc:9/stream"),
            handlers,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");

    // A straggler end after the timeout must not fire the dead stream's
    // callback.
    let id = late_id.lock().unwrap().clone().unwrap();
    hub.deliver(PEER, US, json!({"event": "relay.response.end", "id": id, "ok": true}))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!*ended.lock().unwrap());
}

#[tokio::test]
async fn redirect_resolves_as_error() {
    let hub = FakeHub::new();
    run_peer(Arc::clone(&hub), |req| {
        let id = req["id"].as_str().unwrap().to_string();
        vec![json!({
            "event": "relay.redirect",
            "id": id,
            "service": "whisper_asr",
            "addr": "other.relay",
        })]
    })
    .await;

    let (mux, _) = mux_on(&hub);
    let err = mux
        .post_json(
            "http://svc:9",
            "/x",
            json!({}),
            "",
            true,
            PEER,
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("other.relay"), "{err}");
}

#[tokio::test]
async fn relay_seed_is_persisted_after_connect() {
    let hub = FakeHub::new();
    let (mux, kv) = mux_on(&hub);
    mux.ensure_relay().await.unwrap();
    assert_eq!(kv.get(RELAY_SEED_KEY), Some(json!(format!("seed-{US}"))));
}

#[tokio::test]
async fn bad_seed_is_dropped_and_connect_retried() {
    let hub = FakeHub::new();
    let kv = Arc::new(MemoryKv::new());
    kv.put(RELAY_SEED_KEY, json!("stale-seed"));
    let factory = Arc::new(FakeFactory {
        hub: Arc::clone(&hub),
        addr: US.to_string(),
        fail_with_seed: true,
    });
    let mux = TransportMux::new(kv.clone(), factory);

    let link = mux.ensure_relay().await.unwrap();
    assert_eq!(link.address(), US);
    // The stale seed was replaced by the fresh client's seed.
    assert_eq!(kv.get(RELAY_SEED_KEY), Some(json!(format!("seed-{US}"))));
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}
