//! Peer DM end-to-end: handshake walks, invites, and chunked text delivery
//! between two graph instances sharing one datagram hub.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;

use common::{wait_for, FakeFactory, FakeHub};
use yammer::clock::SystemClock;
use yammer::peer::{HandshakeDirection, HandshakeState, PeerDmController};
use yammer::router::{PortAddress, Router};
use yammer::store::{MemoryKv, NodeKind, NodeStore};
use yammer::transport::TransportMux;
use yammer::Message;

struct Graph {
    router: Arc<Router>,
    store: NodeStore,
    peer: Arc<PeerDmController>,
}

async fn graph_on(hub: &Arc<FakeHub>, addr: &str) -> Graph {
    let router = Arc::new(Router::new());
    let store = NodeStore::new(Arc::new(MemoryKv::new()));
    let mux = TransportMux::new(
        store.kv().clone(),
        FakeFactory::new(Arc::clone(hub), addr),
    );
    let peer = PeerDmController::new(
        router.clone(),
        mux,
        store.clone(),
        Arc::new(SystemClock),
    );
    peer.run().await.unwrap();
    Graph {
        router,
        store,
        peer,
    }
}

fn capture_port(graph: &Graph, node: &str, port: &str) -> Arc<Mutex<Vec<Message>>> {
    let seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let collector = format!("collector-{port}");
    graph.router.register(
        PortAddress::input(&collector, "in"),
        Arc::new(move |msg| {
            sink.lock().unwrap().push(msg.clone());
            Ok(())
        }),
    );
    graph
        .router
        .add_wire(
            PortAddress::output(node, port),
            PortAddress::input(&collector, "in"),
        )
        .unwrap();
    seen
}

#[tokio::test]
async fn auto_accept_handshake_and_chunked_text() {
    let hub = FakeHub::new();
    let a = graph_on(&hub, "peer.a").await;
    let b = graph_on(&hub, "peer.b").await;

    a.peer.attach("dm-a");
    b.store.ensure("dm-b", NodeKind::PeerDm);
    b.store.update(
        "dm-b",
        json!({"auto_accept": true}).as_object().cloned().unwrap(),
    );
    b.peer.attach("dm-b");

    let incoming = capture_port(&b, "dm-b", "incoming");

    a.peer.connect("dm-a", "peer.b").await;
    wait_for(
        || {
            a.peer.state_of("dm-a").map(|(s, _, _)| s) == Some(HandshakeState::Accepted)
                && b.peer.state_of("dm-b").map(|(s, _, _)| s) == Some(HandshakeState::Accepted)
        },
        "both sides accepted",
    )
    .await;

    // 6 000 ASCII chars force a multi-chunk batch at the default budget.
    let text: String = std::iter::repeat("the quick brown fox ").take(300).collect();
    a.peer.send_text("dm-a", &text).await;

    wait_for(
        || !incoming.lock().unwrap().is_empty(),
        "reassembled incoming text",
    )
    .await;
    let got = incoming.lock().unwrap()[0].clone();
    assert_eq!(got.display_text(), text);
    assert_eq!(got.get_str("from"), Some("peer.a"));

    // More than one data frame actually crossed the hub.
    let data_frames = hub
        .sent_log()
        .iter()
        .filter(|(_, _, v)| v["type"] == "data")
        .count();
    assert!(data_frames > 1, "expected chunked delivery, got {data_frames}");
}

#[tokio::test]
async fn invite_flow_requires_user_approval() {
    let hub = FakeHub::new();
    let a = graph_on(&hub, "peer.a2").await;
    let b = graph_on(&hub, "peer.b2").await;

    a.peer.attach("dm-a");
    b.peer.attach("dm-b");
    let status_b = capture_port(&b, "dm-b", "status");

    a.peer.connect("dm-a", "peer.b2").await;

    // B surfaces an invite and holds in pending/incoming; A stays pending.
    wait_for(
        || {
            status_b
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.get_str("code") == Some("invite"))
        },
        "invite status on b",
    )
    .await;
    assert_eq!(
        b.peer.state_of("dm-b"),
        Some((
            HandshakeState::Pending,
            HandshakeDirection::Incoming,
            yammer::peer::Indicator::Online
        ))
    );
    assert_eq!(
        a.peer.state_of("dm-a").map(|(s, d, _)| (s, d)),
        Some((HandshakeState::Pending, HandshakeDirection::Outgoing))
    );

    // Approval completes the accept exchange on both sides.
    b.peer.accept_invite("dm-b").await;
    wait_for(
        || a.peer.state_of("dm-a").map(|(s, _, _)| s) == Some(HandshakeState::Accepted),
        "initiator accepted",
    )
    .await;
}

#[tokio::test]
async fn decline_reaches_the_initiator() {
    let hub = FakeHub::new();
    let a = graph_on(&hub, "peer.a3").await;
    let b = graph_on(&hub, "peer.b3").await;

    a.peer.attach("dm-a");
    b.peer.attach("dm-b");
    let status_a = capture_port(&a, "dm-a", "status");

    a.peer.connect("dm-a", "peer.b3").await;
    wait_for(
        || b.peer.state_of("dm-b").map(|(s, _, _)| s) == Some(HandshakeState::Pending),
        "b pending",
    )
    .await;

    b.peer.decline_invite("dm-b").await;
    wait_for(
        || a.peer.state_of("dm-a").map(|(s, _, _)| s) == Some(HandshakeState::Declined),
        "a declined",
    )
    .await;
    assert!(status_a
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.get_str("code") == Some("declined")));
}

#[tokio::test]
async fn text_before_acceptance_is_refused() {
    let hub = FakeHub::new();
    let a = graph_on(&hub, "peer.a4").await;
    a.peer.attach("dm-a");
    let status = capture_port(&a, "dm-a", "status");

    a.peer.send_text("dm-a", "too early").await;
    wait_for(
        || {
            status
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.get_str("code") == Some("handshake-not-accepted"))
        },
        "refusal status",
    )
    .await;
}
