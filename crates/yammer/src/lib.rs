//! Realtime voice dataflow runtime.
//!
//! A user-editable directed graph of nodes (ASR, LLM, TTS, text inputs,
//! templates, peer DMs) exchanges messages over typed ports. This crate is
//! the streaming engine between those ports and the remote services:
//!
//! - [`router`] — publish/subscribe of messages keyed by port addresses,
//!   with input exclusivity, output fan-out, and snapshot delivery.
//! - [`store`] — per-node configuration records over a KV abstraction.
//! - [`transport`] — one mux over direct HTTP and the datagram relay, with
//!   request correlation, ordered streaming, and seed persistence.
//! - [`asr`] / [`llm`] / [`tts`] — the service controllers.
//! - [`peer`] — the peer DM overlay controller (handshake, heartbeat,
//!   chunked delivery).
//! - [`text`] — sentence muxing, NDJSON framing, speech sanitization.
//! - [`audio`] — capture/sink traits the embedder implements, plus PCM and
//!   WAV plumbing.
//!
//! The embedding UI owns the DOM/editor/device surfaces; everything here is
//! driven through the router and the controller APIs.

pub mod asr;
pub mod audio;
pub mod clock;
pub mod llm;
pub mod message;
pub mod nodelog;
pub mod nodes;
pub mod peer;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod text;
pub mod transport;
pub mod tts;

pub use clock::{Clock, SystemClock};
pub use message::Message;
pub use router::{Direction, PortAddress, Router, RouterEvent, Wire};
pub use store::{FileKv, KvStore, MemoryKv, NodeKind, NodeStore};
pub use transport::TransportMux;
