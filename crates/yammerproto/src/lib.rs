//! Wire protocol for the yammer dataflow runtime.
//!
//! Everything that crosses the datagram relay is a JSON envelope with an
//! `event` (or `type`) discriminator and a correlation `id`. This crate owns
//! those shapes so the runtime and any future peers agree on them:
//!
//! - [`relay`] — the request/response envelopes used to tunnel HTTP through
//!   a relay peer, including the chunked/line-batched streaming frames.
//! - [`reorder`] — the sequence reorder buffer that turns out-of-order,
//!   possibly duplicated stream frames back into an ordered stream.
//! - [`dm`] — the peer-to-peer DM overlay: handshake, heartbeat, and
//!   chunked data envelopes plus the splitter/assembler pair.
//! - [`payload`] — best-effort hydration of inbound payloads and canonical
//!   text extraction.

pub mod dm;
pub mod payload;
pub mod relay;
pub mod reorder;

pub use dm::{DmEnvelope, DmInbox, DmMeta, HandshakeAction, HeartbeatAction};
pub use relay::{RelayHttpRequest, RelayLine, RelayReply, RequestFrame};
pub use reorder::SeqBuffer;

/// Current wall-clock time in milliseconds since the Unix epoch, as carried
/// in envelope `ts` fields.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a process-unique correlation token for request/stream envelopes.
pub fn correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
