//! Transport mux: one surface over direct HTTP and the datagram relay.
//!
//! Controllers never care which transport the graph runs on. They ask for
//! JSON, blobs, or ordered streams; the mux either performs a plain HTTP
//! request or wraps it in an `http.request` envelope for the relay peer and
//! reassembles the response from datagrams.

pub mod relay;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

use yammerproto::RelayHttpRequest;

use crate::store::{KvStore, RELAY_SEED_KEY};
pub use relay::{
    DatagramRelay, DmOptions, InboundDm, NoRelayFactory, RelayFactory, RelayLink, StreamHandlers,
};

/// Default timeout for JSON posts.
pub const POST_TIMEOUT: Duration = Duration::from_secs(45);

/// Default timeout for streams.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Transport failures, surfaced per call. Callers may retry at their
/// discretion; the mux does not.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{status} {status_text}")]
    Http { status: u16, status_text: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay: {0}")]
    Relay(String),
    #[error("redirected to {target} for {service}")]
    Redirected { service: String, target: String },
    #[error("connection: {0}")]
    Connection(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(Duration::ZERO)
        } else {
            TransportError::Connection(e.to_string())
        }
    }
}

/// A fetched binary body.
#[derive(Debug, Clone)]
pub struct Blob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Shape request headers: ensure `Content-Type: application/json`, then map
/// the api key to `Authorization` (when it already carries a `Bearer `
/// prefix) or `X-API-Key`.
pub fn auth(headers: &BTreeMap<String, String>, api_key: &str) -> BTreeMap<String, String> {
    let mut shaped = headers.clone();
    shaped
        .entry("Content-Type".to_string())
        .or_insert_with(|| "application/json".to_string());
    let key = api_key.trim();
    if !key.is_empty() {
        if key.starts_with("Bearer ") {
            shaped.insert("Authorization".to_string(), key.to_string());
        } else {
            shaped.insert("X-API-Key".to_string(), key.to_string());
        }
    }
    shaped
}

/// Auth shaping for GET-like calls: no body, so no `Content-Type`; ask for
/// JSON back.
pub fn auth_get(api_key: &str) -> BTreeMap<String, String> {
    let mut shaped = auth(&BTreeMap::new(), api_key);
    shaped.remove("Content-Type");
    shaped.insert("Accept".to_string(), "application/json".to_string());
    shaped
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn status_error(status: reqwest::StatusCode) -> TransportError {
    TransportError::Http {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("").to_string(),
    }
}

/// The mux. One per graph; holds the lazily-connected relay link.
pub struct TransportMux {
    http: reqwest::Client,
    kv: Arc<dyn KvStore>,
    factory: Arc<dyn RelayFactory>,
    link: tokio::sync::Mutex<Option<Arc<RelayLink>>>,
}

impl TransportMux {
    pub fn new(kv: Arc<dyn KvStore>, factory: Arc<dyn RelayFactory>) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            kv,
            factory,
            link: tokio::sync::Mutex::new(None),
        })
    }

    /// Idempotently bring up the relay client. A persisted seed is reused;
    /// if instantiation fails with one, the seed is dropped and connection
    /// retried fresh. The working client's seed is persisted for next run.
    pub async fn ensure_relay(&self) -> Result<Arc<RelayLink>, TransportError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            return Ok(Arc::clone(link));
        }

        let seed = self.kv.get(RELAY_SEED_KEY);
        let had_seed = seed.is_some();
        let connected = match self.factory.connect(seed).await {
            Ok(pair) => pair,
            Err(e) if had_seed => {
                debug!("relay connect with persisted seed failed ({e}), retrying fresh");
                self.kv.delete(RELAY_SEED_KEY);
                self.factory
                    .connect(None)
                    .await
                    .map_err(|e| TransportError::Relay(e.to_string()))?
            }
            Err(e) => return Err(TransportError::Relay(e.to_string())),
        };

        let (client, rx) = connected;
        if let Some(seed) = client.seed() {
            self.kv.put(RELAY_SEED_KEY, seed);
        }
        let link = RelayLink::new(client);
        link.spawn_pump(rx);
        *guard = Some(Arc::clone(&link));
        Ok(link)
    }

    /// GET returning JSON.
    pub async fn get_json(
        &self,
        base: &str,
        path: &str,
        api_key: &str,
        use_relay: bool,
        relay_addr: &str,
    ) -> Result<Value, TransportError> {
        let url = join_url(base, path);
        if use_relay {
            let req = RelayHttpRequest {
                headers: auth_get(api_key),
                ..RelayHttpRequest::get(url)
            };
            let link = self.ensure_relay().await?;
            let body = link.send_request(relay_addr, req, POST_TIMEOUT).await?;
            return response_json(body);
        }

        let mut builder = self.http.get(&url).timeout(POST_TIMEOUT);
        for (k, v) in auth_get(api_key) {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(resp.json().await?)
    }

    /// POST JSON, returning JSON.
    pub async fn post_json(
        &self,
        base: &str,
        path: &str,
        body: Value,
        api_key: &str,
        use_relay: bool,
        relay_addr: &str,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let url = join_url(base, path);
        if use_relay {
            let req = RelayHttpRequest {
                headers: auth(&BTreeMap::new(), api_key),
                ..RelayHttpRequest::post_json(url, body)
            }
            .with_timeout_ms(timeout.as_millis() as u64);
            let link = self.ensure_relay().await?;
            let resp = link.send_request(relay_addr, req, timeout).await?;
            return response_json(resp);
        }

        let mut builder = self.http.post(&url).timeout(timeout).json(&body);
        for (k, v) in auth(&BTreeMap::new(), api_key) {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(resp.json().await?)
    }

    /// POST a raw binary body (ASR audio frames), discarding the response.
    pub async fn post_binary(
        &self,
        url: &str,
        body: Vec<u8>,
        api_key: &str,
        use_relay: bool,
        relay_addr: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if use_relay {
            let mut req = RelayHttpRequest::post_bytes(url, &body).with_timeout_ms(timeout.as_millis() as u64);
            req.headers = auth(&BTreeMap::new(), api_key);
            req.headers
                .insert("Content-Type".into(), "application/octet-stream".into());
            let link = self.ensure_relay().await?;
            let resp = link.send_request(relay_addr, req, timeout).await?;
            if !resp.ok {
                return Err(TransportError::Relay(
                    resp.error.unwrap_or_else(|| format!("status {}", resp.status)),
                ));
            }
            return Ok(());
        }

        let mut builder = self
            .http
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/octet-stream")
            .body(body);
        for (k, v) in auth(&BTreeMap::new(), api_key) {
            if k != "Content-Type" {
                builder = builder.header(k, v);
            }
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        Ok(())
    }

    /// Fetch a binary resource from a full URL.
    pub async fn fetch_blob(
        &self,
        url: &str,
        use_relay: bool,
        relay_addr: &str,
        api_key: &str,
    ) -> Result<Blob, TransportError> {
        if use_relay {
            let req = RelayHttpRequest {
                headers: auth_get(api_key),
                ..RelayHttpRequest::get(url)
            };
            let link = self.ensure_relay().await?;
            let resp = link.send_request(relay_addr, req, POST_TIMEOUT).await?;
            if !resp.ok {
                return Err(TransportError::Relay(
                    resp.error.unwrap_or_else(|| format!("status {}", resp.status)),
                ));
            }
            let content_type = resp.content_type().unwrap_or("application/octet-stream").to_string();
            let bytes = resp
                .body_bytes()
                .map_err(|e| TransportError::Decode(e.to_string()))?
                .or_else(|| {
                    // Some relays hand small JSON bodies back inline.
                    resp.json.as_ref().map(|j| j.to_string().into_bytes())
                })
                .unwrap_or_default();
            return Ok(Blob { content_type, bytes });
        }

        let mut builder = self.http.get(url).timeout(POST_TIMEOUT);
        for (k, v) in auth_get(api_key) {
            if k != "Accept" {
                builder = builder.header(k, v);
            }
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp.bytes().await?.to_vec();
        Ok(Blob { content_type, bytes })
    }

    /// Relay single request (already-shaped `RelayHttpRequest`).
    pub async fn send_request(
        &self,
        relay_addr: &str,
        req: RelayHttpRequest,
        timeout: Duration,
    ) -> Result<yammerproto::relay::ResponseBody, TransportError> {
        let link = self.ensure_relay().await?;
        link.send_request(relay_addr, req, timeout).await
    }

    /// Relay ordered stream.
    pub async fn send_stream(
        &self,
        relay_addr: &str,
        req: RelayHttpRequest,
        handlers: StreamHandlers,
        timeout: Duration,
    ) -> Result<yammerproto::relay::EndBody, TransportError> {
        let link = self.ensure_relay().await?;
        link.send_stream(relay_addr, req, handlers, timeout).await
    }

    /// Direct HTTP streaming: POST (or GET when `body` is `None`) and feed
    /// response bytes to `on_bytes` as they arrive.
    pub async fn stream_http(
        &self,
        url: &str,
        api_key: &str,
        body: Option<Value>,
        timeout: Duration,
        mut on_bytes: impl FnMut(Bytes),
    ) -> Result<(), TransportError> {
        let mut builder = match &body {
            Some(json) => self.http.post(url).json(json),
            None => self.http.get(url),
        };
        builder = builder.timeout(timeout);
        let headers = if body.is_some() {
            auth(&BTreeMap::new(), api_key)
        } else {
            auth_get(api_key)
        };
        for (k, v) in headers {
            builder = builder.header(k, v);
        }

        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status()));
        }
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            on_bytes(chunk?);
        }
        Ok(())
    }
}

/// Extract the JSON value of a relay response, decoding a base64 body when
/// the relay did not pre-parse it.
fn response_json(body: yammerproto::relay::ResponseBody) -> Result<Value, TransportError> {
    if let Some(error) = body.error {
        return Err(TransportError::Relay(error));
    }
    if !body.ok || body.status >= 400 {
        return Err(TransportError::Http {
            status: body.status,
            status_text: String::new(),
        });
    }
    if let Some(json) = body.json {
        return Ok(json);
    }
    if let Some(b64) = body.body_b64 {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        return serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()));
    }
    Ok(Value::Null)
}
