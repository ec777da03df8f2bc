//! HTTP collaborator: per-request transport state and the backend trait
//!
//! The scheduler never blocks on the network. A backend call fires the
//! request on its own task and publishes progress through the shared
//! [`HttpTransport`] record (atomics plus a body buffer); the scheduler
//! reads those fields on its next tick. Tests substitute an in-memory
//! backend for the reqwest implementation.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

/// Lifecycle state of one connection's request.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    Ready = 0,
    Prepared = 1,
    Inflight = 2,
    Success = 3,
    Failure = 4,
    Decrypting = 5,
    Decrypted = 6,
    Encrypting = 7,
    AsyncIo = 8,
    Done = 9,
}

impl ReqStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReqStatus::Ready,
            1 => ReqStatus::Prepared,
            2 => ReqStatus::Inflight,
            3 => ReqStatus::Success,
            4 => ReqStatus::Failure,
            5 => ReqStatus::Decrypting,
            6 => ReqStatus::Decrypted,
            7 => ReqStatus::Encrypting,
            8 => ReqStatus::AsyncIo,
            _ => ReqStatus::Done,
        }
    }
}

/// Milliseconds since process start, for lock-free last-data stamps.
fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Shared transport record for one HTTP request.
///
/// Written by the backend task, read by the scheduler each tick; the crypto
/// pool flips `status` when it finishes a piece.
pub struct HttpTransport {
    status: AtomicU8,
    pub http_status: AtomicU16,
    /// Body bytes received (GET) or acknowledged (PUT)
    pub received: AtomicU64,
    /// Content-Length of the response, -1 while unknown
    pub content_length: AtomicI64,
    /// Server-requested wait in seconds (Retry-After), -1 when absent
    pub timeleft_secs: AtomicI64,
    last_data_ms: AtomicU64,
    content_type: Mutex<Option<String>>,
    body: Mutex<BytesMut>,
    pub cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(ReqStatus::Ready as u8),
            http_status: AtomicU16::new(0),
            received: AtomicU64::new(0),
            content_length: AtomicI64::new(-1),
            timeleft_secs: AtomicI64::new(-1),
            last_data_ms: AtomicU64::new(now_ms()),
            content_type: Mutex::new(None),
            body: Mutex::new(BytesMut::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn status(&self) -> ReqStatus {
        ReqStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ReqStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Atomically moves `from → to`; returns whether the transition won.
    pub fn transition(&self, from: ReqStatus, to: ReqStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn touch(&self) {
        self.last_data_ms.store(now_ms(), Ordering::Release);
    }

    pub fn last_data_age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_data_ms.load(Ordering::Acquire)))
    }

    pub fn push_body(&self, chunk: &[u8]) {
        self.body.lock().unwrap().extend_from_slice(chunk);
        self.received
            .fetch_add(chunk.len() as u64, Ordering::AcqRel);
        self.touch();
    }

    pub fn take_body(&self) -> BytesMut {
        self.body.lock().unwrap().split()
    }

    pub fn body_len(&self) -> usize {
        self.body.lock().unwrap().len()
    }

    pub fn set_content_type(&self, value: Option<String>) {
        *self.content_type.lock().unwrap() = value;
    }

    pub fn content_type(&self) -> Option<String> {
        self.content_type.lock().unwrap().clone()
    }

    pub fn timeleft(&self) -> Option<Duration> {
        let secs = self.timeleft_secs.load(Ordering::Acquire);
        (secs >= 0).then(|| Duration::from_secs(secs as u64))
    }

    /// Clears per-attempt state before the request is fired again.
    pub fn reset_for_retry(&self) {
        self.http_status.store(0, Ordering::Release);
        self.received.store(0, Ordering::Release);
        self.content_length.store(-1, Ordering::Release);
        self.timeleft_secs.store(-1, Ordering::Release);
        self.body.lock().unwrap().clear();
        self.set_content_type(None);
        self.touch();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Everything the backend needs to fire one request.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: String,
    /// Byte range `[start, end)` appended as a Range header (GET)
    pub range: Option<(u64, u64)>,
    /// Outgoing ciphertext (POST)
    pub body: Option<Bytes>,
}

/// Non-blocking HTTP collaborator. `start` returns immediately; completion
/// is observed through the transport status.
pub trait HttpBackend: Send + Sync {
    fn start(&self, spec: HttpRequestSpec, transport: Arc<HttpTransport>, wake: Arc<Notify>);
}

/// reqwest-backed implementation used in production.
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl HttpBackend for ReqwestBackend {
    fn start(&self, spec: HttpRequestSpec, transport: Arc<HttpTransport>, wake: Arc<Notify>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            run_request(client, spec, transport, &wake).await;
            wake.notify_one();
        });
    }
}

async fn run_request(
    client: reqwest::Client,
    spec: HttpRequestSpec,
    transport: Arc<HttpTransport>,
    wake: &Notify,
) {
    let mut builder = match spec.method {
        HttpMethod::Get => client.get(&spec.url),
        HttpMethod::Post => client.post(&spec.url),
    };
    if let Some((start, end)) = spec.range {
        builder = builder.header(reqwest::header::RANGE, format!("bytes={}-{}", start, end - 1));
    }
    if let Some(body) = spec.body {
        builder = builder.body(body);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(target: "http", url = %spec.url, error = %err, "Request failed to send");
            transport.set_status(ReqStatus::Failure);
            return;
        }
    };

    transport
        .http_status
        .store(response.status().as_u16(), Ordering::Release);
    if let Some(len) = response.content_length() {
        transport.content_length.store(len as i64, Ordering::Release);
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    transport.set_content_type(content_type);
    if let Some(secs) = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    {
        transport.timeleft_secs.store(secs, Ordering::Release);
    }

    if !response.status().is_success() {
        debug!(
            target: "http",
            url = %spec.url,
            status = response.status().as_u16(),
            "Request failed"
        );
        transport.set_status(ReqStatus::Failure);
        return;
    }

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if transport.cancel.is_cancelled() {
            transport.set_status(ReqStatus::Failure);
            return;
        }
        match chunk {
            Ok(bytes) => {
                trace!(target: "http", url = %spec.url, len = bytes.len(), "Body bytes");
                transport.push_body(&bytes);
                wake.notify_one();
            }
            Err(err) => {
                warn!(target: "http", url = %spec.url, error = %err, "Body stream failed");
                transport.set_status(ReqStatus::Failure);
                return;
            }
        }
    }

    transport.set_status(ReqStatus::Success);
}

/// Rewrites a plain-http URL onto the alternate port 8080 (or back onto the
/// default port). HTTPS URLs are returned unchanged.
pub fn set_alt_port(raw: &str, enable: bool) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.scheme() == "http" => {
            let port = if enable { Some(8080) } else { None };
            if url.set_port(port).is_ok() {
                url.to_string()
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}

/// Upgrades a plain-http URL to https, dropping any explicit port. Applied
/// when a transparent proxy answers with text/html.
pub fn upgrade_to_https(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.scheme() == "http" => {
            if url.set_scheme("https").is_ok() {
                let _ = url.set_port(None);
                url.to_string()
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}
