//! `Transport` external collaborator (spec.md §6): the only capability the
//! core consumes to perform an actual HTTP round-trip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};

/// Cooperative cancellation handle shared between a `QueueEntry` and the
/// in-flight `Transport::execute` call (spec.md §5 "Cancellation").
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A request resolved against `ConfigSource` defaults, ready for
/// transport: base URL joined, timeouts filled in, body finalized per
/// spec.md §3's GET/DELETE vs POST/PUT/PATCH body/query rules.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status_code: u16,
    pub body_bytes: Bytes,
    pub headers: HeaderMap,
    pub duration: Duration,
}

/// Transport-level failure kinds (spec.md §6).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),
    #[error("read timeout: {0}")]
    ReadTimeout(String),
    #[error("write timeout: {0}")]
    WriteTimeout(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("cancelled")]
    Cancelled,
    #[error("bad response: {status_code}")]
    BadResponse { status_code: u16, body: String },
    #[error("unknown transport error: {0}")]
    Unknown(String),
}

/// Minimal capability the core requires from a transport implementation.
/// Network transport itself (sockets, TLS, HTTP parsing) is external
/// (spec.md §1).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &ResolvedRequest,
        cancel: CancelToken,
    ) -> Result<RawResponse, TransportError>;

    /// Releases any resources held by this transport (connection pools,
    /// background tasks). Called once from `Client::shutdown`; transports
    /// with nothing to release can keep the default no-op (spec.md §5
    /// "shutdown").
    async fn dispose(&self) {}
}
