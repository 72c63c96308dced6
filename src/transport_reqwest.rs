//! Default `Transport` implementation wrapping `reqwest`, grounded in the
//! teacher's `resources.rs::HttpClientPool` (connection pooling via a
//! pool of `reqwest::Client`s) and `components.rs` retry/timeout fields.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;

use crate::transport::{CancelToken, RawResponse, ResolvedRequest, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct ReqwestTransportConfig {
    pub pool_size: usize,
    pub pool_idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ReqwestTransportConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            pool_idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 32,
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// Round-robin pool of `reqwest::Client`s, mirroring
/// `HttpClientPool::get_client` in the teacher.
pub struct ReqwestTransport {
    clients: Vec<Client>,
    next: AtomicUsize,
}

impl ReqwestTransport {
    pub fn new(config: ReqwestTransportConfig) -> Result<Self, TransportError> {
        let mut clients = Vec::with_capacity(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            let client = Client::builder()
                .pool_idle_timeout(config.pool_idle_timeout)
                .pool_max_idle_per_host(config.max_idle_per_host)
                .tcp_keepalive(config.tcp_keepalive)
                .build()
                .map_err(|e| TransportError::Unknown(e.to_string()))?;
            clients.push(client);
        }
        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    fn client(&self) -> &Client {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        &self.clients[idx % self.clients.len()]
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(ReqwestTransportConfig::default())
            .expect("default reqwest client configuration must build")
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ResolvedRequest,
        cancel: CancelToken,
    ) -> Result<RawResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let mut builder = self
            .client()
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(request.read_timeout);

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let cancellable = async {
            tokio::select! {
                result = builder.send() => Some(result),
                _ = wait_for_cancel(&cancel) => None,
            }
        };

        let result = match cancellable.await {
            None => return Err(TransportError::Cancelled),
            Some(result) => result,
        };

        let duration = started.elapsed();

        match result {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let headers = response.headers().clone();
                let body_bytes = response
                    .bytes()
                    .await
                    .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

                if !(200..300).contains(&status_code) {
                    return Err(TransportError::BadResponse {
                        status_code,
                        body: String::from_utf8_lossy(&body_bytes).to_string(),
                    });
                }

                Ok(RawResponse {
                    status_code,
                    body_bytes,
                    headers: convert_headers(headers),
                    duration,
                })
            }
            Err(e) => Err(classify_reqwest_error(e)),
        }
    }
}

async fn wait_for_cancel(cancel: &CancelToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn convert_headers(headers: reqwest::header::HeaderMap) -> http::HeaderMap {
    let mut out = http::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_str().as_bytes()),
            http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::ReadTimeout(e.to_string())
    } else if e.is_connect() {
        TransportError::ConnectionError(e.to_string())
    } else {
        TransportError::Unknown(e.to_string())
    }
}

/// Convenience constructor used by `Executor::with_default_transport`.
pub fn default_transport() -> Arc<dyn Transport> {
    Arc::new(ReqwestTransport::default())
}
