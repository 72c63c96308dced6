//! End-to-end coverage of the seed scenarios (spec.md §8): cache hits,
//! dedup, priority ordering, retry, interceptor short-circuit/timeout,
//! and cancellation, driven through a `MockTransport` instead of a real
//! socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use parking_lot::Mutex;

use fetch_core::interceptor::{Handler, Interceptor, RegisterStrategy, Registration, StageFlags};
use fetch_core::{
    CachePolicy, CancelToken, Client, ExecuteOptions, Logger, LogLevel, Priority, RawResponse,
    Request, ResolvedRequest, RetryPolicy, Transport, TransportError,
};

struct MockTransport {
    queued: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockTransport {
    fn new(responses: Vec<Result<RawResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(responses.into_iter().collect()),
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    fn with_delay(mut self: Arc<Self>, delay: Duration) -> Arc<Self> {
        Arc::get_mut(&mut self).unwrap().delay = Some(delay);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        _request: &ResolvedRequest,
        cancel: CancelToken,
    ) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_cancelled(&cancel) => return Err(TransportError::Cancelled),
            }
        }
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let mut queue = self.queued.lock();
        queue.pop_front().unwrap_or_else(|| ok_response(200, b"{}"))
    }
}

async fn wait_cancelled(cancel: &CancelToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn ok_response(status: u16, body: &'static [u8]) -> Result<RawResponse, TransportError> {
    Ok(RawResponse {
        status_code: status,
        body_bytes: Bytes::from_static(body),
        headers: HeaderMap::new(),
        duration: Duration::from_millis(1),
    })
}

fn text_request(path: &str) -> Request<Bytes> {
    Request::raw(Method::GET, path).unwrap()
}

fn client_with(transport: Arc<dyn Transport>) -> Client {
    Client::builder().with_transport(transport).build()
}

#[tokio::test]
async fn basic_get_success() {
    let transport = MockTransport::new(vec![ok_response(200, b"{\"ok\":true}")]);
    let client = client_with(transport);
    let response = client.execute(&text_request("/items"), ExecuteOptions::default()).await;
    assert!(response.success);
    assert_eq!(response.status_code, 200);
    assert!(!response.from_cache);
}

#[tokio::test]
async fn second_call_is_served_from_cache() {
    let transport = MockTransport::new(vec![ok_response(200, b"{}")]);
    let client = client_with(transport.clone());
    let request = text_request("/cached").with_cache_policy(CachePolicy {
        enabled: true,
        ttl: Duration::from_secs(60),
        key_override: None,
    });

    let first = client.execute(&request, ExecuteOptions::default()).await;
    let second = client.execute(&request, ExecuteOptions::default()).await;

    assert!(first.success && second.success);
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn concurrent_identical_gets_are_deduplicated() {
    let transport = Arc::new(MockTransport {
        queued: Mutex::new(VecDeque::new()),
        calls: AtomicUsize::new(0),
        delay: None,
    })
    .with_delay(Duration::from_millis(30));
    let client = client_with(transport.clone());
    let request = Arc::new(text_request("/dedup").with_cache_policy(CachePolicy {
        enabled: true,
        ttl: Duration::from_secs(60),
        key_override: None,
    }));

    let c1 = client.clone();
    let r1 = request.clone();
    let c2 = client.clone();
    let r2 = request.clone();

    let (first, second) = tokio::join!(
        tokio::spawn(async move { c1.execute(&r1, ExecuteOptions::default()).await }),
        tokio::spawn(async move { c2.execute(&r2, ExecuteOptions::default()).await }),
    );

    assert!(first.unwrap().success);
    assert!(second.unwrap().success);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn retry_on_503_then_succeeds() {
    let transport = MockTransport::new(vec![
        Err(TransportError::BadResponse { status_code: 503, body: String::new() }),
        ok_response(200, b"{}"),
    ]);
    let client = client_with(transport.clone());
    let response = client.execute(&text_request("/flaky"), ExecuteOptions::default()).await;
    assert!(response.success);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn non_idempotent_post_is_not_retried_on_500() {
    let transport = MockTransport::new(vec![
        Err(TransportError::BadResponse { status_code: 500, body: String::new() }),
        ok_response(200, b"{}"),
    ]);
    let client = client_with(transport.clone());
    let request = Request::raw(Method::POST, "/orders").unwrap();
    let response = client.execute(&request, ExecuteOptions::default()).await;
    assert!(!response.success);
    assert_eq!(transport.call_count(), 1);
}

struct ShortCircuit;

#[async_trait]
impl Interceptor for ShortCircuit {
    fn name(&self) -> &str {
        "short-circuit"
    }

    async fn on_request(&self, _request: ResolvedRequest, handler: &mut Handler) {
        handler.resolve(RawResponse {
            status_code: 200,
            body_bytes: Bytes::from_static(b"{\"mock\":true}"),
            headers: HeaderMap::new(),
            duration: Duration::from_millis(0),
        });
    }
}

#[tokio::test]
async fn interceptor_short_circuits_with_synthetic_response() {
    let transport = MockTransport::new(vec![ok_response(200, b"{}")]);
    let client = client_with(transport.clone());
    client
        .interceptors()
        .register(
            Registration {
                name: "short-circuit".into(),
                version: 1,
                priority: 0,
                timeout: Duration::from_secs(1),
                continue_on_error: false,
                stages: StageFlags { request: true, response: false, error: false },
                interceptor: Arc::new(ShortCircuit),
            },
            RegisterStrategy::Strict,
        )
        .unwrap();

    let response = client.execute(&text_request("/mocked"), ExecuteOptions::default()).await;
    assert!(response.success);
    assert_eq!(&response.data.unwrap()[..], b"{\"mock\":true}");
    assert_eq!(transport.call_count(), 0);
}

struct SlowInterceptor;

#[async_trait]
impl Interceptor for SlowInterceptor {
    fn name(&self) -> &str {
        "slow"
    }

    async fn on_request(&self, request: ResolvedRequest, handler: &mut Handler) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.next_request(request);
    }
}

#[tokio::test]
async fn interceptor_timeout_with_continue_on_error_still_executes() {
    let transport = MockTransport::new(vec![ok_response(200, b"{}")]);
    let client = client_with(transport.clone());
    client
        .interceptors()
        .register(
            Registration {
                name: "slow".into(),
                version: 1,
                priority: 0,
                timeout: Duration::from_millis(5),
                continue_on_error: true,
                stages: StageFlags { request: true, response: false, error: false },
                interceptor: Arc::new(SlowInterceptor),
            },
            RegisterStrategy::Strict,
        )
        .unwrap();

    let response = client.execute(&text_request("/slow"), ExecuteOptions::default()).await;
    assert!(response.success);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn exhausting_retries_surfaces_failure() {
    let transport = MockTransport::new(vec![
        Err(TransportError::BadResponse { status_code: 503, body: String::new() }),
        Err(TransportError::BadResponse { status_code: 503, body: String::new() }),
        Err(TransportError::BadResponse { status_code: 503, body: String::new() }),
    ]);
    let client = client_with(transport.clone());
    let response = client.execute(&text_request("/always-down"), ExecuteOptions::default()).await;
    assert!(!response.success);
    assert_eq!(response.error_code.as_deref(), Some("SERVICE_UNAVAILABLE"));
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn cache_invalidate_forces_a_fresh_transport_call() {
    let transport = MockTransport::new(vec![ok_response(200, b"{}"), ok_response(200, b"{}")]);
    let client = client_with(transport.clone());
    let request = text_request("/profile").with_cache_policy(CachePolicy {
        enabled: true,
        ttl: Duration::from_secs(60),
        key_override: None,
    });

    let _ = client.execute(&request, ExecuteOptions::default()).await;
    let removed = client.cache().invalidate("GET /profile");
    assert_eq!(removed, 1);
    let second = client.execute(&request, ExecuteOptions::default()).await;

    assert!(second.success);
    assert!(!second.from_cache);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn high_priority_request_is_admitted_before_low_priority_when_saturated() {
    use fetch_core::ClientConfig;

    let order = Arc::new(Mutex::new(Vec::new()));
    let transport = Arc::new(RecordingTransport { order: order.clone() });
    let client = Client::builder()
        .with_config(ClientConfig { concurrency_limit: 1, ..ClientConfig::default() })
        .with_transport(transport)
        .build();

    let first = {
        let client = client.clone();
        tokio::spawn(async move {
            let request = text_request("/first").with_priority(Priority::Normal);
            client.execute(&request, ExecuteOptions::default()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let low = {
        let client = client.clone();
        tokio::spawn(async move {
            let request = text_request("/low").with_priority(Priority::Low);
            client.execute(&request, ExecuteOptions::default()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let high = {
        let client = client.clone();
        tokio::spawn(async move {
            let request = text_request("/high").with_priority(Priority::High);
            client.execute(&request, ExecuteOptions::default()).await
        })
    };

    let _ = tokio::join!(first, low, high);
    let recorded = order.lock().clone();
    let high_index = recorded.iter().position(|p| p == "/high").unwrap();
    let low_index = recorded.iter().position(|p| p == "/low").unwrap();
    assert!(high_index < low_index, "expected {recorded:?} to admit /high before /low");
}

struct RecordingTransport {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn execute(
        &self,
        request: &ResolvedRequest,
        _cancel: CancelToken,
    ) -> Result<RawResponse, TransportError> {
        self.order.lock().push(request.url.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(RawResponse {
            status_code: 200,
            body_bytes: Bytes::from_static(b"{}"),
            headers: HeaderMap::new(),
            duration: Duration::from_millis(1),
        })
    }
}

#[tokio::test]
async fn shutdown_cancels_a_request_stuck_in_the_queue_and_is_idempotent() {
    use fetch_core::ClientConfig;

    let transport = MockTransport::new(vec![ok_response(200, b"{}")]);
    let client = Client::builder()
        .with_config(ClientConfig { concurrency_limit: 0, ..ClientConfig::default() })
        .with_transport(transport.clone())
        .build();

    let stuck = {
        let client = client.clone();
        tokio::spawn(async move { client.execute(&text_request("/never"), ExecuteOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.shutdown().await;
    client.shutdown().await;

    let response = tokio::time::timeout(Duration::from_secs(1), stuck)
        .await
        .expect("execute should return once the client is shut down")
        .unwrap();
    assert!(!response.success);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn cancelling_a_pending_request_stops_it_without_a_retry() {
    use fetch_core::ClientConfig;

    let transport = MockTransport::new(vec![ok_response(200, b"{}")]);
    let client = Client::builder()
        .with_config(ClientConfig { concurrency_limit: 0, ..ClientConfig::default() })
        .with_transport(transport.clone())
        .build();

    let (token, future) = client.execute_cancellable(text_request("/cancel-me"), ExecuteOptions::default());
    let pending = tokio::spawn(future);
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.cancel(&token);

    let response = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("execute should return once cancelled")
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.error_code.as_deref(), Some("REQUEST_CANCELLED"));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn non_retryable_codes_override_a_default_retryable_status() {
    let transport = MockTransport::new(vec![
        Err(TransportError::BadResponse { status_code: 503, body: String::new() }),
        ok_response(200, b"{}"),
    ]);
    let client = client_with(transport.clone());
    let request = text_request("/flaky-but-pinned").with_retry_policy(RetryPolicy {
        non_retryable_codes: [503].into_iter().collect(),
        ..RetryPolicy::default()
    });

    let response = client.execute(&request, ExecuteOptions::default()).await;
    assert!(!response.success);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn retryable_codes_widen_a_default_non_retryable_status() {
    let transport = MockTransport::new(vec![
        Err(TransportError::BadResponse { status_code: 404, body: String::new() }),
        ok_response(200, b"{}"),
    ]);
    let client = client_with(transport.clone());
    let request = text_request("/missing-but-retried").with_retry_policy(RetryPolicy {
        retryable_codes: [404].into_iter().collect(),
        ..RetryPolicy::default()
    });

    let response = client.execute(&request, ExecuteOptions::default()).await;
    assert!(response.success);
    assert_eq!(transport.call_count(), 2);
}

struct CapturingLogger {
    messages: Mutex<Vec<String>>,
}

impl CapturingLogger {
    fn new() -> Arc<Self> {
        Arc::new(Self { messages: Mutex::new(Vec::new()) })
    }

    fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }
}

impl Logger for CapturingLogger {
    fn log(&self, _level: LogLevel, message: &str, _fields: Option<&serde_json::Map<String, serde_json::Value>>) {
        self.messages.lock().push(message.to_string());
    }
}

#[tokio::test]
async fn oversized_request_body_is_truncated_in_logs() {
    use fetch_core::ClientConfig;

    let transport = MockTransport::new(vec![ok_response(200, b"{}")]);
    let logger = CapturingLogger::new();
    let client = Client::builder()
        .with_config(ClientConfig { log_body_limit: 8, ..ClientConfig::default() })
        .with_transport(transport)
        .with_logger(logger.clone())
        .build();

    let request = Request::raw(Method::POST, "/big").unwrap().with_body(Bytes::from_static(b"0123456789abcdef"));
    let response = client.execute(&request, ExecuteOptions::default()).await;

    assert!(response.success);
    assert!(logger.contains("<truncated"));
}
