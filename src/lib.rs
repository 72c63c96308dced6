//! `fetch_core`: the concurrency and execution substrate for a
//! general-purpose HTTP client framework — a priority/dedup request
//! queue, an ordered interceptor chain, a TTL response cache,
//! retry/timeout logic keyed on idempotency, and a unified exception
//! classifier. Network transport itself is an external collaborator
//! (see [`transport::Transport`]); a `reqwest`-backed default is
//! provided behind the `reqwest-transport` feature.

pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod download;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod interceptor;
pub mod logger;
pub mod priority;
pub mod request;
pub mod response;
pub mod retry;
pub mod scheduler;
pub mod transport;

#[cfg(feature = "reqwest-transport")]
pub mod transport_reqwest;

use std::sync::Arc;
use std::time::Duration;

pub use cache::ResponseCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigSource, StaticConfig, Timeouts};
pub use error::{ErrorCode, ExceptionClassifier, ExceptionKind, HandlerId, UnifiedException};
pub use executor::{ExecuteOptions, Executor};
pub use fingerprint::Fingerprint;
pub use interceptor::{Interceptor, InterceptorRegistry, RegisterStrategy, Registration, StageFlags};
pub use logger::{LogLevel, Logger, TracingLogger};
pub use priority::Priority;
pub use request::{Body, CachePolicy, Idempotency, QueryParams, Request, RequestTimeouts};
pub use response::{AggregateResponse, DownloadResponse, Response};
pub use retry::{RetryPolicy, RetryStrategy};
pub use scheduler::{QueueStatus, Scheduler};
pub use transport::{CancelToken, RawResponse, ResolvedRequest, Transport, TransportError};

/// Construction-time knobs that do not belong on any single request
/// (spec.md §6 "ConfigSource" plus the scheduler/cache sizing the
/// distilled spec leaves to the host application).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub concurrency_limit: usize,
    pub cache_capacity: usize,
    pub request_ceiling: Duration,
    pub sweep_interval: Duration,
    /// Request/response bodies logged beyond this many bytes are truncated
    /// (spec.md §7 "log bodies are truncated").
    pub log_body_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 32,
            cache_capacity: 1024,
            request_ceiling: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            log_body_limit: 2048,
        }
    }
}

/// Top-level facade wiring every component together (spec.md §2
/// "module-to-file map"). Construct one per logical HTTP client; it is
/// cheaply `Clone`-able and safe to share across tasks.
#[derive(Clone)]
pub struct Client {
    executor: Arc<Executor>,
    scheduler: Scheduler,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub async fn execute<T>(&self, request: &Request<T>, options: ExecuteOptions) -> Response<T>
    where
        T: Send + Sync + 'static,
    {
        self.executor.execute(request, options).await
    }

    pub async fn execute_batch<T>(
        &self,
        requests: &[Request<T>],
        options: ExecuteOptions,
    ) -> AggregateResponse<T>
    where
        T: Send + Sync + 'static,
    {
        batch::execute_batch(&self.executor, requests, options).await
    }

    pub async fn download(
        &self,
        request: &Request<bytes::Bytes>,
        destination: &std::path::Path,
        options: download::DownloadOptions,
    ) -> DownloadResponse {
        download::download(&self.executor, request, destination, options).await
    }

    pub fn interceptors(&self) -> &Arc<InterceptorRegistry> {
        self.executor.interceptors()
    }

    pub fn classifier(&self) -> &Arc<ExceptionClassifier> {
        self.executor.classifier()
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        self.executor.cache()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.scheduler.status()
    }

    /// Runs `request` as before, but returns a `CancelToken` the caller can
    /// use to cancel it — before admission, while queued, or mid-transport
    /// (spec.md §6 `cancel`).
    pub fn execute_cancellable<T>(
        &self,
        request: Request<T>,
        options: ExecuteOptions,
    ) -> (CancelToken, impl std::future::Future<Output = Response<T>> + Send + 'static)
    where
        T: Send + Sync + 'static,
    {
        let cancel = CancelToken::new();
        let executor = self.executor.clone();
        let cancel_for_task = cancel.clone();
        let future =
            async move { executor.execute_with_cancel(&request, options, cancel_for_task).await };
        (cancel, future)
    }

    /// Cancels a request obtained via `execute_cancellable`.
    pub fn cancel(&self, token: &CancelToken) {
        token.cancel();
    }

    /// Idempotent shutdown: cancels every pending/admitted request, aborts
    /// the staleness sweeper, and disposes the transport (spec.md §5
    /// "shutdown"). Safe to call more than once or from multiple tasks.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.executor.transport().dispose().await;
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    config_source: Option<Arc<dyn ConfigSource>>,
    clock: Option<Arc<dyn Clock>>,
    logger: Option<Arc<dyn Logger>>,
}

impl ClientBuilder {
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config_source(mut self, config_source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(config_source);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Client {
        let scheduler = Scheduler::new(self.config.concurrency_limit, self.config.request_ceiling);
        scheduler.spawn_sweeper(self.config.sweep_interval);

        let transport = self.transport.unwrap_or_else(default_transport);

        let executor = Executor::new(
            transport,
            self.config_source.unwrap_or_else(|| Arc::new(StaticConfig::new())),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.logger.unwrap_or_else(|| Arc::new(TracingLogger)),
            Arc::new(ExceptionClassifier::new()),
            Arc::new(InterceptorRegistry::new()),
            Arc::new(ResponseCache::new(self.config.cache_capacity)),
            scheduler.clone(),
            self.config.log_body_limit,
        );

        Client {
            executor: Arc::new(executor),
            scheduler,
        }
    }
}

#[cfg(feature = "reqwest-transport")]
fn default_transport() -> Arc<dyn Transport> {
    transport_reqwest::default_transport()
}

#[cfg(not(feature = "reqwest-transport"))]
fn default_transport() -> Arc<dyn Transport> {
    panic!("no Transport configured: either enable `reqwest-transport` or call ClientBuilder::with_transport")
}
