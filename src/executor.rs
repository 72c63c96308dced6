//! The `Executor`: ties request resolution, cache, scheduler,
//! interceptor chain, transport, and retry together into the single
//! `execute()` entry point (spec.md §4.F).

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::cache::ResponseCache;
use crate::clock::Clock;
use crate::config::ConfigSource;
use crate::error::{ClassifyInput, ExceptionClassifier, UnifiedException};
use crate::fingerprint::{self, Fingerprint};
use crate::interceptor::{InterceptorChain, InterceptorRegistry, StageOutcome};
use crate::logger::{truncate_for_log, LogLevel, Logger};
use crate::priority::Priority;
use crate::request::{Body, QueryParams, Request};
use crate::response::Response;
use crate::scheduler::Scheduler;
use crate::transport::{CancelToken, RawResponse, ResolvedRequest, Transport, TransportError};

/// Per-call overrides that do not belong on the reusable `Request`
/// (spec.md §3 `executeOptions`, SUPPLEMENT).
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub context: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

pub struct Executor {
    transport: Arc<dyn Transport>,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    classifier: Arc<ExceptionClassifier>,
    chain: InterceptorChain,
    cache: Arc<ResponseCache>,
    scheduler: Scheduler,
    log_body_limit: usize,
}

impl Executor {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
        classifier: Arc<ExceptionClassifier>,
        interceptors: Arc<InterceptorRegistry>,
        cache: Arc<ResponseCache>,
        scheduler: Scheduler,
        log_body_limit: usize,
    ) -> Self {
        Self {
            transport,
            config,
            clock,
            logger,
            classifier,
            chain: InterceptorChain::new(interceptors),
            cache,
            scheduler,
            log_body_limit,
        }
    }

    pub fn classifier(&self) -> &Arc<ExceptionClassifier> {
        &self.classifier
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn interceptors(&self) -> &Arc<InterceptorRegistry> {
        self.chain.registry()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// `execute(request, options)` (spec.md §4.F, the 10-step algorithm).
    pub async fn execute<T>(&self, request: &Request<T>, options: ExecuteOptions) -> Response<T>
    where
        T: Send + Sync + 'static,
    {
        self.execute_inner(request, options, None).await
    }

    /// Like `execute`, but admission and transport honor an externally
    /// supplied `CancelToken`, so the caller can cancel the request before
    /// it is even admitted (spec.md §6 `cancel`).
    pub async fn execute_with_cancel<T>(
        &self,
        request: &Request<T>,
        options: ExecuteOptions,
        cancel: CancelToken,
    ) -> Response<T>
    where
        T: Send + Sync + 'static,
    {
        self.execute_inner(request, options, Some(cancel)).await
    }

    async fn execute_inner<T>(
        &self,
        request: &Request<T>,
        options: ExecuteOptions,
        external_cancel: Option<CancelToken>,
    ) -> Response<T>
    where
        T: Send + Sync + 'static,
    {
        let started = Instant::now();
        let fp = self.compute_fingerprint(request);

        // Step 1: cache consult.
        if request.cache_policy.enabled {
            if let Some(cached) = self.cache.get(fp) {
                return self.finish_from_raw(request, cached, started, true);
            }
        }

        // Step 2: scheduler enqueue / dedup attach.
        let cacheable_dedup = request.cache_policy.enabled && request.is_idempotent();
        if cacheable_dedup {
            if let Some(waiter) = self.scheduler.try_attach_dedup(fp) {
                let _ = waiter.await;
                if let Some(cached) = self.cache.get(fp) {
                    return self.finish_from_raw(request, cached, started, true);
                }
                // The leader failed; fall through and run the request ourselves.
            } else {
                self.scheduler.begin_dedup_group(fp);
            }
        }

        let queue_entry = match external_cancel {
            Some(token) => self.scheduler.enqueue_with_token(request.priority, token).await,
            None => self.scheduler.enqueue(request.priority).await,
        };
        let cancel = queue_entry.cancel_token();

        let result = self.execute_admitted(request, &options, cancel).await;

        match &result {
            Ok(raw) if request.cache_policy.enabled => {
                self.cache.put(
                    fp,
                    cache_key(request),
                    raw.clone(),
                    request.cache_policy.ttl,
                    matches!(request.priority, Priority::Critical | Priority::High),
                );
            }
            _ => {}
        }
        if cacheable_dedup {
            self.scheduler.resolve_dedup_group(fp);
        }

        match result {
            Ok(raw) => {
                queue_entry.mark_completed();
                self.finish_from_raw(request, raw, started, false)
            }
            Err(exception) => {
                queue_entry.mark_failed();
                Response::failure(&exception, started.elapsed())
            }
        }
    }

    /// Steps 3-9: request-stage chain, transport (with retry), and
    /// response/error-stage chains. Returns the final `RawResponse` or a
    /// fully classified `UnifiedException`.
    async fn execute_admitted<T>(
        &self,
        request: &Request<T>,
        options: &ExecuteOptions,
        cancel: CancelToken,
    ) -> Result<RawResponse, UnifiedException>
    where
        T: Send + Sync + 'static,
    {
        let mut resolved = self.resolve(request);

        match self.chain.run_request_stage(resolved, self.classifier.as_ref()).await {
            StageOutcome::Continue(next) => resolved = next,
            StageOutcome::Resolved(response) => return Ok(response),
            StageOutcome::Rejected(exception) => {
                return self.run_error_stage_or_propagate(exception).await;
            }
        }

        let mut attempt = 1u32;
        loop {
            self.logger.log(
                LogLevel::Debug,
                &format!("executing {} {}", resolved.method, resolved.url),
                options.metadata.as_ref(),
            );
            if let Some(body) = &resolved.body {
                self.logger.log(
                    LogLevel::Trace,
                    &format!("request body: {}", truncate_for_log(body, self.log_body_limit)),
                    None,
                );
            }

            match self.transport.execute(&resolved, cancel.clone()).await {
                Ok(raw) => {
                    self.logger.log(
                        LogLevel::Trace,
                        &format!(
                            "response body ({} bytes): {}",
                            raw.body_bytes.len(),
                            truncate_for_log(&raw.body_bytes, self.log_body_limit)
                        ),
                        None,
                    );
                    return match self.chain.run_response_stage(raw, self.classifier.as_ref()).await {
                        StageOutcome::Continue(final_response) => Ok(final_response),
                        StageOutcome::Resolved(response) => Ok(response),
                        StageOutcome::Rejected(exception) => {
                            self.run_error_stage_or_propagate(exception).await
                        }
                    };
                }
                Err(transport_error) => {
                    let mut exception = self.classifier.classify(ClassifyInput::Transport(transport_error));
                    if let Some(context) = &options.context {
                        exception = exception.with_context(context.clone());
                    }
                    let retryable = retry_decision(&request.retry_policy, exception.status_code, exception.is_retryable);
                    let should_retry =
                        request.is_idempotent() && retryable && attempt < request.retry_policy.max_attempts;

                    if !should_retry {
                        return self.run_error_stage_or_propagate(exception).await;
                    }

                    let delay = if exception.status_code == 429 {
                        request.retry_policy.rate_limited_delay(None)
                    } else {
                        request.retry_policy.delay(attempt)
                    };
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Step 9/10: error-stage chain. A `Resolved` outcome recovers into a
    /// success; anything else propagates the (possibly enriched)
    /// exception.
    async fn run_error_stage_or_propagate(
        &self,
        exception: UnifiedException,
    ) -> Result<RawResponse, UnifiedException> {
        match self.chain.run_error_stage(exception, self.classifier.as_ref()).await {
            StageOutcome::Resolved(response) => Ok(response),
            StageOutcome::Continue(exception) => Err(exception),
            StageOutcome::Rejected(exception) => Err(exception),
        }
    }

    /// Resolves a `Request` against `ConfigSource` defaults, implementing
    /// the GET/DELETE (and the other body-less methods) vs POST/PUT/PATCH
    /// body/query rule from spec.md §3: body-less methods always carry
    /// their query params in the URL and never send a body, even if one
    /// was set; body-bearing methods send an explicit body as-is, or, if
    /// none was set, promote query params into a form-encoded body.
    fn resolve<T>(&self, request: &Request<T>) -> ResolvedRequest {
        let timeouts = self.config.default_timeouts();
        let base_url = self.config.base_url().unwrap_or("");
        let mut url = format!("{base_url}{}", request.path);

        let takes_body = matches!(request.method.as_str(), "POST" | "PUT" | "PATCH");
        let body = if takes_body {
            match &request.body {
                Body::Bytes(bytes) => Some(bytes.clone()),
                Body::Empty if !request.query_params.is_empty() => {
                    Some(Bytes::from(encode_query_params(&request.query_params)))
                }
                Body::Empty => None,
            }
        } else {
            if !request.query_params.is_empty() {
                url = format!("{url}?{}", encode_query_params(&request.query_params));
            }
            None
        };

        let mut headers = self.config.default_headers();
        for (name, value) in request.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        ResolvedRequest {
            method: request.method.clone(),
            url,
            headers,
            body,
            connect_timeout: request.timeouts.connect.unwrap_or(timeouts.connect),
            read_timeout: request.timeouts.read.unwrap_or(timeouts.read),
            write_timeout: request.timeouts.write.unwrap_or(timeouts.write),
        }
    }

    fn compute_fingerprint<T>(&self, request: &Request<T>) -> Fingerprint {
        fingerprint::fingerprint(
            &request.method,
            &request.path,
            &request.query_params,
            &request.headers,
            &request.body,
            request.cache_policy.key_override.as_deref(),
            None,
        )
    }

    fn finish_from_raw<T>(
        &self,
        request: &Request<T>,
        raw: RawResponse,
        started: Instant,
        from_cache: bool,
    ) -> Response<T>
    where
        T: Send + Sync + 'static,
    {
        match (request.parser)(&raw.body_bytes) {
            Ok(data) => {
                Response::success(raw.status_code as i32, data, raw.headers, started.elapsed(), from_cache)
            }
            Err(message) => {
                let exception = self
                    .classifier
                    .classify(ClassifyInput::ParseFailure(message));
                Response::failure(&exception, started.elapsed())
            }
        }
    }
}

fn cache_key<T>(request: &Request<T>) -> String {
    request
        .cache_policy
        .key_override
        .clone()
        .unwrap_or_else(|| format!("{} {}", request.method, request.path))
}

/// Percent-encodes query params via `url::form_urlencoded`, used both for
/// the GET-style URL query string and for promoting params into a
/// form-encoded body on body-bearing methods with no explicit body.
fn encode_query_params(params: &QueryParams) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.0.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

/// Combines the classifier's default retryability with a request's
/// `RetryPolicy.nonRetryableCodes`/`retryableCodes` overrides (spec.md §3):
/// an explicit non-retryable code always wins, otherwise an explicit
/// retryable code widens the default, otherwise the classifier decides.
fn retry_decision(policy: &crate::retry::RetryPolicy, status_code: i32, default_retryable: bool) -> bool {
    if let Ok(code) = u16::try_from(status_code) {
        if policy.non_retryable_codes.contains(&code) {
            return false;
        }
        if policy.retryable_codes.contains(&code) {
            return true;
        }
    }
    default_retryable
}
