//! Request model (spec.md §3, component A).
//!
//! A `Request<T>` is immutable after construction; the Executor may only
//! clone it and attach retry metadata to a derived copy (spec.md §3
//! Invariants). `T` is the type the caller's `parser` produces.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::priority::Priority;
use crate::retry::RetryPolicy;

/// Whether a request may be safely retried an arbitrary number of times
/// without observable semantic difference at the server (spec.md §3,
/// Glossary "Idempotent").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    ExplicitYes,
    ExplicitNo,
    Inferred,
}

impl Idempotency {
    /// Marks the tri-state as deferred; resolution (the
    /// `method ∈ {GET, HEAD, PUT, DELETE, OPTIONS, TRACE}` rule from
    /// spec.md §3) happens lazily in [`Idempotency::is_idempotent`].
    pub fn infer() -> Self {
        Idempotency::Inferred
    }

    fn resolve(self, method: &Method) -> bool {
        match self {
            Idempotency::ExplicitYes => true,
            Idempotency::ExplicitNo => false,
            Idempotency::Inferred => matches!(
                method.as_str(),
                "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS" | "TRACE"
            ),
        }
    }

    pub fn is_idempotent(self, method: &Method) -> bool {
        self.resolve(method)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTimeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl: Duration,
    pub key_override: Option<String>,
}

/// Request body: opaque bytes, or left for the Executor to decide from
/// `queryParams` per spec.md §3's GET/DELETE vs POST/PUT/PATCH rules.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Bytes(Bytes),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// Query parameters as an ordered list; duplicate keys are preserved in
/// insertion order (spec.md §6 fingerprint canonicalization).
#[derive(Debug, Clone, Default)]
pub struct QueryParams(pub Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable sort by key for the dedup fingerprint (spec.md §3).
    pub fn sorted(&self) -> Vec<(String, String)> {
        let mut sorted = self.0.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        sorted
    }
}

pub type Parser<T> = Arc<dyn Fn(&[u8]) -> Result<T, String> + Send + Sync>;

/// Immutable description of one HTTP call (spec.md §3, component A).
pub struct Request<T> {
    pub method: Method,
    pub path: String,
    pub query_params: QueryParams,
    pub body: Body,
    pub headers: HeaderMap,
    pub timeouts: RequestTimeouts,
    pub cache_policy: CachePolicy,
    pub retry_policy: RetryPolicy,
    pub priority: Priority,
    pub idempotent: Idempotency,
    pub parser: Parser<T>,
    /// Ordered list of interceptor names scoped to this request only
    /// (spec.md §3 `customInterceptors`).
    pub custom_interceptors: Option<Vec<String>>,
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("priority", &self.priority)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

impl Request<Bytes> {
    /// Build a request with a raw (pass-through) parser. Fails if `method`
    /// is outside the allowed set (spec.md §3).
    pub fn raw(method: Method, path: impl Into<String>) -> Result<Request<Bytes>, String>
    {
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(format!("unsupported method: {method}"));
        }
        Ok(Request {
            idempotent: Idempotency::infer(),
            method,
            path: path.into(),
            query_params: QueryParams::new(),
            body: Body::Empty,
            headers: HeaderMap::new(),
            timeouts: RequestTimeouts::default(),
            cache_policy: CachePolicy::default(),
            retry_policy: RetryPolicy::default(),
            priority: Priority::default(),
            parser: Arc::new(|bytes: &[u8]| Ok(Bytes::copy_from_slice(bytes))),
            custom_interceptors: None,
        })
    }
}

impl<T> Request<T>
where
    T: Send + Sync + 'static,
{
    pub fn with_parser<U>(self, parser: impl Fn(&[u8]) -> Result<U, String> + Send + Sync + 'static) -> Request<U>
    where
        U: Send + Sync + 'static,
    {
        Request {
            method: self.method,
            path: self.path,
            query_params: self.query_params,
            body: self.body,
            headers: self.headers,
            timeouts: self.timeouts,
            cache_policy: self.cache_policy,
            retry_policy: self.retry_policy,
            priority: self.priority,
            idempotent: self.idempotent,
            parser: Arc::new(parser),
            custom_interceptors: self.custom_interceptors,
        }
    }

    pub fn with_query(mut self, params: QueryParams) -> Self {
        self.query_params = params;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Body::Bytes(body);
        self
    }

    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeouts(mut self, timeouts: RequestTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotent(mut self, idempotent: Idempotency) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_custom_interceptors(mut self, names: Vec<String>) -> Self {
        self.custom_interceptors = Some(names);
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent.is_idempotent(&self.method)
    }
}
