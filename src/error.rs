//! Unified exception taxonomy and classifier (spec.md §4.B).
//!
//! Every failure that can reach a caller — transport, parse, interceptor,
//! or scheduler — is funneled through [`ExceptionClassifier::classify`]
//! before it is surfaced, producing a closed, fully-populated
//! [`UnifiedException`]. The classifier never panics and never returns an
//! error of its own; classification always succeeds (falling back to
//! `ErrorCode::UnknownError` for anything it doesn't recognize).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::TransportError;

/// High level exception category (spec.md §3, §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    Network,
    Server,
    Client,
    Auth,
    Data,
    Operation,
    Unknown,
}

/// Closed set of stable error code identifiers (spec.md §4.B, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum ErrorCode {
    ConnectTimeout,
    ReceiveTimeout,
    SendTimeout,
    ConnectionError,
    RequestCancelled,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    Conflict,
    ValidationError,
    TooManyRequests,
    InternalServerError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ClientError,
    ServerError,
    NetworkUnavailable,
    OperationTimeout,
    ParseError,
    OperationFailed,
    UnknownError,
}

impl ErrorCode {
    /// Stable wire identifier, as emitted to callers (spec.md §6).
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ErrorCode::ReceiveTimeout => "RECEIVE_TIMEOUT",
            ErrorCode::SendTimeout => "SEND_TIMEOUT",
            ErrorCode::ConnectionError => "CONNECTION_ERROR",
            ErrorCode::RequestCancelled => "REQUEST_CANCELLED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::BadGateway => "BAD_GATEWAY",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorCode::ClientError => "CLIENT_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::OperationFailed => "OPERATION_FAILED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

/// A fully classified, immutable failure (spec.md §3).
///
/// Never mutated after construction; clone it instead.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}/{code:?} ({status_code}): {message}")]
pub struct UnifiedException {
    pub kind: ExceptionKind,
    pub code: ErrorCode,
    pub status_code: i32,
    pub message: String,
    pub context: Option<String>,
    pub metadata: Option<serde_json::Map<String, Value>>,
    #[serde(skip)]
    pub original_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
    pub timestamp: u64,
    pub is_retryable: bool,
}

impl UnifiedException {
    fn new(kind: ExceptionKind, code: ErrorCode, status_code: i32, message: impl Into<String>) -> Self {
        let is_retryable = default_retryable(kind, code);
        Self {
            kind,
            code,
            status_code,
            message: message.into(),
            context: None,
            metadata: None,
            original_error: None,
            timestamp: unix_millis(),
            is_retryable,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_original_error(
        mut self,
        original: Arc<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        self.original_error = Some(original);
        self
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Retryability derived from `(kind, code)`, authoritative for retry
/// decisions in the Executor (spec.md §4.B "isRetryable is derived").
fn default_retryable(_kind: ExceptionKind, code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::ConnectTimeout
            | ErrorCode::ReceiveTimeout
            | ErrorCode::SendTimeout
            | ErrorCode::ConnectionError
            | ErrorCode::RequestTimeout
            | ErrorCode::TooManyRequests
            | ErrorCode::InternalServerError
            | ErrorCode::BadGateway
            | ErrorCode::ServiceUnavailable
            | ErrorCode::GatewayTimeout
            | ErrorCode::NetworkUnavailable
            | ErrorCode::OperationTimeout
            | ErrorCode::ServerError
    )
}

/// Any input the classifier accepts. The Executor, interceptor chain, and
/// scheduler construct these at the point of failure rather than throwing
/// raw transport/parse errors across module boundaries.
pub enum ClassifyInput {
    /// Already classified — returned unchanged (spec.md §4.B step 1).
    Unified(UnifiedException),
    Transport(TransportError),
    /// A socket-level "destination unreachable" failure, distinct from a
    /// `TransportError::ConnectionError` (spec.md §4.B step 4).
    NetworkUnreachable(String),
    /// A generic timeout not bound to a specific transport stage
    /// (spec.md §4.B step 5).
    GenericTimeout(String),
    /// Parser/format failure (spec.md §4.B step 6).
    ParseFailure(String),
    /// Two continuation methods called on one interceptor invocation
    /// (spec.md §4.B+).
    OperationFailed(String),
    Other(String),
}

/// Opaque handle returned by `register_global_handler`, needed to later
/// remove that specific handler (spec.md §6 `removeGlobalHandler`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Maps any failure into the closed taxonomy (spec.md §4.B).
#[derive(Default)]
pub struct ExceptionClassifier {
    counts: DashMap<ErrorCode, AtomicU64>,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn Fn(&UnifiedException) + Send + Sync>)>>,
    next_handler_id: AtomicU64,
}

impl ExceptionClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify any input into a `UnifiedException`. Never panics, never
    /// returns `Err`; records the outcome in `stats()` and invokes every
    /// registered global handler in registration order.
    pub fn classify(&self, input: ClassifyInput) -> UnifiedException {
        let exception = match input {
            ClassifyInput::Unified(e) => e,
            ClassifyInput::Transport(e) => self.classify_transport(e),
            ClassifyInput::NetworkUnreachable(msg) => {
                UnifiedException::new(ExceptionKind::Network, ErrorCode::NetworkUnavailable, -2001, msg)
            }
            ClassifyInput::GenericTimeout(msg) => {
                UnifiedException::new(ExceptionKind::Network, ErrorCode::OperationTimeout, -2002, msg)
            }
            ClassifyInput::ParseFailure(msg) => {
                UnifiedException::new(ExceptionKind::Data, ErrorCode::ParseError, -3001, msg)
            }
            ClassifyInput::OperationFailed(msg) => {
                UnifiedException::new(ExceptionKind::Operation, ErrorCode::OperationFailed, -4001, msg)
            }
            ClassifyInput::Other(msg) => {
                UnifiedException::new(ExceptionKind::Unknown, ErrorCode::UnknownError, -9999, msg)
            }
        };

        self.record(exception.code);
        self.dispatch(&exception);
        exception
    }

    fn classify_transport(&self, err: TransportError) -> UnifiedException {
        match err {
            TransportError::ConnectTimeout(msg) => UnifiedException::new(
                ExceptionKind::Network,
                ErrorCode::ConnectTimeout,
                -1001,
                msg,
            ),
            TransportError::ReadTimeout(msg) => {
                UnifiedException::new(ExceptionKind::Network, ErrorCode::ReceiveTimeout, -1003, msg)
            }
            TransportError::WriteTimeout(msg) => {
                UnifiedException::new(ExceptionKind::Network, ErrorCode::SendTimeout, -1002, msg)
            }
            TransportError::ConnectionError(msg) => UnifiedException::new(
                ExceptionKind::Network,
                ErrorCode::ConnectionError,
                -1004,
                msg,
            ),
            TransportError::Cancelled => UnifiedException::new(
                ExceptionKind::Operation,
                ErrorCode::RequestCancelled,
                -1999,
                "request cancelled",
            ),
            TransportError::BadResponse { status_code, body } => {
                self.classify_by_status(status_code, body)
            }
            TransportError::Unknown(msg) => {
                UnifiedException::new(ExceptionKind::Unknown, ErrorCode::UnknownError, -9999, msg)
            }
        }
    }

    /// spec.md §4.B step 3.
    fn classify_by_status(&self, status: u16, body: String) -> UnifiedException {
        let (kind, code) = match status {
            400 => (ExceptionKind::Client, ErrorCode::BadRequest),
            401 => (ExceptionKind::Auth, ErrorCode::Unauthorized),
            403 => (ExceptionKind::Auth, ErrorCode::Forbidden),
            404 => (ExceptionKind::Client, ErrorCode::NotFound),
            405 => (ExceptionKind::Client, ErrorCode::MethodNotAllowed),
            408 => (ExceptionKind::Network, ErrorCode::RequestTimeout),
            409 => (ExceptionKind::Client, ErrorCode::Conflict),
            422 => (ExceptionKind::Data, ErrorCode::ValidationError),
            429 => (ExceptionKind::Client, ErrorCode::TooManyRequests),
            500 => (ExceptionKind::Server, ErrorCode::InternalServerError),
            502 => (ExceptionKind::Server, ErrorCode::BadGateway),
            503 => (ExceptionKind::Server, ErrorCode::ServiceUnavailable),
            504 => (ExceptionKind::Server, ErrorCode::GatewayTimeout),
            400..=499 => (ExceptionKind::Client, ErrorCode::ClientError),
            500..=599 => (ExceptionKind::Server, ErrorCode::ServerError),
            _ => (ExceptionKind::Unknown, ErrorCode::UnknownError),
        };
        let message = if body.is_empty() {
            format!("HTTP status {status}")
        } else {
            body
        };
        UnifiedException::new(kind, code, status as i32, message)
    }

    fn record(&self, code: ErrorCode) {
        self.counts
            .entry(code)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn dispatch(&self, exception: &UnifiedException) {
        let handlers = self.handlers.read();
        for (_, handler) in handlers.iter() {
            // A handler that panics is caught and logged; the rest still
            // run and the main flow is unaffected (spec.md §7).
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(exception)
            }));
            if result.is_err() {
                tracing::warn!("global exception handler panicked");
            }
        }
    }

    /// Register a global handler, invoked once per classified failure, in
    /// registration order (spec.md §6, §7). Returns a `HandlerId` that can
    /// later be passed to `remove_global_handler`.
    pub fn register_global_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&UnifiedException) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Removes one previously registered handler (spec.md §6
    /// `removeGlobalHandler`). Returns `false` if `id` is unknown (already
    /// removed, or never registered).
    pub fn remove_global_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn clear_handlers(&self) {
        self.handlers.write().clear();
    }

    pub fn clear_stats(&self) {
        self.counts.clear();
    }

    pub fn stats(&self) -> HashMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_idempotent_on_already_classified() {
        let classifier = ExceptionClassifier::new();
        let first = classifier.classify(ClassifyInput::Transport(TransportError::ConnectTimeout(
            "boom".into(),
        )));
        let second = classifier.classify(ClassifyInput::Unified(first.clone()));
        assert_eq!(first.code.as_str(), second.code.as_str());
        assert_eq!(first.status_code, second.status_code);
    }

    #[test]
    fn status_503_is_retryable_server_error() {
        let classifier = ExceptionClassifier::new();
        let e = classifier.classify(ClassifyInput::Transport(TransportError::BadResponse {
            status_code: 503,
            body: String::new(),
        }));
        assert_eq!(e.kind, ExceptionKind::Server);
        assert_eq!(e.code, ErrorCode::ServiceUnavailable);
        assert!(e.is_retryable);
    }

    #[test]
    fn status_404_is_not_retryable_client_error() {
        let classifier = ExceptionClassifier::new();
        let e = classifier.classify(ClassifyInput::Transport(TransportError::BadResponse {
            status_code: 404,
            body: String::new(),
        }));
        assert_eq!(e.kind, ExceptionKind::Client);
        assert_eq!(e.code, ErrorCode::NotFound);
        assert!(!e.is_retryable);
    }

    #[test]
    fn stats_tracks_per_code_counts() {
        let classifier = ExceptionClassifier::new();
        for _ in 0..3 {
            classifier.classify(ClassifyInput::Transport(TransportError::ConnectionError(
                "x".into(),
            )));
        }
        let stats = classifier.stats();
        assert_eq!(stats.get("CONNECTION_ERROR"), Some(&3));
    }

    #[test]
    fn global_handlers_run_in_order_and_survive_panics() {
        use std::sync::Mutex;
        let classifier = ExceptionClassifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        classifier.register_global_handler(move |_| {
            o1.lock().unwrap().push(1);
            panic!("handler blew up");
        });
        let o2 = order.clone();
        classifier.register_global_handler(move |_| {
            o2.lock().unwrap().push(2);
        });

        classifier.classify(ClassifyInput::Other("boom".into()));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn remove_global_handler_stops_future_dispatch() {
        let classifier = ExceptionClassifier::new();
        let calls = Arc::new(AtomicU64::new(0));

        let calls_clone = calls.clone();
        let id = classifier.register_global_handler(move |_| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
        });

        classifier.classify(ClassifyInput::Other("first".into()));
        assert!(classifier.remove_global_handler(id));
        classifier.classify(ClassifyInput::Other("second".into()));

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(!classifier.remove_global_handler(id));
    }
}
