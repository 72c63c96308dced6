//! Advisory logging sink (spec.md §6): `Logger.log` failures must never
//! affect the core, so the trait has no `Result` in its signature at all.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, fields: Option<&serde_json::Map<String, Value>>);
}

/// Default logger, forwarding to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, fields: Option<&serde_json::Map<String, Value>>) {
        let fields = fields
            .map(|f| serde_json::to_string(f).unwrap_or_default())
            .unwrap_or_default();
        match level {
            LogLevel::Trace => tracing::trace!(fields = %fields, "{message}"),
            LogLevel::Debug => tracing::debug!(fields = %fields, "{message}"),
            LogLevel::Info => tracing::info!(fields = %fields, "{message}"),
            LogLevel::Warn => tracing::warn!(fields = %fields, "{message}"),
            LogLevel::Error => tracing::error!(fields = %fields, "{message}"),
        }
    }
}

/// Headers/body redaction shared between the fingerprint deny-list (§6)
/// and log redaction (§7), grounded in the teacher's
/// `tracing.rs::HttpTracingConfig::redacted_headers`.
pub fn default_redacted_headers() -> Vec<String> {
    vec![
        "authorization".to_string(),
        "cookie".to_string(),
        "x-api-key".to_string(),
        "x-auth-token".to_string(),
        "date".to_string(),
    ]
}

/// Truncate a body for logging if it exceeds `max_len` (spec.md §7).
pub fn truncate_for_log(body: &[u8], max_len: usize) -> String {
    if body.len() <= max_len {
        String::from_utf8_lossy(body).to_string()
    } else {
        format!(
            "{}...<truncated {} bytes>",
            String::from_utf8_lossy(&body[..max_len]),
            body.len() - max_len
        )
    }
}
