//! Response types (spec.md §3, §4.F).

use std::time::Duration;

use http::HeaderMap;

use crate::error::UnifiedException;

/// `success = true` iff `statusCode` is in the 2xx band AND parser
/// succeeded (spec.md §3).
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub success: bool,
    pub status_code: i32,
    pub data: Option<T>,
    pub message: String,
    pub headers: HeaderMap,
    pub duration: Duration,
    pub from_cache: bool,
    pub error_code: Option<String>,
    /// The full classified failure, set iff `success` is `false`. Carries
    /// `context`/`metadata`/`is_retryable`/`original_error` that
    /// `error_code` alone cannot (spec.md §7 "terminal failures preserve a
    /// context string and a metadata mapping ... for downstream
    /// diagnostics").
    pub exception: Option<UnifiedException>,
}

impl<T> Response<T> {
    pub fn success(status_code: i32, data: T, headers: HeaderMap, duration: Duration, from_cache: bool) -> Self {
        Self {
            success: true,
            status_code,
            data: Some(data),
            message: "OK".to_string(),
            headers,
            duration,
            from_cache,
            error_code: None,
            exception: None,
        }
    }

    pub fn failure(exception: &UnifiedException, duration: Duration) -> Self {
        Self {
            success: false,
            status_code: exception.status_code,
            data: None,
            message: exception.message.clone(),
            headers: HeaderMap::new(),
            duration,
            from_cache: false,
            error_code: Some(exception.code.as_str().to_string()),
            exception: Some(exception.clone()),
        }
    }
}

/// Result of `executeBatch` (spec.md §4.F "Batch execution").
#[derive(Debug)]
pub struct AggregateResponse<T> {
    pub results: Vec<Response<T>>,
    pub success_count: usize,
    pub total_count: usize,
    pub errors: Vec<UnifiedException>,
    pub partial_success: bool,
    /// 200 if every member succeeded, 207 (Multi-Status) otherwise.
    pub status_code: u16,
}

impl<T> AggregateResponse<T> {
    pub fn from_results(results: Vec<Response<T>>, errors: Vec<UnifiedException>) -> Self {
        let total_count = results.len();
        let success_count = results.iter().filter(|r| r.success).count();
        let partial_success = success_count > 0 && success_count < total_count;
        let status_code = if success_count == total_count { 200 } else { 207 };
        Self {
            results,
            success_count,
            total_count,
            errors,
            partial_success,
            status_code,
        }
    }
}

/// Result of a download-variant execution (spec.md §4.F "Download variant").
#[derive(Debug, Clone)]
pub struct DownloadResponse {
    pub success: bool,
    pub status_code: i32,
    pub file_path: String,
    pub file_size: u64,
    pub duration: Duration,
    pub error_code: Option<String>,
}
