//! Download-variant execution: streams a response body to a caller-given
//! path instead of buffering it into a parsed `T` (spec.md §4.F "Download
//! variant"). Grounded in the teacher's `streaming.rs` chunked-write loop,
//! adapted from an `mpsc`-fed Bevy system into a direct async write.

use std::path::Path;
use std::time::Instant;

use tokio::io::AsyncWriteExt;

use crate::error::{ClassifyInput, ExceptionKind, ErrorCode, UnifiedException};
use crate::executor::{ExecuteOptions, Executor};
use crate::request::Request;
use crate::response::DownloadResponse;

pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

#[derive(Default)]
pub struct DownloadOptions {
    pub overwrite_existing: bool,
    pub progress: Option<ProgressCallback>,
    pub execute: ExecuteOptions,
}

/// `download(request, destination, options)` (spec.md §4.F). Runs the
/// normal `execute()` pipeline with a raw-bytes parser, then streams the
/// result to `destination`, creating parent directories as needed.
pub async fn download(
    executor: &Executor,
    request: &Request<bytes::Bytes>,
    destination: &Path,
    options: DownloadOptions,
) -> DownloadResponse {
    let started = Instant::now();
    let response = executor.execute(request, options.execute).await;

    if !response.success {
        return DownloadResponse {
            success: false,
            status_code: response.status_code,
            file_path: destination.display().to_string(),
            file_size: 0,
            duration: started.elapsed(),
            error_code: response.error_code,
        };
    }

    if destination.exists() && !options.overwrite_existing {
        let exception = executor.classifier().classify(ClassifyInput::Unified(UnifiedException {
            kind: ExceptionKind::Client,
            code: ErrorCode::Conflict,
            status_code: 409,
            message: format!("destination already exists: {}", destination.display()),
            context: None,
            metadata: None,
            original_error: None,
            timestamp: 0,
            is_retryable: false,
        }));
        return DownloadResponse {
            success: false,
            status_code: exception.status_code,
            file_path: destination.display().to_string(),
            file_size: 0,
            duration: started.elapsed(),
            error_code: Some(exception.code.as_str().to_string()),
        };
    }

    let data = response.data.unwrap_or_default();

    if let Err(write_error) = write_to_path(destination, &data, &options.progress).await {
        let exception = executor
            .classifier()
            .classify(ClassifyInput::Other(write_error));
        return DownloadResponse {
            success: false,
            status_code: exception.status_code,
            file_path: destination.display().to_string(),
            file_size: 0,
            duration: started.elapsed(),
            error_code: Some(exception.code.as_str().to_string()),
        };
    }

    DownloadResponse {
        success: true,
        status_code: response.status_code,
        file_path: destination.display().to_string(),
        file_size: data.len() as u64,
        duration: started.elapsed(),
        error_code: None,
    }
}

async fn write_to_path(
    destination: &Path,
    data: &[u8],
    progress: &Option<ProgressCallback>,
) -> Result<(), String> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create parent directory: {e}"))?;
        }
    }

    let mut file = tokio::fs::File::create(destination)
        .await
        .map_err(|e| format!("failed to create file: {e}"))?;

    const CHUNK_SIZE: usize = 64 * 1024;
    let total = data.len() as u64;
    let mut written = 0u64;
    for chunk in data.chunks(CHUNK_SIZE) {
        file.write_all(chunk)
            .await
            .map_err(|e| format!("failed to write file: {e}"))?;
        written += chunk.len() as u64;
        if let Some(callback) = progress {
            callback(written, Some(total));
        }
    }
    file.flush().await.map_err(|e| format!("failed to flush file: {e}"))?;
    Ok(())
}
