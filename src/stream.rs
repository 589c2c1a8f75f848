#![forbid(unsafe_code)]

//! One-shot delivery of a finished artifact.
//!
//! The response body owns a [`CleanupGuard`]. Whenever hyper drops the body,
//! after the last chunk or because the client went away, the guard deletes
//! the staged file, its per-job directory and the job record.

use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::api::ApiError;
use crate::jobs::JobStore;
use crate::sanitize::content_disposition;

const NOT_READY: &str = "File not ready or not found";

/// Removes a streamed job and its files when dropped.
pub struct CleanupGuard {
    store: JobStore,
    id: String,
    path: PathBuf,
    dir: Option<PathBuf>,
}

impl CleanupGuard {
    fn new(store: JobStore, id: String, path: PathBuf) -> Self {
        let dir = path.parent().map(PathBuf::from);
        Self {
            store,
            id,
            path,
            dir,
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.store.remove(&self.id);

        // Drop runs on whichever runtime worker polled the body last; the
        // unlink and directory walk go to the blocking pool instead.
        let id = std::mem::take(&mut self.id);
        let path = std::mem::take(&mut self.path);
        let dir = self.dir.take();
        let delete = move || delete_artifact(&id, &path, dir.as_deref());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(delete);
            }
            Err(_) => delete(),
        }
    }
}

fn delete_artifact(id: &str, path: &Path, dir: Option<&Path>) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(
            job_id = %id,
            path = %path.display(),
            "could not delete streamed file: {err}"
        );
    }
    if let Some(dir) = dir
        && let Err(err) = std::fs::remove_dir_all(dir)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(
            job_id = %id,
            path = %dir.display(),
            "could not delete staging dir: {err}"
        );
    }
    tracing::info!(job_id = %id, "artifact delivered and cleaned up");
}

/// Streams the artifact of a finished job and schedules its cleanup.
///
/// Jobs that are unknown, still running, failed or already being streamed
/// all answer 404.
pub async fn stream_artifact(store: &JobStore, id: &str) -> Result<Response, ApiError> {
    let job = store
        .claim_for_streaming(id)
        .ok_or_else(|| ApiError::not_found(NOT_READY))?;
    let Some(path) = job.artifact.clone() else {
        return Err(ApiError::not_found(NOT_READY));
    };
    let filename = job.filename.clone().unwrap_or_else(|| {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string())
    });

    // From here on the claim is ours; every exit path must release it through
    // the guard so a vanished file does not leave a stuck job behind.
    let guard = CleanupGuard::new(store.clone(), job.id.clone(), path.clone());

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(job_id = %job.id, path = %path.display(), "staged file unreadable: {err}");
            drop(guard);
            return Err(ApiError::not_found(NOT_READY));
        }
    };
    let size = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(err) => {
            tracing::warn!(job_id = %job.id, "could not stat staged file: {err}");
            drop(guard);
            return Err(ApiError::not_found(NOT_READY));
        }
    };
    let disposition = HeaderValue::from_str(&content_disposition(&filename))
        .map_err(|err| ApiError::internal(format!("invalid filename header: {err}")))?;

    tracing::info!(job_id = %job.id, filename = %filename, bytes = size, "streaming artifact");

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _guard = &guard;
        chunk
    });
    let mut response = Body::from_stream(stream).into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}
