#![forbid(unsafe_code)]

//! HTTP surface.
//!
//! `POST /download/` validates the form, creates a job and hands the fetch to
//! a background task. Clients then poll `/progress/{id}/` and finally pull the
//! file from `/download/{id}/`, which deletes it once delivered.

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Form, Path as AxumPath, State, rejection::FormRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use url::Url;

use crate::config::{RuntimeSettings, SubmitMode};
use crate::extractor::{Extractor, FetchRequest, Quality, run_extraction};
use crate::jobs::{JobStatus, JobStore, staging_dir};
use crate::stream::stream_artifact;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Files reachable under `/static/`.
const STATIC_ASSETS: &[(&str, &str)] = &[
    ("app.js", include_str!("../assets/app.js")),
    ("style.css", include_str!("../assets/style.css")),
];

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub extractor: Arc<dyn Extractor>,
    pub media_root: Arc<PathBuf>,
    pub fetch_timeout: Option<Duration>,
    pub submit_mode: SubmitMode,
}

impl AppState {
    pub fn new(settings: &RuntimeSettings, store: JobStore, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            store,
            extractor,
            media_root: Arc::new(settings.media_root.clone()),
            fetch_timeout: settings.fetch_timeout,
            submit_mode: settings.submit_mode,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    // Anything but POST on the submission path is a client error, not a 405.
    let submit = post(submit_download).fallback(invalid_method);

    Router::new()
        .route("/", get(index))
        .route("/static/{file}", get(static_asset))
        .route("/download", submit.clone())
        .route("/download/", submit)
        .route("/download/{id}", get(download_artifact))
        .route("/download/{id}/", get(download_artifact))
        .route("/progress/{id}", get(report_progress))
        .route("/progress/{id}/", get(report_progress))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn static_asset(AxumPath(file): AxumPath<String>) -> ApiResult<Response> {
    let (name, contents) = STATIC_ASSETS
        .iter()
        .find(|(name, _)| *name == file)
        .ok_or_else(|| ApiError::not_found("asset not found"))?;
    let mime = MimeGuess::from_path(name).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref())
        .map_err(|err| ApiError::internal(format!("invalid content type: {err}")))?;
    Ok(([(header::CONTENT_TYPE, content_type)], *contents).into_response())
}

async fn not_found() -> ApiError {
    ApiError::not_found("endpoint not found")
}

async fn invalid_method() -> ApiError {
    ApiError::bad_request("Invalid request method")
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitForm {
    video_url: Option<String>,
    video_quality: Option<String>,
    wait: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitResponse {
    pub download_id: String,
    pub filename: Option<String>,
}

async fn submit_download(
    State(state): State<AppState>,
    form: Result<Form<SubmitForm>, FormRejection>,
) -> ApiResult<Json<SubmitResponse>> {
    let Form(form) = form.map_err(|err| ApiError::bad_request(format!("Invalid form data: {err}")))?;

    let url = validate_url(form.video_url.as_deref())?;
    let quality = match form.video_quality.as_deref().map(str::trim) {
        None | Some("") => Quality::default(),
        Some(value) => Quality::parse(value)
            .ok_or_else(|| ApiError::bad_request(format!("Unsupported quality: {value}")))?,
    };
    let mode = form
        .wait
        .as_deref()
        .and_then(parse_wait_flag)
        .unwrap_or(state.submit_mode);

    let id = state.store.create();
    let request = FetchRequest {
        job_id: id.clone(),
        url,
        quality,
        output_dir: staging_dir(&state.media_root, &id),
    };
    tracing::info!(
        job_id = %id,
        url = %request.url,
        quality = %quality.label(),
        ?mode,
        "download submitted"
    );

    // The task owns the job's writes and outlives this request either way.
    let store = state.store.clone();
    let extractor = Arc::clone(&state.extractor);
    let timeout = state.fetch_timeout;
    let task = tokio::spawn(async move {
        run_extraction(extractor.as_ref(), &store, &request, timeout).await
    });

    match mode {
        SubmitMode::Detach => Ok(Json(SubmitResponse {
            download_id: id,
            filename: None,
        })),
        SubmitMode::Wait => match task.await {
            Ok(Ok(outcome)) => Ok(Json(SubmitResponse {
                download_id: id,
                filename: Some(outcome.filename),
            })),
            Ok(Err(err)) => Err(ApiError::internal(err.client_message())),
            Err(err) => {
                tracing::error!(job_id = %id, "fetch task aborted: {err}");
                Err(ApiError::internal(format!("An error occurred: {err}")))
            }
        },
    }
}

fn validate_url(raw: Option<&str>) -> ApiResult<String> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(ApiError::bad_request("Please provide a video URL"));
    }
    let parsed = Url::parse(raw).map_err(|err| ApiError::bad_request(format!("Invalid URL: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.to_string()),
        scheme => Err(ApiError::bad_request(format!("Unsupported URL scheme: {scheme}"))),
    }
}

fn parse_wait_flag(value: &str) -> Option<SubmitMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(SubmitMode::Wait),
        "0" | "false" | "off" | "no" => Some(SubmitMode::Detach),
        _ => None,
    }
}

/// Client-facing view of a job.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ProgressPayload {
    pub progress: u8,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set once the artifact can be streamed. The tool reports `finished`
    /// before merging or transcoding, so `status` alone is not enough.
    #[serde(skip_serializing_if = "is_false")]
    pub ready: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Unknown ids report as a fresh pending job; a client cannot tell "not
/// started" from "never existed". Tightening this would break pollers that
/// race the submission response.
pub fn report(store: &JobStore, id: &str) -> ProgressPayload {
    match store.get(id) {
        Some(job) => ProgressPayload {
            progress: job.progress,
            status: job.status,
            ready: job.is_ready(),
            filename: job.filename,
            error: job.error.filter(|_| job.status == JobStatus::Error),
        },
        None => ProgressPayload {
            progress: 0,
            status: JobStatus::Pending,
            filename: None,
            error: None,
            ready: false,
        },
    }
}

async fn report_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Json<ProgressPayload> {
    Json(report(&state.store, &id))
}

async fn download_artifact(
    State(state): State<AppState>,
    method: Method,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    // HEAD is routed to GET handlers and would consume the one-shot artifact.
    if method != Method::GET {
        return Err(ApiError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "Invalid request method".into(),
        });
    }
    stream_artifact(&state.store, &id).await
}
