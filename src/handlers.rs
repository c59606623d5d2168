use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::non_empty,
    error::ApiError,
    extractor::{DownloadTask, Extractor, OutputFormat, ProgressUpdate, Quality, VideoInfo},
    ledger::{Job, JobLedger, JobStatus},
    resolver::resolve_output_file,
};

const LANDING_PAGE: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    pub ledger: JobLedger,
    pub extractor: Arc<dyn Extractor>,
    pub downloads_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct VideoInfoRequest {
    url: String,
    #[serde(default)]
    cookie: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: String,
    #[serde(default = "default_format")]
    format: String,
    #[serde(default = "default_quality")]
    quality: String,
    #[serde(default)]
    cookie: Option<String>,
}

fn default_format() -> String {
    "mp4".to_string()
}

fn default_quality() -> String {
    "highest".to_string()
}

#[derive(Debug, Serialize)]
pub struct DownloadFinished {
    download_id: String,
    status: JobStatus,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/health", get(health))
        .route("/facebook/video-info", post(video_info))
        .route("/facebook/download", post(start_download))
        .route("/facebook/progress/{download_id}", get(progress))
        .route("/facebook/download-file/{download_id}", get(download_file))
        .with_state(state)
}

async fn landing_page() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "jobs": state.ledger.len()}))
}

async fn video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> Result<Json<VideoInfo>, ApiError> {
    let url = validate_url(&payload.url)?;
    let cookie = payload.cookie.as_deref().and_then(non_empty);

    let info = state
        .extractor
        .fetch_info(url, cookie)
        .await
        .map_err(|error| {
            warn!("Metadata extraction failed for {url:?}: {error}");
            ApiError::bad_request(format!("Error extracting FB video info: {error}"))
        })?;

    Ok(Json(info))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadFinished>, ApiError> {
    let url = validate_url(&payload.url)?.to_string();
    let job_id = Uuid::new_v4().to_string();
    state.ledger.start(&job_id);

    let task = DownloadTask {
        url,
        format: OutputFormat::parse(&payload.format),
        quality: Quality::parse(&payload.quality),
        job_id: job_id.clone(),
        cookie: payload
            .cookie
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string),
        output_dir: state.downloads_dir.clone(),
    };

    // Runs detached so a dropped connection does not abort the job.
    let outcome = tokio::spawn(run_job(state.clone(), task))
        .await
        .unwrap_or_else(|join_error| {
            let message = format!("download task aborted: {join_error}");
            state.ledger.overwrite(&job_id, Job::failed(message.clone()));
            Err(message)
        });

    match outcome {
        Ok(_) => Ok(Json(DownloadFinished {
            download_id: job_id,
            status: JobStatus::Completed,
        })),
        Err(message) => Err(ApiError::internal(format!("FB download failed: {message}"))),
    }
}

/// Downloads, resolves the output file, and records the terminal state.
async fn run_job(state: AppState, task: DownloadTask) -> Result<PathBuf, String> {
    let on_progress = {
        let ledger = state.ledger.clone();
        let job_id = task.job_id.clone();
        move |update: ProgressUpdate| ledger.overwrite(&job_id, update.into_job())
    };

    let outcome = async {
        state
            .extractor
            .download(&task, &on_progress)
            .await
            .map_err(|error| error.to_string())?;
        resolve_output_file(&state.downloads_dir, &task.job_id)
            .await
            .map_err(|error| error.to_string())
    }
    .await;

    match &outcome {
        Ok(path) => {
            info!("Job {} completed: {:?}", task.job_id, path);
            state
                .ledger
                .overwrite(&task.job_id, Job::completed(path.to_string_lossy().to_string()));
        }
        Err(message) => {
            error!("Job {} failed: {message}", task.job_id);
            state.ledger.overwrite(&task.job_id, Job::failed(message.clone()));
        }
    }

    outcome
}

async fn progress(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .ledger
        .get(&download_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Download not found"))
}

async fn download_file(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .ledger
        .get(&download_id)
        .ok_or_else(|| ApiError::not_found("Download not found"))?;

    if job.status != JobStatus::Completed {
        return Err(ApiError::bad_request("Download not completed"));
    }

    let path = job
        .filename
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(ApiError::not_found("File not found")),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not read downloaded file: {error}"
            )));
        }
    };

    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            ApiError::not_found("File not found")
        } else {
            ApiError::internal(format!("Could not open downloaded file: {error}"))
        }
    })?;

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn validate_url(raw: &str) -> Result<&str, ApiError> {
    let url = non_empty(raw).ok_or_else(|| ApiError::bad_request("A video URL is required."))?;
    let parsed = Url::parse(url)
        .map_err(|error| ApiError::bad_request(format!("Invalid URL {url:?}: {error}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::bad_request("Only http and https URLs are supported."));
    }

    Ok(url)
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}
