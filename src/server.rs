use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use uuid::Uuid;

use crate::{
    app_state::{AppError, AppErrorKind, AppState},
    audio,
    job::JobProgress,
    layout::ProjectConfig,
    probe,
    process_pool::PoolClass,
    thumbnail::{self, ThumbnailOptions},
    transcode::Preset,
    utils,
    worker::{self, EditorJobParams, SimpleJobParams},
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/audio/status", get(audio_status))
        .route("/audio/check", post(audio_check))
        .route("/audio/extract", post(audio_extract))
        .route("/video/status", get(video_status))
        .route("/video/probe", post(video_probe))
        .route("/video/thumbnail", post(video_thumbnail))
        .route("/video/process", post(video_process))
        .route("/video/editor/process", post(video_editor_process))
        .route("/video/process/:job_id/status", get(job_status))
        .route("/video/editor/process/:job_id/status", get(job_status))
        .route("/video/process/:job_id/cancel", post(job_cancel))
        .route("/video/editor/process/:job_id/cancel", post(job_cancel))
        .route("/video/cleanup", post(video_cleanup))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    Json(json!({
        "name": "cap-media-server",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "/health",
            "/audio/status",
            "/audio/check",
            "/audio/extract",
            "/video/status",
            "/video/probe",
            "/video/thumbnail",
            "/video/process",
            "/video/editor/process",
            "/video/process/:jobId/status",
            "/video/process/:jobId/cancel",
            "/video/cleanup",
        ],
    }))
}

async fn health() -> impl IntoResponse {
    let ffmpeg = crate::config::settings().ffmpeg_binary();
    let output = tokio::process::Command::new(ffmpeg).arg("-version").output().await.ok();
    let available = output.as_ref().map(|o| o.status.success()).unwrap_or(false);
    let version = output
        .filter(|_| available)
        .and_then(|o| parse_ffmpeg_version(&String::from_utf8_lossy(&o.stdout)));
    Json(json!({
        "status": if available { "ok" } else { "degraded" },
        "ffmpeg": { "available": available, "version": version },
    }))
}

/// Extracts the version token from `ffmpeg -version`'s banner line, e.g.
/// "ffmpeg version 6.0-full_build-www.gyan.dev Copyright ..." -> "6.0-full_build-www.gyan.dev".
fn parse_ffmpeg_version(stdout: &str) -> Option<String> {
    let first_line = stdout.lines().next()?;
    let mut words = first_line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "version" {
            return words.next().map(str::to_string);
        }
    }
    None
}

async fn audio_status(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.pool.counts(PoolClass::Audio);
    Json(json!({
        "activeProcesses": counts.active,
        "canAcceptNewProcess": state.pool.can_accept(PoolClass::Audio),
    }))
}

#[derive(Debug, Deserialize)]
struct VideoUrlBody {
    #[serde(rename = "videoUrl")]
    video_url: String,
}

async fn audio_check(State(state): State<AppState>, Json(body): Json<VideoUrlBody>) -> Result<impl IntoResponse, AppError> {
    if body.video_url.trim().is_empty() {
        return Err(AppError::bad_request("videoUrl is required").with_details(vec!["videoUrl".into()]));
    }
    let has_audio = audio::check_has_audio_track(state.pool, &body.video_url).await?;
    Ok(Json(json!({ "hasAudio": has_audio })))
}

#[derive(Debug, Deserialize)]
struct AudioExtractBody {
    #[serde(rename = "videoUrl")]
    video_url: String,
    #[serde(default = "default_true")]
    stream: bool,
}

fn default_true() -> bool {
    true
}

async fn audio_extract(State(state): State<AppState>, Json(body): Json<AudioExtractBody>) -> Result<Response, AppError> {
    if body.video_url.trim().is_empty() {
        return Err(AppError::bad_request("videoUrl is required").with_details(vec!["videoUrl".into()]));
    }
    if !audio::check_has_audio_track(state.pool, &body.video_url).await? {
        return Err(AppError::new(AppErrorKind::NoAudioTrack, "source has no audio track"));
    }

    if body.stream {
        let stream = audio::extract_audio_stream(state.pool, body.video_url)?;
        let response = Response::builder()
            .status(axum::http::StatusCode::OK)
            .header(axum::http::header::CONTENT_TYPE, "audio/mpeg")
            .body(axum::body::Body::from_stream(stream.body))
            .expect("valid response");
        Ok(response)
    } else {
        let bytes = audio::extract_audio(state.pool, &body.video_url).await?;
        let response = Response::builder()
            .status(axum::http::StatusCode::OK)
            .header(axum::http::header::CONTENT_TYPE, "audio/mpeg")
            .body(axum::body::Body::from(bytes))
            .expect("valid response");
        Ok(response)
    }
}

async fn video_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "probe": state.pool.counts(PoolClass::Probe),
        "encode": state.pool.counts(PoolClass::Encode),
        "audio": state.pool.counts(PoolClass::Audio),
        "jobs": state.jobs.summaries(),
    }))
}

async fn video_probe(State(state): State<AppState>, Json(body): Json<VideoUrlBody>) -> Result<impl IntoResponse, AppError> {
    if body.video_url.trim().is_empty() {
        return Err(AppError::bad_request("videoUrl is required").with_details(vec!["videoUrl".into()]));
    }
    let metadata = probe::probe(state.pool, &body.video_url).await?;
    Ok(Json(json!({ "metadata": metadata })))
}

#[derive(Debug, Deserialize)]
struct ThumbnailBody {
    #[serde(rename = "videoUrl")]
    video_url: String,
    timestamp: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
    quality: Option<u8>,
}

async fn video_thumbnail(State(state): State<AppState>, Json(body): Json<ThumbnailBody>) -> Result<Response, AppError> {
    if body.video_url.trim().is_empty() {
        return Err(AppError::bad_request("videoUrl is required").with_details(vec!["videoUrl".into()]));
    }
    if body.width.is_some_and(|w| w > 2000) || body.height.is_some_and(|h| h > 2000) {
        return Err(AppError::bad_request("width/height must be <= 2000").with_details(vec!["width".into(), "height".into()]));
    }
    if body.quality.is_some_and(|q| q == 0 || q > 100) {
        return Err(AppError::bad_request("quality must be between 1 and 100").with_details(vec!["quality".into()]));
    }

    let source = probe::probe(state.pool, &body.video_url).await?;
    let opts = ThumbnailOptions {
        timestamp: body.timestamp,
        width: body.width,
        height: body.height,
        quality: body.quality.unwrap_or(80),
    };
    let jpeg = thumbnail::generate_thumbnail(state.pool, &body.video_url, &source, &opts).await?;
    Ok(Response::builder()
        .status(axum::http::StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "image/jpeg")
        .body(axum::body::Body::from(jpeg))
        .expect("valid response"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessBody {
    video_id: String,
    user_id: String,
    video_url: String,
    output_presigned_url: String,
    thumbnail_presigned_url: Option<String>,
    webhook_url: Option<String>,
    max_width: Option<u32>,
    max_height: Option<u32>,
    crf: Option<u8>,
    preset: Option<String>,
    #[serde(default)]
    remux_only: bool,
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    #[serde(rename = "jobId")]
    job_id: Uuid,
    status: &'static str,
    message: String,
}

async fn video_process(State(state): State<AppState>, Json(body): Json<ProcessBody>) -> Result<impl IntoResponse, AppError> {
    let mut details = Vec::new();
    if body.video_id.trim().is_empty() {
        details.push("videoId".to_string());
    }
    if body.user_id.trim().is_empty() {
        details.push("userId".to_string());
    }
    if body.video_url.trim().is_empty() {
        details.push("videoUrl".to_string());
    }
    if body.output_presigned_url.trim().is_empty() {
        details.push("outputPresignedUrl".to_string());
    }
    if body.max_width.is_some_and(|w| w > 4096) {
        details.push("maxWidth".to_string());
    }
    if body.max_height.is_some_and(|h| h > 4096) {
        details.push("maxHeight".to_string());
    }
    if body.crf.is_some_and(|c| c > 51) {
        details.push("crf".to_string());
    }
    let preset = match body.preset.as_deref() {
        Some(raw) => match raw.parse::<Preset>() {
            Ok(p) => Some(p),
            Err(_) => {
                details.push("preset".to_string());
                None
            }
        },
        None => None,
    };
    if !details.is_empty() {
        return Err(AppError::bad_request("request validation failed").with_details(details));
    }

    if !state.pool.can_accept(PoolClass::Encode) {
        return Err(AppError::server_busy("encode pool is at capacity"));
    }

    let handle = state.jobs.create(body.video_id, body.user_id, body.webhook_url);
    let params = SimpleJobParams {
        video_url: body.video_url,
        output_presigned_url: body.output_presigned_url,
        thumbnail_presigned_url: body.thumbnail_presigned_url,
        max_width: body.max_width.unwrap_or(1920),
        max_height: body.max_height.unwrap_or(1080),
        crf: body.crf.unwrap_or(23),
        preset: preset.unwrap_or_default(),
        remux_only: body.remux_only,
    };
    let job_id = handle.job_id;
    tokio::spawn(worker::run_simple_job(state, handle, params));

    Ok(Json(QueuedResponse { job_id, status: "queued", message: "job accepted".to_string() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditorProcessBody {
    video_id: String,
    user_id: String,
    video_url: String,
    output_presigned_url: String,
    webhook_url: Option<String>,
    project_config: ProjectConfig,
}

async fn video_editor_process(
    State(state): State<AppState>,
    Json(body): Json<EditorProcessBody>,
) -> Result<impl IntoResponse, AppError> {
    let mut details = Vec::new();
    if body.video_id.trim().is_empty() {
        details.push("videoId".to_string());
    }
    if body.user_id.trim().is_empty() {
        details.push("userId".to_string());
    }
    if body.video_url.trim().is_empty() {
        details.push("videoUrl".to_string());
    }
    if body.output_presigned_url.trim().is_empty() {
        details.push("outputPresignedUrl".to_string());
    }
    if body.project_config.timeline.segments.is_empty() {
        details.push("projectConfig.timeline.segments".to_string());
    }
    if !details.is_empty() {
        return Err(AppError::new(AppErrorKind::UnsupportedConfig, "project config failed normalization").with_details(details));
    }

    if !state.pool.can_accept(PoolClass::Encode) {
        return Err(AppError::server_busy("encode pool is at capacity"));
    }

    let handle = state.jobs.create(body.video_id, body.user_id, body.webhook_url);
    let params = EditorJobParams {
        video_url: body.video_url,
        output_presigned_url: body.output_presigned_url,
        project: body.project_config,
    };
    let job_id = handle.job_id;
    tokio::spawn(worker::run_editor_job(state, handle, params));

    Ok(Json(QueuedResponse { job_id, status: "queued", message: "job accepted".to_string() }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: axum::http::HeaderMap,
) -> Result<Response, AppError> {
    let wants_sse = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));

    let Some(snapshot) = state.jobs.snapshot(job_id) else {
        return Err(AppError::not_found("job not found"));
    };

    if !wants_sse {
        return Ok(Json(snapshot).into_response());
    }

    let Some(receiver) = state.jobs.subscribe(job_id) else {
        return Err(AppError::not_found("job not found"));
    };

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    tokio::spawn(pump_job_events(snapshot, receiver, tx));
    let stream = ReceiverStream::new(rx).map(|progress| Ok::<Event, Infallible>(sse_event(&progress)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

fn sse_event(progress: &JobProgress) -> Event {
    Event::default().json_data(progress).unwrap_or_else(|_| Event::default().data("{}"))
}

/// Feeds the SSE channel: the current snapshot first, then once-per-second broadcast
/// updates, stopping after the first terminal `JobProgress` or once the client
/// disconnects (detected via the channel send failing).
async fn pump_job_events(
    initial: JobProgress,
    mut receiver: tokio::sync::broadcast::Receiver<JobProgress>,
    tx: tokio::sync::mpsc::Sender<JobProgress>,
) {
    let already_terminal = initial.phase.is_terminal();
    if tx.send(initial).await.is_err() || already_terminal {
        return;
    }

    let mut last_sent = tokio::time::Instant::now();
    loop {
        match receiver.recv().await {
            Ok(progress) => {
                let elapsed = last_sent.elapsed();
                if elapsed < crate::config::timeouts::SSE_TICK {
                    tokio::time::sleep(crate::config::timeouts::SSE_TICK - elapsed).await;
                }
                last_sent = tokio::time::Instant::now();
                let terminal = progress.phase.is_terminal();
                if tx.send(progress).await.is_err() || terminal {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    success: bool,
}

async fn job_cancel(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Result<impl IntoResponse, AppError> {
    let snapshot = state.jobs.cancel(job_id)?;
    if let Some(url) = state.jobs.webhook_target(job_id) {
        let http = state.http.clone();
        tokio::spawn(async move { crate::job::post_webhook(&http, &url, &snapshot).await });
    }
    Ok(Json(CancelResponse { success: true }))
}

async fn video_cleanup() -> impl IntoResponse {
    let cleaned = utils::purge_stale(crate::config::timeouts::JOB_TTL).await.unwrap_or(0);
    Json(json!({ "success": true, "cleanedFiles": cleaned }))
}

#[cfg(test)]
mod tests {
    use super::parse_ffmpeg_version;

    #[test]
    fn parses_gyan_build_banner() {
        let stdout = "ffmpeg version 6.0-full_build-www.gyan.dev Copyright (c) 2000-2023 the FFmpeg developers\nbuilt with gcc\n";
        assert_eq!(parse_ffmpeg_version(stdout), Some("6.0-full_build-www.gyan.dev".to_string()));
    }

    #[test]
    fn parses_distro_banner() {
        let stdout = "ffmpeg version 4.4.2-0ubuntu0.22.04.1 Copyright (c) 2000-2021 the FFmpeg developers";
        assert_eq!(parse_ffmpeg_version(stdout), Some("4.4.2-0ubuntu0.22.04.1".to_string()));
    }

    #[test]
    fn missing_version_token_returns_none() {
        assert_eq!(parse_ffmpeg_version("garbage output"), None);
    }

    #[test]
    fn empty_output_returns_none() {
        assert_eq!(parse_ffmpeg_version(""), None);
    }
}
