use std::{error::Error, fmt::Display};

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::{job::JobRegistry, process_pool::ProcessPool};

/// Shared, cheaply-cloneable application state injected into every handler.
///
/// All fields are `'static` references, leaked once at startup (`Box::leak`) rather
/// than threading an `Arc` through every call site — there is exactly one of each
/// for the process lifetime.
#[derive(Debug, Clone)]
pub struct AppState {
    pub pool: &'static ProcessPool,
    pub jobs: &'static JobRegistry,
    pub http: reqwest::Client,
    pub started_at: time::OffsetDateTime,
}

/// The wire error shape used by every endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub message: String,
    pub details: Option<Vec<String>>,
    #[serde(rename = "code")]
    pub kind: AppErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppErrorKind {
    InvalidRequest,
    NoAudioTrack,
    NoVideoStream,
    ServerBusy,
    Timeout,
    FfprobeError,
    FfmpegError,
    NotFound,
    InvalidState,
    UnsupportedConfig,
    UploadFailed,
    AudioTooLarge,
    ProgressStalled,
}

impl AppErrorKind {
    fn status(self) -> StatusCode {
        match self {
            AppErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            AppErrorKind::NoAudioTrack => StatusCode::UNPROCESSABLE_ENTITY,
            AppErrorKind::NoVideoStream => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
            AppErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppErrorKind::FfprobeError => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::FfmpegError => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::NotFound => StatusCode::NOT_FOUND,
            AppErrorKind::InvalidState => StatusCode::BAD_REQUEST,
            AppErrorKind::UnsupportedConfig => StatusCode::BAD_REQUEST,
            AppErrorKind::UploadFailed => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::AudioTooLarge => StatusCode::INTERNAL_SERVER_ERROR,
            AppErrorKind::ProgressStalled => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl Error for AppError {}

impl Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl AppError {
    pub fn new(kind: AppErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            kind,
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(AppErrorKind::InvalidRequest, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(AppErrorKind::NotFound, msg)
    }

    pub fn server_busy(msg: impl Into<String>) -> Self {
        Self::new(AppErrorKind::ServerBusy, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Timeout, msg)
    }

    /// Clips stderr output to a bounded tail so `details` never blows up a response body.
    pub fn ffmpeg_error(msg: impl Into<String>, stderr_tail: &str) -> Self {
        Self::new(AppErrorKind::FfmpegError, msg).with_details(vec![clip(stderr_tail)])
    }

    pub fn ffprobe_error(msg: impl Into<String>, stderr_tail: &str) -> Self {
        Self::new(AppErrorKind::FfprobeError, msg).with_details(vec![clip(stderr_tail)])
    }
}

fn clip(s: &str) -> String {
    const MAX: usize = 2000;
    if s.len() > MAX {
        format!("{}…", &s[..MAX])
    } else {
        s.to_string()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(AppErrorKind::FfmpegError, err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(value.to_string()),
            _ => Self::new(AppErrorKind::FfmpegError, value.to_string()),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        Self::new(AppErrorKind::UploadFailed, value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::bad_request(value.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.kind.status();
        (status, Json(self)).into_response()
    }
}
