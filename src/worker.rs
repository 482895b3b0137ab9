use reqwest::Url;
use uuid::Uuid;

use crate::{
    app_state::{AppError, AppErrorKind, AppState},
    canvas,
    config,
    job::{self, JobHandle, JobPhase},
    layout::{self, ProjectConfig},
    probe::{self, VideoMetadata},
    s3,
    thumbnail::{self, ThumbnailOptions},
    timeline,
    transcode::{self, Preset, TranscodeOptions},
    utils::TempFileHandle,
};

/// Request shape accepted by `/video/process`, already schema-validated by the handler.
pub struct SimpleJobParams {
    pub video_url: String,
    pub output_presigned_url: String,
    pub thumbnail_presigned_url: Option<String>,
    pub max_width: u32,
    pub max_height: u32,
    pub crf: u8,
    pub preset: Preset,
    pub remux_only: bool,
}

/// Request shape accepted by `/video/editor/process`.
pub struct EditorJobParams {
    pub video_url: String,
    pub output_presigned_url: String,
    pub project: ProjectConfig,
}

enum StepOutcome<T> {
    Ready(T),
    Cancelled,
}

/// Races a future against the job's cancellation token. Subprocess-backed futures own
/// a `tokio::process::Child` with `kill_on_drop(true)`, so losing the race and dropping
/// the future is enough to kill the in-flight subprocess.
async fn race<T>(
    handle: &JobHandle,
    fut: impl std::future::Future<Output = Result<T, AppError>>,
) -> Result<StepOutcome<T>, AppError> {
    tokio::select! {
        _ = handle.cancel.cancelled() => Ok(StepOutcome::Cancelled),
        result = fut => result.map(StepOutcome::Ready),
    }
}

fn is_cancel_signal(err: &AppError) -> bool {
    err.kind == AppErrorKind::InvalidState
}

fn notify(state: &AppState, job_id: Uuid) {
    let Some(url) = state.jobs.webhook_target(job_id) else {
        return;
    };
    let Some(snapshot) = state.jobs.snapshot(job_id) else {
        return;
    };
    let http = state.http.clone();
    tokio::spawn(async move { job::post_webhook(&http, &url, &snapshot).await });
}

fn transition(state: &AppState, job_id: Uuid, phase: JobPhase, message: Option<String>) -> Result<(), AppError> {
    state.jobs.transition(job_id, phase, message)?;
    notify(state, job_id);
    Ok(())
}

fn report_progress(state: &AppState, job_id: Uuid, percent: f32) {
    state.jobs.set_progress(job_id, percent, None);
    notify(state, job_id);
}

fn fail(state: &AppState, job_id: Uuid, err: &AppError) {
    state.jobs.fail(job_id, err.message.clone());
    notify(state, job_id);
}

/// Fetches `video_url` into a fresh scratch file and probes it, observing cancellation
/// at both the download and probe boundaries.
async fn fetch_source(
    state: &AppState,
    handle: &JobHandle,
    video_url: &str,
) -> Result<Option<(TempFileHandle, VideoMetadata)>, AppError> {
    transition(state, handle.job_id, JobPhase::Downloading, None)?;
    let url = Url::parse(video_url).map_err(|e| AppError::bad_request(format!("invalid videoUrl: {e}")))?;

    let input = match crate::download::download_to_temp(&state.http, &url, "src", &handle.cancel).await {
        Ok((input, _written)) => input,
        Err(e) if is_cancel_signal(&e) => return Ok(None),
        Err(e) => return Err(e),
    };

    transition(state, handle.job_id, JobPhase::Probing, None)?;
    let input_path = probe::path_for(input.path());
    let metadata = match race(handle, probe::probe(state.pool, &input_path)).await? {
        StepOutcome::Ready(m) => m,
        StepOutcome::Cancelled => {
            input.cleanup().await;
            return Ok(None);
        }
    };

    Ok(Some((input, metadata)))
}

/// Drives `/video/process`: download, probe, single-pass transcode, upload, optional
/// thumbnail, complete.
pub async fn run_simple_job(state: AppState, handle: JobHandle, params: SimpleJobParams) {
    let job_id = handle.job_id;

    let fetched = match fetch_source(&state, &handle, &params.video_url).await {
        Ok(Some(fetched)) => fetched,
        Ok(None) => return,
        Err(e) => {
            fail(&state, job_id, &e);
            return;
        }
    };
    let (input, source) = fetched;

    transition(&state, job_id, JobPhase::Processing, None).ok();
    let output = TempFileHandle::new("mp4");
    let opts = TranscodeOptions {
        max_width: params.max_width,
        max_height: params.max_height,
        crf: params.crf,
        preset: params.preset,
        remux_only: params.remux_only,
    };

    let state_ref = &state;
    let process = transcode::process_video(state.pool, input.path(), output.path(), &source, &opts, |p| {
        report_progress(state_ref, job_id, p);
    });
    let transcoded = match race(&handle, process).await {
        Ok(StepOutcome::Ready(())) => true,
        Ok(StepOutcome::Cancelled) => false,
        Err(e) => {
            fail(&state, job_id, &e);
            input.cleanup().await;
            output.cleanup().await;
            return;
        }
    };
    if !transcoded {
        input.cleanup().await;
        output.cleanup().await;
        return;
    }

    if finish_job(
        &state,
        &handle,
        &input,
        &output,
        &params.output_presigned_url,
        params.thumbnail_presigned_url.as_deref(),
        &source,
    )
    .await
    .is_err()
    {
        // error already recorded by finish_job
    }

    input.cleanup().await;
    output.cleanup().await;
}

/// Drives `/video/editor/process`: download, probe, timeline/layout render (simple
/// ffmpeg filter graph or the canvas pipeline, per `CAP_CANVAS_RENDERER`), upload,
/// complete. The editor variant has no `thumbnailPresignedUrl` field.
pub async fn run_editor_job(state: AppState, handle: JobHandle, params: EditorJobParams) {
    let job_id = handle.job_id;

    let fetched = match fetch_source(&state, &handle, &params.video_url).await {
        Ok(Some(fetched)) => fetched,
        Ok(None) => return,
        Err(e) => {
            fail(&state, job_id, &e);
            return;
        }
    };
    let (input, source) = fetched;

    transition(&state, job_id, JobPhase::Processing, None).ok();
    let output = TempFileHandle::new("mp4");

    let result = if config::settings().canvas_renderer() {
        run_canvas_render(&state, &handle, &input, &output, &source, &params.project).await
    } else {
        let state_ref = &state;
        let fut = transcode::process_video_with_timeline(
            state.pool,
            &state.http,
            input.path(),
            output.path(),
            &source,
            &params.project,
            |p| report_progress(state_ref, job_id, p),
        );
        race(&handle, fut).await
    };

    let rendered = match result {
        Ok(StepOutcome::Ready(())) => true,
        Ok(StepOutcome::Cancelled) => false,
        Err(e) => {
            fail(&state, job_id, &e);
            input.cleanup().await;
            output.cleanup().await;
            return;
        }
    };
    if !rendered {
        input.cleanup().await;
        output.cleanup().await;
        return;
    }

    if finish_job(&state, &handle, &input, &output, &params.output_presigned_url, None, &source)
        .await
        .is_err()
    {
        // error already recorded by finish_job
    }

    input.cleanup().await;
    output.cleanup().await;
}

/// Builds and runs the three-process canvas pipeline for an editor render. The
/// decoder trims/resizes the source (and vstacks an optional camera feed) to raw
/// RGBA; the encoder re-reads the source for its audio track.
async fn run_canvas_render(
    state: &AppState,
    handle: &JobHandle,
    input: &TempFileHandle,
    output: &TempFileHandle,
    source: &VideoMetadata,
    project: &ProjectConfig,
) -> Result<StepOutcome<()>, AppError> {
    let segments = timeline::normalize_segments(&project.timeline.segments, source.duration);
    let trimmed_duration = timeline::total_duration(&segments).max(0.1);
    let render_layout = layout::compute_render_layout(project, source);
    let fps = if source.fps > 0.0 { source.fps } else { 30.0 };

    let camera = match &project.camera_url {
        Some(url) => match race(handle, probe::probe(state.pool, url)).await? {
            StepOutcome::Ready(meta) => Some((url.clone(), meta)),
            StepOutcome::Cancelled => return Ok(StepOutcome::Cancelled),
        },
        None => None,
    };

    let input_path = probe::path_for(input.path());
    let output_path = probe::path_for(output.path());
    let (decoder_args, encoder_args) = build_canvas_args(
        &input_path,
        &output_path,
        camera.as_ref().map(|(url, meta)| (url.as_str(), meta)),
        &segments,
        render_layout.output_width,
        render_layout.output_height,
        fps,
    );

    let job_id = handle.job_id;
    let outcome = canvas::run_pipeline(
        state.pool,
        decoder_args,
        &render_layout,
        render_layout.output_width,
        render_layout.output_height,
        camera.as_ref().map(|(_, meta)| meta),
        encoder_args,
        std::time::Duration::from_secs_f64(trimmed_duration),
        handle.cancel.clone(),
        |p| report_progress(state, job_id, p),
    )
    .await;

    match outcome {
        Ok(()) => Ok(StepOutcome::Ready(())),
        Err(e) if is_cancel_signal(&e) => Ok(StepOutcome::Cancelled),
        Err(e) => Err(e),
    }
}

fn build_canvas_args(
    input_path: &str,
    output_path: &str,
    camera: Option<(&str, &VideoMetadata)>,
    segments: &[timeline::TimelineSegment],
    output_width: u32,
    output_height: u32,
    fps: f64,
) -> (Vec<String>, Vec<String>) {
    let video_graph = timeline::build_filter_graph(segments, 0, 0);
    let fps_str = format!("{fps:.3}");

    let mut decoder_filter = video_graph.video_filter.clone();
    let mut video_label = video_graph.video_label.clone();

    let mut decoder_args = vec!["-y".to_string(), "-i".to_string(), input_path.to_string()];
    if let Some((camera_url, camera_meta)) = camera {
        let camera_height = canvas::camera_overlay_height(output_width, camera_meta);
        decoder_args.push("-i".to_string());
        decoder_args.push(camera_url.to_string());
        decoder_filter.push_str(&format!(
            ";{video_label}scale={output_width}:-2[vmain];[1:v]scale={output_width}:{camera_height}[vcam];[vmain][vcam]vstack=inputs=2[vcombined]"
        ));
        video_label = "[vcombined]".to_string();
    }
    decoder_filter.push_str(&format!(
        ";{video_label}scale={output_width}:{output_height}:force_original_aspect_ratio=decrease,pad={output_width}:{output_height}:(ow-iw)/2:(oh-ih)/2,format=rgba[vraw]"
    ));

    decoder_args.extend([
        "-filter_complex".to_string(),
        decoder_filter,
        "-map".to_string(),
        "[vraw]".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-s".to_string(),
        format!("{output_width}x{output_height}"),
        "-r".to_string(),
        fps_str.clone(),
        "pipe:1".to_string(),
    ]);

    let audio_graph = timeline::build_filter_graph(segments, 1, 1);
    let encoder_args = vec![
        "-y".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgba".to_string(),
        "-s".to_string(),
        format!("{output_width}x{output_height}"),
        "-r".to_string(),
        fps_str,
        "-i".to_string(),
        "pipe:0".to_string(),
        "-i".to_string(),
        input_path.to_string(),
        "-filter_complex".to_string(),
        audio_graph.audio_filter,
        "-map".to_string(),
        "0:v".to_string(),
        "-map".to_string(),
        audio_graph.audio_label,
        "-c:v".to_string(),
        "libx264".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-progress".to_string(),
        "pipe:2".to_string(),
        output_path.to_string(),
    ];

    (decoder_args, encoder_args)
}

/// Uploads the rendered output (and, if requested, a thumbnail) and marks the job
/// complete. Errors here fail the job directly rather than bubbling up, since the
/// caller's only remaining action is temp-file cleanup either way.
async fn finish_job(
    state: &AppState,
    handle: &JobHandle,
    input: &TempFileHandle,
    output: &TempFileHandle,
    output_presigned_url: &str,
    thumbnail_presigned_url: Option<&str>,
    source: &VideoMetadata,
) -> Result<(), ()> {
    let job_id = handle.job_id;
    transition(state, job_id, JobPhase::Uploading, None).ok();

    let output_url = match Url::parse(output_presigned_url) {
        Ok(u) => u,
        Err(e) => {
            fail(state, job_id, &AppError::bad_request(format!("invalid outputPresignedUrl: {e}")));
            return Err(());
        }
    };
    if let Err(e) = s3::upload_file_to_s3(&state.http, &output_url, output.path(), "video/mp4").await {
        fail(state, job_id, &e);
        return Err(());
    }

    if let Some(thumb_target) = thumbnail_presigned_url {
        transition(state, job_id, JobPhase::GeneratingThumbnail, None).ok();
        let input_path = probe::path_for(input.path());
        match thumbnail::generate_thumbnail(state.pool, &input_path, source, &ThumbnailOptions::default()).await {
            Ok(jpeg) => {
                let thumb_url = match Url::parse(thumb_target) {
                    Ok(u) => u,
                    Err(e) => {
                        fail(state, job_id, &AppError::bad_request(format!("invalid thumbnailPresignedUrl: {e}")));
                        return Err(());
                    }
                };
                if let Err(e) = s3::upload_to_s3(&state.http, &thumb_url, jpeg, "image/jpeg").await {
                    fail(state, job_id, &e);
                    return Err(());
                }
            }
            Err(e) => {
                fail(state, job_id, &e);
                return Err(());
            }
        }
    }

    let metadata = serde_json::to_value(source).ok();
    state.jobs.complete(job_id, output_presigned_url.to_string(), metadata);
    notify(state, job_id);
    Ok(())
}
