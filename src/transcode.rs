use std::{path::Path, process::Stdio, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::{
    app_state::{AppError, AppErrorKind},
    config,
    layout::{self, ProjectConfig, RenderLayout},
    loopback,
    probe::VideoMetadata,
    process_pool::{self, PoolClass, ProcessPool, StallWatchdog},
    timeline,
    utils::TempFileHandle,
};

/// The four presets the wire contract exposes; a restriction of ffmpeg's full
/// ten-value `-preset` enum to the set this service lets callers pick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Fast,
    Medium,
    Slow,
}

impl Default for Preset {
    fn default() -> Self {
        Preset::Medium
    }
}

impl Preset {
    fn as_arg(self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
        }
    }
}

impl FromStr for Preset {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ultrafast" => Ok(Preset::Ultrafast),
            "fast" => Ok(Preset::Fast),
            "medium" => Ok(Preset::Medium),
            "slow" => Ok(Preset::Slow),
            other => Err(AppError::bad_request(format!("unknown preset '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub crf: u8,
    pub preset: Preset,
    pub remux_only: bool,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            crf: 23,
            preset: Preset::Medium,
            remux_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeDecision {
    pub reencode_video: bool,
    pub reencode_audio: bool,
}

/// Decides whether video/audio need re-encoding. `remuxOnly` forces both flags
/// off regardless of what the source looks like.
pub fn decide_encode(source: &VideoMetadata, opts: &TranscodeOptions) -> EncodeDecision {
    if opts.remux_only {
        return EncodeDecision { reencode_video: false, reencode_audio: false };
    }
    let reencode_video = source.width as u32 > opts.max_width
        || source.height as u32 > opts.max_height
        || source.video_codec != "h264";
    let reencode_audio = source
        .audio_codec
        .as_deref()
        .map(|c| c != "aac")
        .unwrap_or(false);
    EncodeDecision { reencode_video, reencode_audio }
}

/// `scale=min(iw\,MAXW):min(ih\,MAXH):force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2`
/// — preserves aspect ratio down to the bounding box, then forces even dimensions.
pub fn resize_filter(max_width: u32, max_height: u32) -> String {
    format!(
        "scale='min({max_width},iw)':'min({max_height},ih)':force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2"
    )
}

/// Parses `-progress pipe:2` key=value lines, accepting `out_time_us`, `out_time_ms`,
/// and `out_time=HH:MM:SS.ms` — ffmpeg versions vary in which of the three they emit.
pub struct ProgressStdout<R> {
    lines: tokio::io::Lines<BufReader<R>>,
    time: Option<Duration>,
    speed: Option<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub time: Duration,
    pub speed: f32,
    pub done: bool,
}

impl ProgressUpdate {
    pub fn percent(&self, total: Duration) -> f32 {
        if total.is_zero() {
            return 0.0;
        }
        (self.time.as_secs_f32() / total.as_secs_f32() * 100.0).clamp(0.0, 100.0)
    }
}

fn parse_out_time(value: &str) -> Option<Duration> {
    if let Some((h, rest)) = value.split_once(':') {
        let (m, s) = rest.split_once(':')?;
        let h: f64 = h.parse().ok()?;
        let m: f64 = m.parse().ok()?;
        let s: f64 = s.parse().ok()?;
        let secs = h * 3600.0 + m * 60.0 + s;
        return Some(Duration::from_secs_f64(secs.max(0.0)));
    }
    None
}

impl<R: tokio::io::AsyncRead + Unpin> ProgressStdout<R> {
    pub fn new(stdout: R) -> Self {
        Self {
            lines: BufReader::new(stdout).lines(),
            time: None,
            speed: None,
        }
    }

    /// Cancellation-safe: yields the next complete progress record, or `None` at EOF.
    pub async fn next_update(&mut self) -> Option<ProgressUpdate> {
        while let Ok(Some(line)) = self.lines.next_line().await {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            match key {
                "progress" => {
                    let done = value == "end";
                    if let Some(time) = self.time {
                        let speed = self.speed.unwrap_or(0.0);
                        self.time = None;
                        self.speed = None;
                        return Some(ProgressUpdate { time, speed, done });
                    }
                }
                "speed" => {
                    let trimmed = value.trim().trim_end_matches('x');
                    self.speed = trimmed.parse().ok();
                }
                "out_time_us" | "out_time_ms" => {
                    if let Ok(micros) = value.parse::<u64>() {
                        self.time = Some(Duration::from_micros(micros));
                    }
                }
                "out_time" => {
                    if self.time.is_none() {
                        self.time = parse_out_time(value);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// Runs a single-pass ffmpeg transcode/remux from `input` to `output`, reporting
/// progress through `on_progress`.
pub async fn process_video(
    pool: &ProcessPool,
    input: &Path,
    output: &Path,
    source: &VideoMetadata,
    opts: &TranscodeOptions,
    mut on_progress: impl FnMut(f32),
) -> Result<(), AppError> {
    let decision = decide_encode(source, opts);
    let ffmpeg = config::settings().ffmpeg_binary();
    let _permit = pool.try_acquire(PoolClass::Encode)?;

    let mut args: Vec<String> = vec!["-y".into(), "-i".into(), path_str(input)];

    if decision.reencode_video {
        args.extend([
            "-vf".into(),
            resize_filter(opts.max_width, opts.max_height),
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            opts.crf.to_string(),
            "-preset".into(),
            opts.preset.as_arg().into(),
        ]);
    } else {
        args.extend(["-c:v".into(), "copy".into()]);
    }

    if decision.reencode_audio {
        args.extend(["-c:a".into(), "aac".into()]);
    } else if source.audio_codec.is_some() {
        args.extend(["-c:a".into(), "copy".into()]);
    } else {
        args.push("-an".into());
    }

    args.extend([
        "-movflags".into(),
        "+faststart".into(),
        "-progress".into(),
        "pipe:2".into(),
        path_str(output),
    ]);

    run_ffmpeg(ffmpeg, &args, Duration::from_secs_f64(source.duration), &mut on_progress).await
}

/// Renders an editor timeline with optional layout overlay.
pub async fn process_video_with_timeline(
    pool: &ProcessPool,
    http: &reqwest::Client,
    input: &Path,
    output: &Path,
    source: &VideoMetadata,
    project: &ProjectConfig,
    mut on_progress: impl FnMut(f32),
) -> Result<(), AppError> {
    let segments = timeline::normalize_segments(&project.timeline.segments, source.duration);
    let graph = timeline::build_filter_graph(&segments, 0, 0);
    let trimmed_duration = timeline::total_duration(&segments).max(0.1);

    let layout = layout::compute_render_layout(project, source);
    let mut background_file: Option<TempFileHandle> = None;

    let mut filter = format!("{};{}", graph.video_filter, graph.audio_filter);
    let (mut video_out, mut audio_out) = (graph.video_label.clone(), graph.audio_label.clone());

    if layout.should_apply {
        let mut resolved_layout = layout.clone();
        if let Some(path) = &layout.background_image_path {
            match download_background(http, path).await {
                Ok(handle) => {
                    resolved_layout.background_image_path =
                        Some(handle.path().to_string_lossy().into_owned());
                    background_file = Some(handle);
                }
                Err(e) => {
                    tracing::warn!("background image download failed, falling back to solid color: {e}");
                    resolved_layout.background_image_path = None;
                    resolved_layout.background_gradient = None;
                }
            }
        }
        let overlay = layout::build_layout_graph(&resolved_layout, &video_out, trimmed_duration);
        filter = format!("{filter};{overlay}");
        video_out = "[vout_layout]".to_string();
    }
    let _ = &mut audio_out;

    let ffmpeg = config::settings().ffmpeg_binary();
    let _permit = pool.try_acquire(PoolClass::Encode)?;

    let args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        path_str(input),
        "-filter_complex".into(),
        filter,
        "-map".into(),
        video_out,
        "-map".into(),
        audio_out,
        "-c:v".into(),
        "libx264".into(),
        "-c:a".into(),
        "aac".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-progress".into(),
        "pipe:2".into(),
        path_str(output),
    ];

    let result = run_ffmpeg(ffmpeg, &args, Duration::from_secs_f64(trimmed_duration), &mut on_progress).await;

    if let Some(handle) = background_file {
        handle.cleanup().await;
    }
    result
}

async fn download_background(http: &reqwest::Client, url_or_path: &str) -> Result<TempFileHandle, AppError> {
    let Ok(url) = reqwest::Url::parse(url_or_path) else {
        return Err(AppError::bad_request("background image path is not a URL"));
    };
    let response = loopback::get(http, &url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    let handle = TempFileHandle::new("bg");
    tokio::fs::write(handle.path(), &bytes).await?;
    Ok(handle)
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

async fn run_ffmpeg(
    ffmpeg: &Path,
    args: &[String],
    total_duration: Duration,
    on_progress: &mut impl FnMut(f32),
) -> Result<(), AppError> {
    let mut child = process_pool::spawn_piped(ffmpeg, args, Stdio::null())
        .map_err(|e| AppError::ffmpeg_error(format!("failed to start ffmpeg: {e}"), ""))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stdout_drain = tokio::spawn(process_pool::stdout_capped(stdout, 4096));

    let mut progress = ProgressStdout::new(stderr);
    let mut watchdog = StallWatchdog::new();

    let run = async {
        loop {
            tokio::select! {
                update = progress.next_update() => {
                    match update {
                        Some(update) => {
                            let percent = update.percent(total_duration);
                            watchdog.reset(percent);
                            on_progress(percent);
                            if update.done {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = watchdog.fire() => {
                    return Err(AppError::new(AppErrorKind::ProgressStalled, "ffmpeg made no progress"));
                }
            }
        }
        Ok(())
    };

    let outcome = process_pool::with_timeout(config::timeouts::TRANSCODE, &mut child, run).await;
    let _ = stdout_drain.await;

    let outcome = match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(stalled)) => {
            process_pool::kill_process(&mut child).await;
            Err(stalled)
        }
        Err(timeout_err) => Err(timeout_err),
    };
    outcome?;

    let status = child
        .wait()
        .await
        .map_err(|e| AppError::ffmpeg_error(format!("ffmpeg wait failed: {e}"), ""))?;
    if !process_pool::exit_ok(status) {
        return Err(AppError::ffmpeg_error(format!("ffmpeg exited with {status}"), ""));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(width: i64, height: i64, video_codec: &str, audio_codec: Option<&str>) -> VideoMetadata {
        VideoMetadata {
            duration: 10.0,
            width,
            height,
            fps: 30.0,
            video_codec: video_codec.to_string(),
            audio_codec: audio_codec.map(str::to_string),
            audio_channels: audio_codec.map(|_| 2),
            sample_rate: audio_codec.map(|_| 48000),
            bitrate: Some(1_000_000),
            file_size: Some(1_000_000),
        }
    }

    #[test]
    fn oversized_or_wrong_codec_forces_video_reencode() {
        let decision = decide_encode(&source(3840, 2160, "h264", None), &TranscodeOptions::default());
        assert!(decision.reencode_video);

        let decision = decide_encode(&source(640, 360, "hevc", None), &TranscodeOptions::default());
        assert!(decision.reencode_video);
    }

    #[test]
    fn matching_source_skips_reencode() {
        let decision = decide_encode(&source(640, 360, "h264", Some("aac")), &TranscodeOptions::default());
        assert!(!decision.reencode_video);
        assert!(!decision.reencode_audio);
    }

    #[test]
    fn non_aac_audio_forces_audio_reencode() {
        let decision = decide_encode(&source(640, 360, "h264", Some("mp3")), &TranscodeOptions::default());
        assert!(decision.reencode_audio);
    }

    #[test]
    fn remux_only_forces_both_flags_off() {
        let mut opts = TranscodeOptions::default();
        opts.remux_only = true;
        let decision = decide_encode(&source(3840, 2160, "hevc", Some("mp3")), &opts);
        assert!(!decision.reencode_video);
        assert!(!decision.reencode_audio);
    }

    #[test]
    fn preset_roundtrips_through_str() {
        assert!(matches!("slow".parse::<Preset>().unwrap(), Preset::Slow));
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[tokio::test]
    async fn progress_stdout_parses_out_time_us_and_speed() {
        let input = b"out_time_us=2000000\nspeed=1.5x\nprogress=continue\n".to_vec();
        let mut parser = ProgressStdout::new(std::io::Cursor::new(input));
        let update = parser.next_update().await.unwrap();
        assert_eq!(update.time, Duration::from_secs(2));
        assert!((update.speed - 1.5).abs() < 0.001);
        assert!(!update.done);
    }

    #[tokio::test]
    async fn progress_stdout_parses_human_readable_out_time() {
        let input = b"out_time=00:00:05.500000\nprogress=end\n".to_vec();
        let mut parser = ProgressStdout::new(std::io::Cursor::new(input));
        let update = parser.next_update().await.unwrap();
        assert!((update.time.as_secs_f64() - 5.5).abs() < 0.001);
        assert!(update.done);
    }

    #[test]
    fn resize_filter_enforces_even_dimensions_suffix() {
        let filter = resize_filter(1280, 720);
        assert!(filter.contains("trunc(iw/2)*2:trunc(ih/2)*2"));
    }
}
