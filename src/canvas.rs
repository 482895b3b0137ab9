use std::{path::Path, process::Stdio};

use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Child,
};
use tokio_util::sync::CancellationToken;

use crate::{
    app_state::AppError,
    config,
    layout::RenderLayout,
    probe::VideoMetadata,
    process_pool::{self, PoolClass, ProcessPool, StallWatchdog},
    transcode::ProgressStdout,
    utils::TempFileHandle,
};

const BYTES_PER_PIXEL: u64 = 4;

/// Config JSON handed to the compositor worker process: background, camera overlay
/// geometry, rounding, and shadow, enough for an out-of-process worker to composite
/// frames without any other context.
#[derive(Debug, Serialize)]
struct RenderSpec<'a> {
    width: u32,
    height: u32,
    layout: &'a RenderLayout,
    camera_overlay_height: Option<u32>,
}

/// Scales the camera overlay to the main frame's width, preserving aspect ratio and
/// even dimensions, so it can be vstacked above the main frame before compositing.
/// The camera stream is probed first so its scaled height is known before the
/// render spec is built.
pub fn camera_overlay_height(main_width: u32, camera: &VideoMetadata) -> u32 {
    if camera.width <= 0 {
        return 0;
    }
    let scaled = main_width as f64 * camera.height as f64 / camera.width as f64;
    let rounded = scaled.round() as u32;
    (rounded / 2 * 2).max(2)
}

struct Stage {
    child: Child,
    label: &'static str,
}

async fn kill_all(stages: &mut [Stage]) {
    for stage in stages.iter_mut() {
        process_pool::kill_process(&mut stage.child).await;
    }
}

/// Runs the decoder → compositor → encoder pipeline. `decoder_args`
/// must already include the timeline filters and raw-RGBA output format; `encoder_args`
/// must already include the audio mixing filter graph, if any.
pub async fn run_pipeline(
    pool: &ProcessPool,
    decoder_args: Vec<String>,
    layout: &RenderLayout,
    output_width: u32,
    output_height: u32,
    camera: Option<&VideoMetadata>,
    encoder_args: Vec<String>,
    total_duration: std::time::Duration,
    cancel: CancellationToken,
    mut on_progress: impl FnMut(f32),
) -> Result<(), AppError> {
    let _permit = pool.try_acquire(PoolClass::Encode)?;
    let ffmpeg = config::settings().ffmpeg_binary();
    let compositor_bin = config::settings().canvas_compositor_binary();

    let spec = RenderSpec {
        width: output_width,
        height: output_height,
        layout,
        camera_overlay_height: camera.map(|c| camera_overlay_height(output_width, c)),
    };
    let config_file = TempFileHandle::new("json");
    tokio::fs::write(
        config_file.path(),
        serde_json::to_vec(&spec).map_err(AppError::from)?,
    )
    .await?;

    let mut decoder = process_pool::spawn_piped(ffmpeg, &decoder_args, Stdio::null())
        .map_err(|e| AppError::ffmpeg_error(format!("failed to start decoder: {e}"), ""))?;
    let mut compositor = process_pool::spawn_piped(
        compositor_bin,
        [config_file.path().to_string_lossy().into_owned()],
        Stdio::piped(),
    )
    .map_err(|e| AppError::ffmpeg_error(format!("failed to start compositor: {e}"), ""))?;
    let mut encoder = process_pool::spawn_piped(ffmpeg, &encoder_args, Stdio::piped())
        .map_err(|e| AppError::ffmpeg_error(format!("failed to start encoder: {e}"), ""))?;

    let decoder_stdout = decoder.stdout.take().expect("piped stdout");
    let compositor_stdin = compositor.stdin.take().expect("piped stdin");
    let compositor_stdout = compositor.stdout.take().expect("piped stdout");
    let encoder_stdin = encoder.stdin.take().expect("piped stdin");
    let encoder_stderr = encoder.stderr.take().expect("piped stderr");

    let decoder_stderr_drain = tokio::spawn(process_pool::stderr_tail(
        decoder.stderr.take().expect("piped stderr"),
    ));
    let compositor_stderr_drain = tokio::spawn(process_pool::stderr_tail(
        compositor.stderr.take().expect("piped stderr"),
    ));
    // The encoder's own output is written to a file path in `encoder_args`, not to
    // stdout, but every spawned child still gets a piped stdout that must be drained.
    let encoder_stdout_drain = tokio::spawn(process_pool::stdout_capped(
        encoder.stdout.take().expect("piped stdout"),
        4096,
    ));

    let frame_size = output_width as u64 * output_height as u64 * BYTES_PER_PIXEL;
    let pump_a = tokio::spawn(pump_bytes(decoder_stdout, compositor_stdin, frame_size));
    let pump_b = tokio::spawn(pump_bytes(compositor_stdout, encoder_stdin, frame_size));

    let mut progress = ProgressStdout::new(encoder_stderr);
    let mut watchdog = StallWatchdog::new();

    let drive = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::new(crate::app_state::AppErrorKind::InvalidState, "pipeline aborted"));
                }
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
                    return Err(AppError::new(crate::app_state::AppErrorKind::ProgressStalled, "canvas pipeline made no progress"));
                }
            }
        }
        Ok(())
    };

    let mut stages = [
        Stage { child: decoder, label: "decoder" },
        Stage { child: compositor, label: "compositor" },
        Stage { child: encoder, label: "encoder" },
    ];

    let outcome = process_pool::with_timeout(config::timeouts::TRANSCODE, &mut stages[2].child, drive).await;

    let _ = pump_a.await;
    let _ = pump_b.await;
    let decoder_stderr = decoder_stderr_drain.await.unwrap_or_default();
    let compositor_stderr = compositor_stderr_drain.await.unwrap_or_default();
    let _ = encoder_stdout_drain.await;

    let outcome = match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(e),
    };

    if outcome.is_err() {
        kill_all(&mut stages).await;
        config_file.cleanup().await;
        return outcome;
    }

    for stage in stages.iter_mut() {
        let status = stage
            .child
            .wait()
            .await
            .map_err(|e| AppError::ffmpeg_error(format!("{} wait failed: {e}", stage.label), ""))?;
        if !process_pool::exit_ok(status) {
            kill_all(&mut stages).await;
            config_file.cleanup().await;
            let tail = match stage.label {
                "decoder" => &decoder_stderr,
                "compositor" => &compositor_stderr,
                _ => "",
            };
            return Err(AppError::ffmpeg_error(
                format!("{} exited with {status}", stage.label),
                tail,
            ));
        }
    }

    config_file.cleanup().await;
    Ok(())
}

/// Copies fixed-size RGBA frames from one stage's stdout to the next stage's stdin.
/// Closing either end (EOF on read, broken pipe on write) ends the pump cleanly; the
/// caller's post-pipeline exit-status check is what surfaces a real failure.
async fn pump_bytes(
    mut from: impl tokio::io::AsyncRead + Unpin,
    mut to: impl tokio::io::AsyncWrite + Unpin,
    chunk_size: u64,
) {
    let chunk_size = chunk_size.clamp(1, 8 * 1024 * 1024) as usize;
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = to.shutdown().await;
}

pub fn path_display(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(width: i64, height: i64) -> VideoMetadata {
        VideoMetadata {
            duration: 10.0,
            width,
            height,
            fps: 30.0,
            video_codec: "h264".into(),
            audio_codec: None,
            audio_channels: None,
            sample_rate: None,
            bitrate: None,
            file_size: None,
        }
    }

    #[test]
    fn camera_overlay_scales_to_main_width_with_even_height() {
        let h = camera_overlay_height(1920, &camera(1280, 720));
        assert_eq!(h % 2, 0);
        assert!((h as f64 - 1080.0).abs() < 2.0);
    }

    #[test]
    fn zero_width_camera_yields_zero_height() {
        assert_eq!(camera_overlay_height(1920, &camera(0, 720)), 0);
    }

    #[tokio::test]
    async fn pump_bytes_stops_at_eof() {
        let data = vec![1u8, 2, 3, 4, 5];
        let mut out = Vec::new();
        pump_bytes(std::io::Cursor::new(data.clone()), &mut out, 2).await;
        assert_eq!(out, data);
    }
}
