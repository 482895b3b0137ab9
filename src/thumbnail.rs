use std::process::Stdio;

use crate::{
    app_state::AppError,
    config,
    process_pool::{self, PoolClass, ProcessPool},
    probe::VideoMetadata,
};

#[derive(Debug, Clone, Copy)]
pub struct ThumbnailOptions {
    pub timestamp: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self { timestamp: None, width: None, height: None, quality: 80 }
    }
}

/// Quality 1-100 maps inversely onto ffmpeg's `-q:v` 2-31 scale: quality 100 gives
/// the lowest (best) `-q:v`, quality 1 the highest (worst).
fn quality_to_qscale(quality: u8) -> u8 {
    let quality = quality.clamp(1, 100) as f64;
    let scaled = 2.0 + (100.0 - quality) / 99.0 * 29.0;
    scaled.round() as u8
}

/// `T = min(duration/4, 1)`, clamped to `duration - 0.1` so the timestamp never lands
/// on or past the last frame.
fn default_timestamp(duration: f64) -> f64 {
    let t = (duration / 4.0).min(1.0);
    t.min((duration - 0.1).max(0.0))
}

/// Runs `ffmpeg -ss T -i <url> -vframes 1 -vf scale=...:decrease -q:v Q -f image2
/// pipe:1`, returning a single JPEG frame.
pub async fn generate_thumbnail(
    pool: &ProcessPool,
    url: &str,
    source: &VideoMetadata,
    opts: &ThumbnailOptions,
) -> Result<Vec<u8>, AppError> {
    let _permit = pool.try_acquire(PoolClass::Encode)?;
    let ffmpeg = config::settings().ffmpeg_binary();

    let timestamp = opts
        .timestamp
        .unwrap_or_else(|| default_timestamp(source.duration))
        .clamp(0.0, (source.duration - 0.1).max(0.0));

    let width = opts.width.unwrap_or(source.width.max(0) as u32).min(2000);
    let height = opts.height.unwrap_or(source.height.max(0) as u32).min(2000);
    let scale = format!("scale={width}:{height}:force_original_aspect_ratio=decrease");
    let qscale = quality_to_qscale(opts.quality).to_string();

    let args = [
        "-ss",
        &timestamp.to_string(),
        "-i",
        url,
        "-vframes",
        "1",
        "-vf",
        &scale,
        "-q:v",
        &qscale,
        "-f",
        "image2",
        "pipe:1",
    ];

    let mut child = process_pool::spawn_piped(ffmpeg, args, Stdio::null())
        .map_err(|e| AppError::ffmpeg_error(format!("failed to start ffmpeg: {e}"), ""))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (jpeg_bytes, stderr_text) = process_pool::with_timeout(config::timeouts::THUMBNAIL, &mut child, async {
        let stdout_fut = async {
            let mut buf = Vec::new();
            let mut reader = stdout;
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.ok();
            buf
        };
        tokio::join!(stdout_fut, process_pool::stderr_tail(stderr))
    })
    .await?;

    let status = child
        .wait()
        .await
        .map_err(|e| AppError::ffmpeg_error(format!("ffmpeg wait failed: {e}"), &stderr_text))?;
    if !process_pool::exit_ok(status) {
        return Err(AppError::ffmpeg_error(format!("ffmpeg exited with {status}"), &stderr_text));
    }

    Ok(jpeg_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_maps_inversely_onto_qscale() {
        assert_eq!(quality_to_qscale(100), 2);
        assert_eq!(quality_to_qscale(1), 31);
        assert!(quality_to_qscale(50) > 2 && quality_to_qscale(50) < 31);
    }

    #[test]
    fn default_timestamp_is_quarter_duration_capped_at_one_second() {
        assert_eq!(default_timestamp(20.0), 1.0);
        assert_eq!(default_timestamp(2.0), 0.5);
    }

    #[test]
    fn default_timestamp_never_exceeds_near_end_of_clip() {
        let t = default_timestamp(0.5);
        assert!(t <= 0.4);
    }
}
