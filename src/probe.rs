use std::{path::Path, process::Stdio};

use serde::{Deserialize, Serialize};

use crate::{
    app_state::AppError,
    config,
    process_pool::{self, PoolClass, ProcessPool},
};

/// Raw `ffprobe -show_streams -show_format` JSON, trimmed to the fields this service
/// actually reads. Field names and shapes follow ffprobe's own JSON schema.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    channels: Option<i64>,
    sample_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
}

/// The normalized record handed to every downstream component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub duration: f64,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub audio_channels: Option<i64>,
    pub sample_rate: Option<i64>,
    pub bitrate: Option<i64>,
    pub file_size: Option<i64>,
}

fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl FfprobeOutput {
    fn into_metadata(self) -> Result<VideoMetadata, AppError> {
        let video = self
            .streams
            .iter()
            .find(|s| s.codec_type == "video")
            .ok_or_else(|| {
                AppError::new(
                    crate::app_state::AppErrorKind::NoVideoStream,
                    "no video stream in source",
                )
            })?;
        let audio = self.streams.iter().find(|s| s.codec_type == "audio");

        let fps = video
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(0.0);

        let duration = self
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0)
            .max(0.0);

        Ok(VideoMetadata {
            duration,
            width: video.width.unwrap_or(0),
            height: video.height.unwrap_or(0),
            fps: round2(fps),
            video_codec: video.codec_name.clone().unwrap_or_default(),
            audio_codec: audio.and_then(|a| a.codec_name.clone()),
            audio_channels: audio.and_then(|a| a.channels),
            sample_rate: audio.and_then(|a| a.sample_rate.as_deref().and_then(|s| s.parse().ok())),
            bitrate: self.format.bit_rate.as_deref().and_then(|b| b.parse().ok()),
            file_size: self.format.size.as_deref().and_then(|s| s.parse().ok()),
        })
    }
}

/// Runs `ffprobe -show_format -show_streams` against `url`, respecting the probe pool
/// ceiling and a 30s absolute timeout.
pub async fn probe(pool: &ProcessPool, url: &str) -> Result<VideoMetadata, AppError> {
    let _permit = pool.try_acquire(PoolClass::Probe)?;
    let ffprobe = config::settings().ffprobe_binary();

    let mut child = process_pool::spawn_piped(
        ffprobe,
        [
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            url,
        ],
        Stdio::null(),
    )
    .map_err(|e| AppError::ffprobe_error(format!("failed to start ffprobe: {e}"), ""))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_fut = process_pool::stdout_capped(stdout, config::timeouts::PROBE_STDOUT_CAP);
    let stderr_fut = process_pool::stderr_tail(stderr);

    let (stdout_text, stderr_text) =
        process_pool::with_timeout(config::timeouts::PROBE, &mut child, async {
            tokio::join!(stdout_fut, stderr_fut)
        })
        .await?;

    let status = child
        .wait()
        .await
        .map_err(|e| AppError::ffprobe_error(format!("ffprobe wait failed: {e}"), &stderr_text))?;

    if !status.success() {
        return Err(AppError::ffprobe_error(
            format!("ffprobe exited with {status}"),
            &stderr_text,
        ));
    }

    let parsed: FfprobeOutput = serde_json::from_str(&stdout_text).map_err(|e| {
        AppError::ffprobe_error(
            format!("failed to parse ffprobe output: {e}"),
            &stderr_text,
        )
    })?;

    parsed.into_metadata()
}

pub fn path_for(path: impl AsRef<Path>) -> String {
    path.as_ref().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(video: &str, audio: Option<&str>) -> FfprobeOutput {
        let mut streams = vec![serde_json::from_str::<FfprobeStream>(video).unwrap()];
        if let Some(audio) = audio {
            streams.push(serde_json::from_str::<FfprobeStream>(audio).unwrap());
        }
        FfprobeOutput {
            streams,
            format: FfprobeFormat {
                duration: Some("12.345".into()),
                bit_rate: Some("128000".into()),
                size: Some("900000".into()),
            },
        }
    }

    #[test]
    fn maps_video_and_audio_streams() {
        let out = sample(
            r#"{"codec_type":"video","codec_name":"h264","width":1920,"height":1080,"r_frame_rate":"30000/1001"}"#,
            Some(r#"{"codec_type":"audio","codec_name":"aac","channels":2,"sample_rate":"48000"}"#),
        );
        let metadata = out.into_metadata().unwrap();
        assert_eq!(metadata.video_codec, "h264");
        assert_eq!(metadata.audio_codec.as_deref(), Some("aac"));
        assert_eq!(metadata.width, 1920);
        assert_eq!(metadata.height, 1080);
        assert!((metadata.fps - 29.97).abs() < 0.01);
        assert_eq!(metadata.duration, 12.345);
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        let out = FfprobeOutput {
            streams: vec![serde_json::from_str::<FfprobeStream>(
                r#"{"codec_type":"audio","codec_name":"aac"}"#,
            )
            .unwrap()],
            format: FfprobeFormat {
                duration: Some("1.0".into()),
                bit_rate: None,
                size: None,
            },
        };
        let err = out.into_metadata().unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::NoVideoStream);
    }

    #[test]
    fn absent_audio_stream_leaves_audio_fields_unset() {
        let out = sample(
            r#"{"codec_type":"video","codec_name":"h264","width":640,"height":360,"avg_frame_rate":"24/1"}"#,
            None,
        );
        let metadata = out.into_metadata().unwrap();
        assert!(metadata.audio_codec.is_none());
        assert!(metadata.audio_channels.is_none());
        assert!(metadata.sample_rate.is_none());
    }

    #[test]
    fn falls_back_to_avg_frame_rate() {
        let out = sample(
            r#"{"codec_type":"video","codec_name":"h264","width":640,"height":360,"avg_frame_rate":"25/1"}"#,
            None,
        );
        let metadata = out.into_metadata().unwrap();
        assert_eq!(metadata.fps, 25.0);
    }
}
