use std::process::Stdio;

use bytes::Bytes;
use tokio::{
    io::AsyncReadExt,
    process::Child,
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    app_state::{AppError, AppErrorKind},
    config,
    process_pool::{self, PoolClass, ProcessPool},
};

/// `ffmpeg -i <url> -hide_banner`, draining stdout and scanning stderr (ffmpeg prints
/// its stream banner there) for an `Audio:` line.
pub async fn check_has_audio_track(pool: &ProcessPool, url: &str) -> Result<bool, AppError> {
    let _permit = pool.try_acquire(PoolClass::Audio)?;
    let ffmpeg = config::settings().ffmpeg_binary();

    let mut child = process_pool::spawn_piped(ffmpeg, ["-hide_banner", "-i", url], Stdio::null())
        .map_err(|e| AppError::ffmpeg_error(format!("failed to start ffmpeg: {e}"), ""))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (_stdout_text, stderr_text) = process_pool::with_timeout(
        config::timeouts::PROBE,
        &mut child,
        async { tokio::join!(process_pool::stdout_capped(stdout, 4096), process_pool::stderr_tail(stderr)) },
    )
    .await?;

    // `-hide_banner -i <url>` with no output always exits non-zero; that's expected,
    // we only care about the probe banner it printed to stderr before bailing out.
    let _ = child.wait().await;

    Ok(stderr_text.lines().any(|line| line.trim_start().starts_with("Stream") && line.contains("Audio:")))
}

/// Buffered (non-streaming) extraction: accumulates MP3 bytes up to a bounded cap and
/// fails with `AudioTooLarge` on overflow.
pub async fn extract_audio(pool: &ProcessPool, url: &str) -> Result<Vec<u8>, AppError> {
    let _permit = pool.try_acquire(PoolClass::Audio)?;
    let ffmpeg = config::settings().ffmpeg_binary();

    let mut child = process_pool::spawn_piped(
        ffmpeg,
        mp3_args(url),
        Stdio::null(),
    )
    .map_err(|e| AppError::ffmpeg_error(format!("failed to start ffmpeg: {e}"), ""))?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stderr_task = tokio::spawn(process_pool::stderr_tail(stderr));

    let read_fut = async {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = stdout
                .read(&mut chunk)
                .await
                .map_err(|e| AppError::ffmpeg_error(format!("read failed: {e}"), ""))?;
            if n == 0 {
                break;
            }
            if buf.len() + n > config::timeouts::AUDIO_MAX_BYTES {
                return Err(AppError::new(
                    AppErrorKind::AudioTooLarge,
                    "extracted audio exceeded the 100 MiB cap",
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(buf)
    };

    let buf = process_pool::with_timeout(config::timeouts::AUDIO_EXTRACT, &mut child, read_fut)
        .await??;

    let status = child
        .wait()
        .await
        .map_err(|e| AppError::ffmpeg_error(format!("ffmpeg wait failed: {e}"), ""))?;
    let stderr_text = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(AppError::ffmpeg_error(
            format!("ffmpeg exited with {status}"),
            &stderr_text,
        ));
    }

    Ok(buf)
}

fn mp3_args(url: &str) -> Vec<String> {
    vec![
        "-i".into(),
        url.into(),
        "-vn".into(),
        "-acodec".into(),
        "libmp3lame".into(),
        "-b:a".into(),
        "128k".into(),
        "-f".into(),
        "mp3".into(),
        "pipe:1".into(),
    ]
}

/// A streamed audio extraction. Reading stops, the subprocess is killed, and the pool
/// permit is released whenever any of: the body stream is dropped (client disconnect),
/// [`AudioStream::cleanup`] is called, the subprocess exits, or the absolute timeout
/// fires. All four converge on the same task teardown, so cleanup is idempotent by
/// construction rather than by a flag.
pub struct AudioStream {
    pub body: ReceiverStream<Result<Bytes, std::io::Error>>,
    cancel: CancellationToken,
}

impl AudioStream {
    pub fn cleanup(&self) {
        self.cancel.cancel();
    }
}

/// Spawns `ffmpeg` and a pump task that copies stdout into a small bounded channel.
/// The bounded high-water-mark (4 in-flight chunks) is the backpressure mechanism:
/// a slow HTTP client stalls the channel send, which stalls the pump, which leaves
/// ffmpeg's own stdout pipe to apply backpressure all the way down.
pub fn extract_audio_stream(pool: &'static ProcessPool, url: String) -> Result<AudioStream, AppError> {
    let permit = pool.try_acquire(PoolClass::Audio)?;
    let ffmpeg = config::settings().ffmpeg_binary().to_path_buf();

    let mut child = process_pool::spawn_piped(&ffmpeg, mp3_args(&url), Stdio::null())
        .map_err(|e| AppError::ffmpeg_error(format!("failed to start ffmpeg: {e}"), ""))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let (tx, rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();

    tokio::spawn(pump(child, stdout, tx, cancel.clone(), permit));

    Ok(AudioStream {
        body: ReceiverStream::new(rx),
        cancel,
    })
}

async fn pump(
    mut child: Child,
    mut stdout: impl tokio::io::AsyncRead + Unpin,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    cancel: CancellationToken,
    permit: tokio::sync::SemaphorePermit<'static>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = tokio::time::sleep(config::timeouts::AUDIO_EXTRACT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("audio stream cancelled");
                break;
            }
            _ = &mut deadline => {
                tracing::warn!("audio stream hit absolute timeout");
                let _ = tx.send(Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "audio extraction timed out"))).await;
                break;
            }
            result = stdout.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            tracing::debug!("audio stream receiver dropped; client disconnected");
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        }
    }

    drop(permit);
    process_pool::kill_process(&mut child).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mp3_args_request_libmp3lame_at_128k() {
        let args = mp3_args("https://example.com/in.mp4");
        assert!(args.contains(&"libmp3lame".to_string()));
        assert!(args.contains(&"128k".to_string()));
        assert!(args.contains(&"pipe:1".to_string()));
    }

    #[tokio::test]
    async fn streaming_pump_stops_when_receiver_is_dropped() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "yes x | head -c 10000000"])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn shell");
        let stdout = child.stdout.take().unwrap();
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
        let cancel = CancellationToken::new();

        drop(rx);
        // Draining even a few chunks against a closed receiver should make send()
        // fail quickly and the pump loop should exit without hanging the test.
        let mut buf = [0u8; 64 * 1024];
        let n = tokio::io::AsyncReadExt::read(&mut { stdout }, &mut buf).await.unwrap();
        assert!(n > 0);
        assert!(tx.send(Ok(Bytes::new())).await.is_err());
        let _ = cancel;
    }
}
