use std::{
    ffi::OsStr,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::{Semaphore, SemaphorePermit},
};

use crate::{app_state::AppError, config};

/// The three bounded subprocess classes. Each ceiling is a `tokio::sync::Semaphore`
/// rather than a bare counter, owned by an injectable struct, so admission is atomic
/// and there is nothing to leak across tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClass {
    Audio,
    Probe,
    Encode,
}

impl PoolClass {
    fn label(self) -> &'static str {
        match self {
            PoolClass::Audio => "audio",
            PoolClass::Probe => "probe",
            PoolClass::Encode => "encode",
        }
    }
}

#[derive(Debug)]
pub struct ProcessPool {
    audio: Semaphore,
    probe: Semaphore,
    encode: Semaphore,
    audio_limit: usize,
    probe_limit: usize,
    encode_limit: usize,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolCounts {
    pub active: usize,
    pub limit: usize,
}

impl ProcessPool {
    pub fn new() -> Self {
        let settings = config::settings();
        Self::with_limits(
            settings.max_audio_jobs(),
            settings.max_probe_jobs(),
            settings.max_encode_jobs(),
        )
    }

    pub fn with_limits(audio_limit: usize, probe_limit: usize, encode_limit: usize) -> Self {
        Self {
            audio: Semaphore::new(audio_limit),
            probe: Semaphore::new(probe_limit),
            encode: Semaphore::new(encode_limit),
            audio_limit,
            probe_limit,
            encode_limit,
        }
    }

    fn semaphore(&self, class: PoolClass) -> &Semaphore {
        match class {
            PoolClass::Audio => &self.audio,
            PoolClass::Probe => &self.probe,
            PoolClass::Encode => &self.encode,
        }
    }

    fn limit(&self, class: PoolClass) -> usize {
        match class {
            PoolClass::Audio => self.audio_limit,
            PoolClass::Probe => self.probe_limit,
            PoolClass::Encode => self.encode_limit,
        }
    }

    pub fn can_accept(&self, class: PoolClass) -> bool {
        self.semaphore(class).available_permits() > 0
    }

    pub fn counts(&self, class: PoolClass) -> PoolCounts {
        let limit = self.limit(class);
        let active = limit.saturating_sub(self.semaphore(class).available_permits());
        PoolCounts { active, limit }
    }

    /// Admits one subprocess of `class`, or fails immediately with `SERVER_BUSY` if the
    /// ceiling is already reached. There is no queue: callers racing for the last slot
    /// get served first-come, everyone else gets a 503 right away.
    pub fn try_acquire(&self, class: PoolClass) -> Result<SemaphorePermit<'_>, AppError> {
        self.semaphore(class).try_acquire().map_err(|_| {
            AppError::server_busy(format!(
                "{} subprocess pool is at capacity",
                class.label()
            ))
        })
    }
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns `program` with `-progress`-style piped stdout/stderr, killing the child if
/// the returned `Child` is dropped. Mirrors `FFmpegRunningJob::run` in spirit: a single
/// spawn point all watchdogs and pool bookkeeping funnel through.
pub fn spawn_piped<I, S>(
    program: &Path,
    args: I,
    stdin: Stdio,
) -> std::io::Result<Child>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    tracing::debug!(program = %program.display(), "spawning subprocess");
    Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Best-effort kill: the OS may already have reaped the child (it exited between our
/// last poll and this call), so errors here are swallowed rather than propagated.
pub async fn kill_process(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!("kill_process: process likely already exited: {e}");
    }
}

/// Reads up to `max_bytes` of a stream (typically stderr) for diagnostics, discarding
/// anything beyond that so a runaway process can't inflate an error response.
pub async fn read_stream_with_limit(
    mut stream: impl AsyncRead + Unpin,
    max_bytes: usize,
) -> String {
    let mut buf = vec![0u8; max_bytes];
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => break,
        }
    }
    buf.truncate(filled);
    // Drain and discard the remainder so the pipe never blocks the writer.
    let mut sink = [0u8; 4096];
    while let Ok(n) = stream.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn stderr_tail(stream: ChildStderr) -> impl std::future::Future<Output = String> {
    read_stream_with_limit(stream, config::timeouts::STDERR_TAIL_BYTES)
}

pub fn stdout_capped(stream: ChildStdout, max_bytes: usize) -> impl std::future::Future<Output = String> {
    read_stream_with_limit(stream, max_bytes)
}

/// Races `fut` against an absolute deadline, killing `child` and surfacing a `Timeout`
/// error if the deadline wins.
pub async fn with_timeout<T>(
    duration: Duration,
    child: &mut Child,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, AppError> {
    match tokio::time::timeout(duration, fut).await {
        Ok(v) => Ok(v),
        Err(_elapsed) => {
            kill_process(child).await;
            Err(AppError::timeout(format!(
                "operation exceeded {:.0}s",
                duration.as_secs_f32()
            )))
        }
    }
}

/// A stall watchdog: armed on creation, reset on every progress update, and
/// shortened once progress crosses the "near complete" threshold. Firing
/// kills the process and is reported as `PROGRESS_STALLED` rather than a generic
/// timeout, so operators can tell a hung encode from a slow one.
pub struct StallWatchdog {
    deadline: tokio::time::Instant,
    bound: Duration,
    near_complete: bool,
}

impl StallWatchdog {
    pub fn new() -> Self {
        let bound = config::timeouts::STALL_DEFAULT;
        Self {
            deadline: tokio::time::Instant::now() + bound,
            bound,
            near_complete: false,
        }
    }

    /// Call on every progress update. `percent` drives the stall-bound shortening once
    /// the job is almost done (ffmpeg's tail end can genuinely slow down on flush).
    pub fn reset(&mut self, percent: f32) {
        if !self.near_complete && percent >= config::timeouts::STALL_THRESHOLD_PERCENT {
            self.near_complete = true;
            self.bound = config::timeouts::STALL_NEAR_COMPLETE;
        }
        self.deadline = tokio::time::Instant::now() + self.bound;
    }

    pub async fn fire(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}

impl Default for StallWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

pub fn exit_ok(status: ExitStatus) -> bool {
    status.success()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_ceiling_then_refuses() {
        let pool = ProcessPool::with_limits(2, 2, 1);
        let _a = pool.try_acquire(PoolClass::Encode).unwrap();
        assert!(!pool.can_accept(PoolClass::Encode));
        let err = pool.try_acquire(PoolClass::Encode).unwrap_err();
        assert_eq!(err.kind, crate::app_state::AppErrorKind::ServerBusy);
    }

    #[test]
    fn releasing_a_permit_frees_capacity() {
        let pool = ProcessPool::with_limits(1, 1, 1);
        {
            let _permit = pool.try_acquire(PoolClass::Probe).unwrap();
            assert!(!pool.can_accept(PoolClass::Probe));
        }
        assert!(pool.can_accept(PoolClass::Probe));
    }

    #[test]
    fn counts_reflect_active_usage() {
        let pool = ProcessPool::with_limits(3, 1, 1);
        let _a = pool.try_acquire(PoolClass::Audio).unwrap();
        let _b = pool.try_acquire(PoolClass::Audio).unwrap();
        let counts = pool.counts(PoolClass::Audio);
        assert_eq!(counts.active, 2);
        assert_eq!(counts.limit, 3);
    }

    #[tokio::test]
    async fn kill_process_tolerates_already_exited_child() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let _ = child.wait().await;
        kill_process(&mut child).await;
    }

    #[tokio::test]
    async fn read_stream_with_limit_discards_remainder() {
        let mut child = Command::new("sh")
            .args(["-c", "yes x | head -c 200000"])
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn shell");
        let stdout = child.stdout.take().unwrap();
        let captured = read_stream_with_limit(stdout, 1024).await;
        assert_eq!(captured.len(), 1024);
        let _ = child.wait().await;
    }
}
