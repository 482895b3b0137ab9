use std::{collections::HashMap, sync::Mutex};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::{
    app_state::{AppError, AppErrorKind},
    config,
};

fn as_time_duration(d: std::time::Duration) -> time::Duration {
    time::Duration::try_from(d).unwrap_or(time::Duration::ZERO)
}

/// The job lifecycle state machine. Ordinal position encodes the forward-only
/// ordering rule: a transition is valid only if it increases position, or moves to one
/// of the three terminal phases from anywhere non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Downloading,
    Probing,
    Processing,
    Uploading,
    GeneratingThumbnail,
    Complete,
    Error,
    Cancelled,
}

impl JobPhase {
    fn ordinal(self) -> u8 {
        match self {
            JobPhase::Queued => 0,
            JobPhase::Downloading => 1,
            JobPhase::Probing => 2,
            JobPhase::Processing => 3,
            JobPhase::Uploading => 4,
            JobPhase::GeneratingThumbnail => 5,
            JobPhase::Complete | JobPhase::Error | JobPhase::Cancelled => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Complete | JobPhase::Error | JobPhase::Cancelled)
    }
}

/// The JSON shape returned by the status endpoints and posted to webhooks.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub video_id: String,
    pub phase: JobPhase,
    pub progress: f32,
    pub message: Option<String>,
    pub error: Option<String>,
    pub metadata: Option<Value>,
    pub output_url: Option<String>,
}

struct Job {
    video_id: String,
    user_id: String,
    phase: JobPhase,
    progress: f32,
    message: Option<String>,
    error: Option<String>,
    metadata: Option<Value>,
    output_url: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    webhook_url: Option<String>,
    cancel: CancellationToken,
    events: tokio::sync::broadcast::Sender<JobProgress>,
    delete_after: Option<OffsetDateTime>,
}

impl Job {
    fn snapshot(&self, job_id: Uuid) -> JobProgress {
        JobProgress {
            job_id,
            video_id: self.video_id.clone(),
            phase: self.phase,
            progress: self.progress,
            message: self.message.clone(),
            error: self.error.clone(),
            metadata: self.metadata.clone(),
            output_url: self.output_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub video_id: String,
    pub phase: JobPhase,
    pub progress: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A handle returned to the background worker task when a job is created: the
/// cancellation token to observe and the job id to report progress against.
pub struct JobHandle {
    pub job_id: Uuid,
    pub cancel: CancellationToken,
}

/// In-memory job table. Every mutation goes through a single `Mutex<HashMap<..>>`
/// guarding the task list; each job additionally owns a `broadcast::Sender` so its
/// SSE stream is independently subscribable and independently closeable.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, video_id: String, user_id: String, webhook_url: Option<String>) -> JobHandle {
        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (events, _) = tokio::sync::broadcast::channel(16);
        let now = OffsetDateTime::now_utc();
        let job = Job {
            video_id,
            user_id,
            phase: JobPhase::Queued,
            progress: 0.0,
            message: None,
            error: None,
            metadata: None,
            output_url: None,
            created_at: now,
            updated_at: now,
            webhook_url,
            cancel: cancel.clone(),
            events,
            delete_after: None,
        };
        self.jobs.lock().unwrap().insert(job_id, job);
        JobHandle { job_id, cancel }
    }

    pub fn snapshot(&self, job_id: Uuid) -> Option<JobProgress> {
        self.jobs.lock().unwrap().get(&job_id).map(|j| j.snapshot(job_id))
    }

    pub fn subscribe(&self, job_id: Uuid) -> Option<tokio::sync::broadcast::Receiver<JobProgress>> {
        self.jobs.lock().unwrap().get(&job_id).map(|j| j.events.subscribe())
    }

    pub fn user_of(&self, job_id: Uuid) -> Option<String> {
        self.jobs.lock().unwrap().get(&job_id).map(|j| j.user_id.clone())
    }

    fn mutate(&self, job_id: Uuid, f: impl FnOnce(&mut Job)) -> Option<JobProgress> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id)?;
        f(job);
        job.updated_at = OffsetDateTime::now_utc();
        if job.phase.is_terminal() && job.delete_after.is_none() {
            job.delete_after = Some(job.updated_at + as_time_duration(config::timeouts::JOB_TERMINAL_GRACE));
        }
        let snapshot = job.snapshot(job_id);
        let _ = job.events.send(snapshot.clone());
        Some(snapshot)
    }

    /// Moves the job forward to `phase`. Rejects backward transitions between
    /// non-terminal phases; transitions to a terminal phase are always accepted from
    /// any non-terminal state.
    pub fn transition(&self, job_id: Uuid, phase: JobPhase, message: Option<String>) -> Result<JobProgress, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| AppError::not_found("job not found"))?;
        if job.phase.is_terminal() {
            return Err(AppError::new(AppErrorKind::InvalidState, "job is already in a terminal state"));
        }
        if !phase.is_terminal() && phase.ordinal() < job.phase.ordinal() {
            return Err(AppError::new(AppErrorKind::InvalidState, "phase transitions cannot move backwards"));
        }
        job.phase = phase;
        job.message = message;
        job.updated_at = OffsetDateTime::now_utc();
        if job.phase.is_terminal() {
            job.delete_after = Some(job.updated_at + as_time_duration(config::timeouts::JOB_TERMINAL_GRACE));
        }
        let snapshot = job.snapshot(job_id);
        let _ = job.events.send(snapshot.clone());
        Ok(snapshot)
    }

    /// Progress is monotonically non-decreasing during a successful run. A
    /// regressing update is clamped rather than rejected, since progress
    /// arrives from imprecise ffmpeg parsing and a hard error here would kill jobs
    /// for no operator-visible benefit.
    pub fn set_progress(&self, job_id: Uuid, progress: f32, message: Option<String>) -> Option<JobProgress> {
        self.mutate(job_id, |job| {
            job.progress = progress.max(job.progress).clamp(0.0, 100.0);
            if message.is_some() {
                job.message = message;
            }
        })
    }

    pub fn complete(&self, job_id: Uuid, output_url: String, metadata: Option<Value>) -> Option<JobProgress> {
        self.mutate(job_id, |job| {
            job.phase = JobPhase::Complete;
            job.progress = 100.0;
            job.output_url = Some(output_url);
            job.metadata = metadata;
        })
    }

    pub fn fail(&self, job_id: Uuid, error: impl Into<String>) -> Option<JobProgress> {
        self.mutate(job_id, |job| {
            job.phase = JobPhase::Error;
            job.error = Some(error.into());
        })
    }

    /// Rejects if the job is already terminal, otherwise fires the cancellation
    /// token (which the running subprocess helper observes) and transitions to
    /// `cancelled`.
    pub fn cancel(&self, job_id: Uuid) -> Result<JobProgress, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| AppError::not_found("job not found"))?;
        if job.phase.is_terminal() {
            return Err(AppError::new(AppErrorKind::InvalidState, "job is already in a terminal state"));
        }
        job.cancel.cancel();
        job.phase = JobPhase::Cancelled;
        job.updated_at = OffsetDateTime::now_utc();
        job.delete_after = Some(job.updated_at + as_time_duration(config::timeouts::JOB_TERMINAL_GRACE));
        let snapshot = job.snapshot(job_id);
        let _ = job.events.send(snapshot.clone());
        Ok(snapshot)
    }

    pub fn webhook_target(&self, job_id: Uuid) -> Option<String> {
        self.jobs.lock().unwrap().get(&job_id).and_then(|j| j.webhook_url.clone())
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(id, job)| JobSummary {
                job_id: *id,
                video_id: job.video_id.clone(),
                phase: job.phase,
                progress: job.progress,
                created_at: job.created_at,
            })
            .collect()
    }

    /// TTL eviction pass: removes jobs untouched for more than `JOB_TTL`, and
    /// terminal jobs past their grace window, regardless of TTL.
    pub fn sweep(&self) -> Vec<Uuid> {
        let now = OffsetDateTime::now_utc();
        let mut jobs = self.jobs.lock().unwrap();
        let expired: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, job)| {
                now - job.updated_at > as_time_duration(config::timeouts::JOB_TTL)
                    || job.delete_after.is_some_and(|at| now >= at)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }
}

/// Posts the webhook payload best-effort; failures are logged and never alter job
/// state.
pub async fn post_webhook(http: &reqwest::Client, url: &str, progress: &JobProgress) {
    let (bridged, host) = crate::loopback::bridge(&match reqwest::Url::parse(url) {
        Ok(u) => u,
        Err(e) => {
            warn!("invalid webhook url {url}: {e}");
            return;
        }
    });
    let mut request = http.post(bridged).json(progress);
    if let Some(host) = host {
        request = request.header(reqwest::header::HOST, host);
    }
    if let Err(e) = request.send().await {
        warn!(job_id = %progress.job_id, "webhook delivery failed: {e}");
    }
}

/// Spawned once at startup; periodically evicts stale/terminal jobs and purges their
/// scratch files, every 5 minutes.
pub async fn run_sweeper(registry: &'static JobRegistry, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(config::timeouts::JOB_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let evicted = registry.sweep();
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "evicted stale jobs");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_accepted() {
        let registry = JobRegistry::new();
        let handle = registry.create("v1".into(), "u1".into(), None);
        registry.transition(handle.job_id, JobPhase::Downloading, None).unwrap();
        registry.transition(handle.job_id, JobPhase::Probing, None).unwrap();
        let snap = registry.snapshot(handle.job_id).unwrap();
        assert_eq!(snap.phase, JobPhase::Probing);
    }

    #[test]
    fn backward_transition_is_rejected() {
        let registry = JobRegistry::new();
        let handle = registry.create("v1".into(), "u1".into(), None);
        registry.transition(handle.job_id, JobPhase::Processing, None).unwrap();
        let err = registry.transition(handle.job_id, JobPhase::Downloading, None).unwrap_err();
        assert_eq!(err.kind, AppErrorKind::InvalidState);
    }

    #[test]
    fn terminal_transition_always_allowed() {
        let registry = JobRegistry::new();
        let handle = registry.create("v1".into(), "u1".into(), None);
        registry.transition(handle.job_id, JobPhase::Downloading, None).unwrap();
        registry.fail(handle.job_id, "boom");
        let snap = registry.snapshot(handle.job_id).unwrap();
        assert_eq!(snap.phase, JobPhase::Error);
        assert_eq!(snap.error.as_deref(), Some("boom"));
    }

    #[test]
    fn progress_never_regresses() {
        let registry = JobRegistry::new();
        let handle = registry.create("v1".into(), "u1".into(), None);
        registry.set_progress(handle.job_id, 40.0, None);
        registry.set_progress(handle.job_id, 10.0, None);
        let snap = registry.snapshot(handle.job_id).unwrap();
        assert_eq!(snap.progress, 40.0);
    }

    #[test]
    fn cancel_rejects_terminal_jobs() {
        let registry = JobRegistry::new();
        let handle = registry.create("v1".into(), "u1".into(), None);
        registry.fail(handle.job_id, "boom");
        let err = registry.cancel(handle.job_id).unwrap_err();
        assert_eq!(err.kind, AppErrorKind::InvalidState);
    }

    #[test]
    fn cancel_fires_the_token_and_transitions() {
        let registry = JobRegistry::new();
        let handle = registry.create("v1".into(), "u1".into(), None);
        registry.cancel(handle.job_id).unwrap();
        assert!(handle.cancel.is_cancelled());
        let snap = registry.snapshot(handle.job_id).unwrap();
        assert_eq!(snap.phase, JobPhase::Cancelled);
    }

    #[test]
    fn unknown_job_id_yields_not_found() {
        let registry = JobRegistry::new();
        let err = registry.cancel(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind, AppErrorKind::NotFound);
    }
}
