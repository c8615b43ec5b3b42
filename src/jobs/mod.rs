mod logs;

pub use logs::JobLog;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::store::{id_key, Bucket, Store, StoreError};

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("job {0} not found")]
    NotFound(u64),
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("job {0} is already finished")]
    AlreadyFinished(u64),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("could not decode stored job: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JobsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Successful,
    Failed,
    Killed,
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed command invocation, immutable once constructed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    pub args: Vec<String>,
    pub username: String,
    pub user_id: String,
    pub user_link: String,
    pub channel: String,
    pub channel_id: String,
    pub channel_link: String,
    pub is_im: bool,
}

/// Durable record of one accepted invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub request: Request,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

/// Predicate used by [`Jobs::filter`]; zero `limit` means unbounded.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub limit: usize,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub status: Option<JobStatus>,
    pub command: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum TailEvent {
    Line(String),
    Done,
}

/// Typed job and log operations over the store.
///
/// A single internal mutex serializes every read-check-write sequence, which
/// gives at most one terminal transition per job and keeps log appends for a
/// job in arrival order.
#[derive(Clone)]
pub struct Jobs {
    store: Store,
    state: Arc<Mutex<()>>,
    tails: Arc<StdMutex<HashMap<u64, broadcast::Sender<TailEvent>>>>,
}

impl Jobs {
    pub fn new(store: Store) -> Jobs {
        Jobs {
            store,
            state: Arc::new(Mutex::new(())),
            tails: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Allocates a durable job for the request with a fresh monotonic id.
    pub async fn create(&self, request: Request) -> Result<Job> {
        let id = self.store.next_id().await?;
        let job = Job {
            id,
            request,
            start_time: Utc::now(),
            end_time: None,
            status: JobStatus::Running,
        };
        self.put_job(&job).await?;
        Ok(job)
    }

    /// Builds an ephemeral job that is never persisted, used by commands
    /// that do not record their runs.
    pub fn null_job(&self, request: Request) -> Job {
        Job {
            id: 0,
            request,
            start_time: Utc::now(),
            end_time: None,
            status: JobStatus::Running,
        }
    }

    pub async fn get(&self, id: u64) -> Result<Job> {
        let raw = self
            .store
            .get(Bucket::Jobs, &id_key(id))
            .await?
            .ok_or(JobsError::NotFound(id))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Transitions a running job to a terminal status and stamps its end
    /// time. Any other transition is rejected.
    pub async fn finish(&self, id: u64, status: JobStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(JobsError::InvalidTransition {
                from: JobStatus::Running,
                to: status,
            });
        }

        let _guard = self.state.lock().await;
        let mut job = self.get(id).await?;
        if job.status != JobStatus::Running {
            return Err(JobsError::InvalidTransition {
                from: job.status,
                to: status,
            });
        }

        job.status = status;
        job.end_time = Some(Utc::now());
        self.put_job(&job).await?;

        let sender = self.tails.lock().expect("tails lock poisoned").remove(&id);
        if let Some(sender) = sender {
            let _ = sender.send(TailEvent::Done);
        }
        Ok(())
    }

    /// Lists jobs in descending id order, newest first.
    pub async fn filter(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let start = id_key(filter.since.unwrap_or(1));
        let end = id_key(filter.until.unwrap_or(u64::MAX));

        let rows = self.store.scan_rev(Bucket::Jobs, &start, &end).await?;
        let mut jobs = Vec::new();
        for (_, raw) in rows {
            let job: Job = serde_json::from_slice(&raw)?;
            if let Some(status) = filter.status {
                if job.status != status {
                    continue;
                }
            }
            if let Some(command) = &filter.command {
                if &job.request.command != command {
                    continue;
                }
            }
            if let Some(username) = &filter.username {
                if &job.request.username != username {
                    continue;
                }
            }
            jobs.push(job);
            if filter.limit > 0 && jobs.len() == filter.limit {
                break;
            }
        }
        Ok(jobs)
    }

    async fn put_job(&self, job: &Job) -> Result<()> {
        let raw = serde_json::to_vec(job)?;
        self.store.put(Bucket::Jobs, &id_key(job.id), &raw).await?;
        Ok(())
    }
}

/// Registry of cancellation handles for running jobs, keyed by job id.
///
/// The shell executor registers a token before spawning and the `cancel` and
/// `kill` built-ins trip it.
#[derive(Clone, Default)]
pub struct Cancellations {
    inner: Arc<StdMutex<HashMap<u64, CancellationToken>>>,
}

impl Cancellations {
    pub fn new() -> Cancellations {
        Cancellations::default()
    }

    pub fn register(&self, id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .lock()
            .expect("cancellations lock poisoned")
            .insert(id, token.clone());
        token
    }

    /// Cancels the job when it is still running. Returns whether a running
    /// job was found.
    pub fn cancel(&self, id: u64) -> bool {
        let guard = self.inner.lock().expect("cancellations lock poisoned");
        match guard.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u64) {
        self.inner
            .lock()
            .expect("cancellations lock poisoned")
            .remove(&id);
    }

    /// Cancels every registered job, used on shutdown.
    pub fn cancel_all(&self) {
        let guard = self.inner.lock().expect("cancellations lock poisoned");
        for token in guard.values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, username: &str) -> Request {
        Request {
            command: command.to_string(),
            username: username.to_string(),
            user_id: format!("U{}", username),
            user_link: format!("<@U{}>", username),
            channel: "general".to_string(),
            channel_id: "C123".to_string(),
            channel_link: "<#C123|general>".to_string(),
            ..Default::default()
        }
    }

    async fn jobs() -> (tempfile::TempDir, Jobs) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path()).await.unwrap();
        (dir, Jobs::new(store))
    }

    #[tokio::test]
    async fn create_then_get_preserves_the_request() {
        let (_dir, jobs) = jobs().await;
        let req = request("echo", "pablo");

        let job = jobs.create(req.clone()).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);

        let loaded = jobs.get(job.id).await.unwrap();
        assert_eq!(loaded.request, req);
        assert_eq!(loaded.id, job.id);
        assert!(loaded.end_time.is_none());
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_with_creation_order() {
        let (_dir, jobs) = jobs().await;
        let mut previous: Option<Job> = None;
        for _ in 0..5 {
            let job = jobs.create(request("echo", "pablo")).await.unwrap();
            if let Some(prev) = previous {
                assert!(prev.id < job.id);
                assert!(prev.start_time <= job.start_time);
            }
            previous = Some(job);
        }
    }

    #[tokio::test]
    async fn finish_is_a_single_terminal_transition() {
        let (_dir, jobs) = jobs().await;
        let job = jobs.create(request("echo", "pablo")).await.unwrap();

        jobs.finish(job.id, JobStatus::Successful).await.unwrap();
        let loaded = jobs.get(job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Successful);
        assert!(loaded.end_time.is_some());

        let err = jobs.finish(job.id, JobStatus::Failed).await.unwrap_err();
        assert!(matches!(err, JobsError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn finish_rejects_running_as_a_target() {
        let (_dir, jobs) = jobs().await;
        let job = jobs.create(request("echo", "pablo")).await.unwrap();
        let err = jobs.finish(job.id, JobStatus::Running).await.unwrap_err();
        assert!(matches!(err, JobsError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn finish_unknown_job_is_not_found() {
        let (_dir, jobs) = jobs().await;
        let err = jobs.finish(42, JobStatus::Successful).await.unwrap_err();
        assert!(matches!(err, JobsError::NotFound(42)));
    }

    #[tokio::test]
    async fn filter_applies_predicates_newest_first() {
        let (_dir, jobs) = jobs().await;

        let j1 = jobs.create(request("echo", "pablo")).await.unwrap();
        let j2 = jobs.create(request("deploy", "pablo")).await.unwrap();
        let j3 = jobs.create(request("echo", "daniele")).await.unwrap();
        jobs.finish(j1.id, JobStatus::Successful).await.unwrap();
        jobs.finish(j2.id, JobStatus::Failed).await.unwrap();

        let all = jobs.filter(JobFilter::default()).await.unwrap();
        let ids: Vec<u64> = all.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![j3.id, j2.id, j1.id]);

        let echoes = jobs
            .filter(JobFilter {
                command: Some("echo".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(echoes.len(), 2);

        let pablos = jobs
            .filter(JobFilter {
                username: Some("pablo".to_string()),
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pablos.len(), 1);
        assert_eq!(pablos[0].id, j2.id);

        let failed = jobs
            .filter(JobFilter {
                status: Some(JobStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, j2.id);

        let windowed = jobs
            .filter(JobFilter {
                since: Some(j2.id),
                until: Some(j2.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(windowed.len(), 1);
    }

    #[tokio::test]
    async fn cancellations_cancel_only_registered_jobs() {
        let cancels = Cancellations::new();
        let token = cancels.register(7);
        assert!(!token.is_cancelled());

        assert!(!cancels.cancel(8));
        assert!(cancels.cancel(7));
        assert!(token.is_cancelled());

        cancels.remove(7);
        assert!(!cancels.cancel(7));
    }
}
