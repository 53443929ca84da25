use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::AppError;
use crate::models::progress::ProgressEvent;

// ── Progress channel ──

/// Push side of the progress subscription channel.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Fans progress events out to every live subscriber.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressPublisher for BroadcastPublisher {
    fn publish(&self, event: ProgressEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

// ── Job scheduler ──

/// A unit of out-of-band work. Resolves to a one-line summary.
pub type Job = Pin<Box<dyn Future<Output = Result<String, AppError>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed { summary: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub name: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Runs long imports detached from the caller.
pub trait JobScheduler: Send + Sync {
    /// Submit a job and return its id immediately.
    fn schedule(&self, name: &str, job: Job) -> Result<String, AppError>;

    fn status(&self, job_id: &str) -> Option<JobStatus>;
}

struct JobEntry {
    status: JobStatus,
    finished: Option<Instant>,
}

/// Spawns jobs onto a tokio runtime and tracks their outcome.
///
/// Finished jobs stay queryable for `retention`, then are swept lazily on
/// the next `schedule` or `status` call.
pub struct TokioJobScheduler {
    handle: Handle,
    jobs: Arc<DashMap<String, JobEntry>>,
    retention: Duration,
}

impl TokioJobScheduler {
    pub fn new(handle: Handle, retention: Duration) -> Self {
        Self {
            handle,
            jobs: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Bind to the runtime the caller is running on.
    pub fn from_current(retention: Duration) -> Result<Self, AppError> {
        let handle = Handle::try_current()
            .map_err(|e| AppError::Scheduler(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(handle, retention))
    }

    fn sweep_expired(&self) {
        let retention = self.retention;
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !job.finished.is_some_and(|t| t.elapsed() >= retention));
        let evicted = before.saturating_sub(self.jobs.len());
        if evicted > 0 {
            debug!("Evicted {} expired job entries", evicted);
        }
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule(&self, name: &str, job: Job) -> Result<String, AppError> {
        self.sweep_expired();
        let job_id = uuid::Uuid::new_v4().to_string();
        self.jobs.insert(
            job_id.clone(),
            JobEntry {
                status: JobStatus {
                    job_id: job_id.clone(),
                    name: name.to_string(),
                    state: JobState::Running,
                    submitted_at: Utc::now(),
                    finished_at: None,
                },
                finished: None,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let id = job_id.clone();
        self.handle.spawn(async move {
            let state = match job.await {
                Ok(summary) => {
                    info!("Job {} finished: {}", id, summary);
                    JobState::Completed { summary }
                }
                Err(e) => {
                    warn!("Job {} failed: {}", id, e);
                    JobState::Failed {
                        message: e.to_string(),
                    }
                }
            };
            if let Some(mut job) = jobs.get_mut(&id) {
                job.status.state = state;
                job.status.finished_at = Some(Utc::now());
                job.finished = Some(Instant::now());
            }
        });

        Ok(job_id)
    }

    fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.sweep_expired();
        self.jobs.get(job_id).map(|job| job.status.clone())
    }
}
