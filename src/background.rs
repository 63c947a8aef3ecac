//! Single-worker FIFO background job queue. Retries transient storage-engine
//! lock/busy errors with exponential backoff; cancels queued jobs and joins
//! the running one on shutdown.
//!
//! Job state transitions are guarded by one `parking_lot::Mutex` over the
//! job table; the worker never holds that lock across the user callback
//! (SPEC_FULL.md §9) — it snapshots the job, releases the lock, runs the
//! callback, then re-locks to record the outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: f64 = 1.0;
const SHUTDOWN_REASON: &str = "cancelled: server shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub label: String,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    fn new(id: String, label: String) -> Self {
        Self {
            id,
            label,
            status: JobStatus::Queued,
            result: None,
            error: None,
            retries: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// `elapsed_seconds` derived from `started_at`/`completed_at` (or now, if
    /// still running); `None` if the job never started.
    pub fn to_dict(&self) -> serde_json::Value {
        let elapsed_seconds = self.started_at.map(|started| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            (end - started).num_milliseconds() as f64 / 1000.0
        });
        serde_json::json!({
            "id": self.id,
            "status": format!("{:?}", self.status).to_lowercase(),
            "result": self.result,
            "error": self.error,
            "retries": self.retries,
            "created_at": self.created_at.to_rfc3339(),
            "started_at": self.started_at.map(|t| t.to_rfc3339()),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "elapsed_seconds": elapsed_seconds,
        })
    }
}

/// A unit of background work: a label (used by the watcher for job-key
/// coalescing) and a synchronous callback run on a blocking thread. `run` is
/// `Fn`, not `FnOnce`, so the retry loop can invoke it again after a
/// transient storage error — callers must supply an idempotent closure
/// (every reindex/prune callback in this crate is).
pub struct JobRequest {
    pub label: String,
    pub run: Arc<dyn Fn() -> EngineResult<serde_json::Value> + Send + Sync + 'static>,
}

struct Inner {
    jobs: Mutex<std::collections::HashMap<String, Job>>,
    order: Mutex<VecDeque<String>>,
    queue_tx: mpsc::UnboundedSender<(String, JobRequest)>,
    shutting_down: AtomicBool,
    shutdown_notify: Arc<Notify>,
    worker_idle: Notify,
}

/// A single long-lived job queue with one worker task reading an unbounded
/// FIFO channel. The task parks on an empty channel between jobs rather than
/// exiting and restarting, which is the idiomatic tokio shape for the same
/// "one worker, FIFO order, idle between bursts" discipline.
pub struct BackgroundIndexer {
    inner: Arc<Inner>,
}

impl BackgroundIndexer {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            jobs: Mutex::new(std::collections::HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            queue_tx,
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Arc::new(Notify::new()),
            worker_idle: Notify::new(),
        });
        spawn_worker(inner.clone(), queue_rx);
        Self { inner }
    }

    /// Enqueue a job. Spawns the worker if idle. Rejects with
    /// `EngineError::ShuttingDown` once `shutdown` has been called.
    pub fn submit(&self, request: JobRequest) -> EngineResult<Job> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let id = Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), request.label.clone());
        self.inner.jobs.lock().insert(id.clone(), job.clone());
        self.inner.order.lock().push_back(id.clone());
        // Send may fail only if the receiving task has already exited
        // (e.g. racing a prior shutdown); treat it the same as shut down.
        self.inner
            .queue_tx
            .send((id, request))
            .map_err(|_| EngineError::ShuttingDown)?;
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.inner.jobs.lock().get(id).cloned()
    }

    pub fn get_all_jobs(&self) -> Vec<Job> {
        let jobs = self.inner.jobs.lock();
        let order = self.inner.order.lock();
        order.iter().filter_map(|id| jobs.get(id).cloned()).collect()
    }

    /// True if any job carrying exactly `label` is currently `queued` or
    /// `running`. Used by the watcher to coalesce reindex submissions onto a
    /// `(db_path, watch_roots)` key passed as the job's label.
    pub fn has_active_job(&self, label: &str) -> bool {
        self.inner
            .jobs
            .lock()
            .values()
            .any(|j| j.label == label && matches!(j.status, JobStatus::Queued | JobStatus::Running))
    }

    /// Block until no job is `queued` or `running`, or `timeout` elapses.
    pub async fn drain(&self, timeout_dur: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout_dur;
        loop {
            if !self.any_active() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            let wait = self.inner.worker_idle.notified();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let _ = timeout(remaining.min(Duration::from_millis(50)), wait).await;
        }
    }

    fn any_active(&self) -> bool {
        self.inner
            .jobs
            .lock()
            .values()
            .any(|j| matches!(j.status, JobStatus::Queued | JobStatus::Running))
    }

    /// Set the shutdown flag, mark every still-queued job `failed`, then wait
    /// up to `timeout_dur` for the in-flight job to finish.
    pub async fn shutdown(&self, timeout_dur: Duration) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();

        {
            let mut jobs = self.inner.jobs.lock();
            for job in jobs.values_mut() {
                if job.status == JobStatus::Queued {
                    job.status = JobStatus::Failed;
                    job.error = Some(SHUTDOWN_REASON.to_string());
                    job.completed_at = Some(Utc::now());
                }
            }
        }

        let _ = timeout(timeout_dur, async {
            while self
                .inner
                .jobs
                .lock()
                .values()
                .any(|j| j.status == JobStatus::Running)
            {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
    }
}

impl Default for BackgroundIndexer {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_worker(inner: Arc<Inner>, mut queue_rx: mpsc::UnboundedReceiver<(String, JobRequest)>) {
    tokio::spawn(async move {
        while let Some((id, request)) = queue_rx.recv().await {
            run_job(&inner, id, request).await;
            if queue_rx.is_empty() {
                inner.worker_idle.notify_waiters();
            }
        }
    });
}

async fn run_job(inner: &Arc<Inner>, id: String, request: JobRequest) {
    if inner.shutting_down.load(Ordering::SeqCst) {
        // Already marked failed by `shutdown`; nothing to run.
        return;
    }

    {
        let mut jobs = inner.jobs.lock();
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
    }

    let mut backoff = INITIAL_BACKOFF_SECS;
    let mut retries = 0u32;
    let label = request.label;
    let run = request.run;

    loop {
        let run_cb = run.clone();
        let outcome = tokio::task::spawn_blocking(move || run_cb()).await;

        let result = match outcome {
            Ok(r) => r,
            Err(join_err) => Err(EngineError::Internal(anyhow::anyhow!(
                "background job {} panicked: {}",
                label,
                join_err
            ))),
        };

        match result {
            Ok(value) => {
                tracing::info!(job_id = %id, label = %label, retries, "background job completed");
                let mut jobs = inner.jobs.lock();
                if let Some(job) = jobs.get_mut(&id) {
                    job.status = JobStatus::Completed;
                    job.result = Some(value);
                    job.retries = retries;
                    job.completed_at = Some(Utc::now());
                }
                return;
            }
            Err(err) if is_transient(&err) && retries < MAX_RETRIES => {
                tracing::warn!(job_id = %id, label = %label, attempt = retries + 1, error = %err, "transient storage error, retrying");
                retries += 1;
                let wait = Duration::from_secs_f64(backoff);
                backoff *= 2.0;

                let shutdown_signal = inner.shutdown_notify.notified();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_signal => {
                        let mut jobs = inner.jobs.lock();
                        if let Some(job) = jobs.get_mut(&id) {
                            job.status = JobStatus::Failed;
                            job.error = Some(SHUTDOWN_REASON.to_string());
                            job.retries = retries;
                            job.completed_at = Some(Utc::now());
                        }
                        return;
                    }
                }
                // loop: re-invoke the same idempotent callback
            }
            Err(err) => {
                let mut jobs = inner.jobs.lock();
                if let Some(job) = jobs.get_mut(&id) {
                    job.status = JobStatus::Failed;
                    job.error = Some(err.to_string());
                    job.retries = retries;
                    job.completed_at = Some(Utc::now());
                }
                return;
            }
        }
    }
}

/// A storage-engine error is transient if its message matches "locked" or
/// "busy" (SQLite's own `SQLITE_LOCKED`/`SQLITE_BUSY` wording) on an
/// operational-error variant. Any other error (including non-storage
/// errors) is treated as permanent.
fn is_transient(err: &EngineError) -> bool {
    match err {
        EngineError::Storage { source, .. } => {
            let msg = source.to_string().to_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}
