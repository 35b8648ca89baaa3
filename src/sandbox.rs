//! Sandbox Orchestrator - Slots, Workers, Timeouts
//!
//! One job per `(actor, task type)` slot. A new submission for an occupied
//! slot hard-terminates the previous job before the new one starts, and a
//! terminated job can no longer touch the cache or its result channel: the
//! finishing job re-checks slot ownership under the slot lock before either.
//!
//! Lock order is slots, then cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::RenderCache;
use crate::config::{EngineConfig, WorkerMode};
use crate::diagnostics::{ErrorKind, JobError};
use crate::hashing::compute_cache_key;
use crate::payload::{Payload, TaskType};
use crate::pipeline::{JobSpec, RenderPipeline, WorkerRequest, WorkerResponse};
use crate::sanitize::{sanitize, Limits};
use crate::scene::RenderOutput;
use crate::store::ArtifactStore;
use crate::ENGINE_VERSION;

fn sandbox_error(message: impl Into<String>) -> JobError {
    JobError::new(ErrorKind::Sandbox, message)
}

/// Isolated execution context for one job.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, job_id: Uuid, spec: JobSpec) -> Result<RenderOutput, JobError>;
}

/// Runs the pipeline on the blocking pool; a panic fails only that job.
pub struct InProcessWorker {
    pipeline: Arc<RenderPipeline>,
}

impl InProcessWorker {
    pub fn new(pipeline: Arc<RenderPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Worker for InProcessWorker {
    async fn execute(&self, job_id: Uuid, spec: JobSpec) -> Result<RenderOutput, JobError> {
        let pipeline = Arc::clone(&self.pipeline);
        match tokio::task::spawn_blocking(move || pipeline.execute(&spec)).await {
            Ok(result) => result.map_err(JobError::from),
            Err(e) => {
                warn!(%job_id, error = %e, "worker crashed");
                Err(sandbox_error(format!("Worker crashed: {}", e)))
            }
        }
    }
}

/// Spawns one OS process per job speaking the stdin/stdout JSON protocol.
/// Dropping the job future kills the process.
pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn execute(&self, job_id: Uuid, spec: JobSpec) -> Result<RenderOutput, JobError> {
        let request = serde_json::to_vec(&WorkerRequest { job_id, spec })
            .map_err(|e| sandbox_error(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                sandbox_error(format!("Failed to start worker {}: {}", self.program.display(), e))
            })?;
        debug!(%job_id, pid = child.id(), "worker process started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| sandbox_error("Worker stdin unavailable"))?;
        stdin
            .write_all(&request)
            .await
            .map_err(|e| sandbox_error(format!("Failed to send job to worker: {}", e)))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| sandbox_error(format!("Worker failed: {}", e)))?;
        match serde_json::from_slice::<WorkerResponse>(&output.stdout) {
            Ok(WorkerResponse::Ok { output }) => Ok(output),
            Ok(WorkerResponse::Err { error }) => Err(error),
            Err(e) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
                warn!(%job_id, status = %output.status, "worker produced no valid response");
                Err(sandbox_error(format!(
                    "Worker exited with {} without a valid response ({}): {}",
                    output.status, e, tail
                )))
            }
        }
    }
}

/// Build the worker selected by the configuration.
pub fn build_worker(config: &EngineConfig, pipeline: Arc<RenderPipeline>) -> Result<Arc<dyn Worker>, JobError> {
    match config.worker.mode {
        WorkerMode::InProcess => Ok(Arc::new(InProcessWorker::new(pipeline))),
        WorkerMode::Process => {
            let program = match &config.worker.program {
                Some(p) => p.clone(),
                None => std::env::current_exe()
                    .map_err(|e| sandbox_error(format!("Cannot locate worker binary: {}", e)))?,
            };
            Ok(Arc::new(ProcessWorker::new(program, config.worker.args.clone())))
        }
    }
}

/// Sliding-window job counter per actor.
pub struct RateLimiter {
    max_jobs: usize,
    window: Duration,
    hits: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_jobs: usize, window: Duration) -> Self {
        Self {
            max_jobs,
            window,
            hits: HashMap::new(),
        }
    }

    /// Record a job at `now`, or return the seconds until the actor may retry.
    pub fn check(&mut self, actor: &str, now: Instant) -> Result<(), u64> {
        let window = self.window;
        self.hits.retain(|_, hits| {
            while hits
                .front()
                .is_some_and(|&first| now.saturating_duration_since(first) >= window)
            {
                hits.pop_front();
            }
            !hits.is_empty()
        });

        let hits = self.hits.entry(actor.to_string()).or_default();
        if hits.len() >= self.max_jobs {
            let oldest = hits.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.saturating_duration_since(oldest));
            return Err((wait.as_secs_f64().ceil() as u64).max(1));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Actors with at least one job inside the window.
    pub fn tracked_actors(&self) -> usize {
        self.hits.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub task_type: TaskType,
    pub actor_key: String,
    #[serde(default)]
    pub trusted: bool,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub task_type: TaskType,
    pub status: JobStatus,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RenderOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

type SlotKey = (String, TaskType);
type JobOutcome = Result<RenderOutput, JobError>;

struct SlotEntry {
    job_id: Uuid,
    handle: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct Orchestrator {
    worker: Arc<dyn Worker>,
    store: Arc<dyn ArtifactStore>,
    limits: Limits,
    timeout: Duration,
    slots: Arc<Mutex<HashMap<SlotKey, SlotEntry>>>,
    cache: Arc<Mutex<RenderCache>>,
    limiter: Mutex<RateLimiter>,
}

impl Orchestrator {
    pub fn new(worker: Arc<dyn Worker>, store: Arc<dyn ArtifactStore>, config: &EngineConfig) -> Self {
        Self {
            worker,
            store,
            limits: Limits {
                max_source_bytes: config.max_source_bytes,
                max_elements: config.max_elements,
                max_audio_bytes: config.max_audio_bytes,
            },
            timeout: config.job_timeout(),
            slots: Arc::new(Mutex::new(HashMap::new())),
            cache: Arc::new(Mutex::new(RenderCache::new(config.cache_capacity))),
            limiter: Mutex::new(RateLimiter::new(config.rate_limit.max_jobs, config.rate_window())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a job to completion. Rejections before scheduling are `Err`;
    /// every scheduled job ends in a report with a terminal status.
    pub async fn submit(&self, request: JobRequest) -> Result<JobReport, JobError> {
        let started_at = Utc::now();
        let JobRequest {
            task_type,
            actor_key: actor,
            trusted,
            payload,
        } = request;

        if let Err(retry_after) = lock(&self.limiter).check(&actor, Instant::now()) {
            warn!(actor = %actor, task_type = %task_type, retry_after, "rate limited");
            return Err(JobError::rate_limited(retry_after));
        }

        let payload = Payload::parse(task_type, payload)?;
        let (payload, _) = sanitize(payload, trusted, &self.limits)?;
        let spec = JobSpec {
            task_type,
            trusted,
            payload,
        };

        let epoch = self
            .store
            .latest_modified()
            .map_err(|e| sandbox_error(format!("Artifact store unavailable: {}", e)))?;
        let key = compute_cache_key(task_type, &spec, epoch, ENGINE_VERSION)
            .map_err(|e| JobError::invalid_payload(e.to_string()))?;

        let job_id = Uuid::new_v4();
        let cached = lock(&self.cache).get(&key);
        if let Some(output) = cached {
            info!(%job_id, actor = %actor, task_type = %task_type, "served from render cache");
            return Ok(JobReport {
                job_id,
                task_type,
                status: JobStatus::Succeeded,
                cached: true,
                output: Some(output),
                error: None,
                started_at,
                finished_at: Utc::now(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let slot: SlotKey = (actor.clone(), task_type);
        {
            let mut slots = lock(&self.slots);
            if let Some(previous) = slots.remove(&slot) {
                previous.handle.abort();
                warn!(
                    actor = %actor,
                    task_type = %task_type,
                    preempted = %previous.job_id,
                    %job_id,
                    "slot occupied; previous job terminated"
                );
            }
            let job = RunningJob {
                job_id,
                slot: slot.clone(),
                key,
                spec,
                worker: Arc::clone(&self.worker),
                timeout: self.timeout,
                slots: Arc::clone(&self.slots),
                cache: Arc::clone(&self.cache),
            };
            let handle = tokio::spawn(job.run(tx));
            slots.insert(slot, SlotEntry { job_id, handle });
        }
        debug!(%job_id, actor = %actor, task_type = %task_type, "job running");

        let (status, output, error) = match rx.await {
            Ok(Ok(output)) => (JobStatus::Succeeded, Some(output), None),
            Ok(Err(e)) if e.kind == ErrorKind::Timeout => (JobStatus::TimedOut, None, Some(e)),
            Ok(Err(e)) => (JobStatus::Failed, None, Some(e)),
            Err(_) => (
                JobStatus::Cancelled,
                None,
                Some(JobError::new(ErrorKind::Cancelled, "Job was terminated before completing")),
            ),
        };
        info!(%job_id, actor = %actor, task_type = %task_type, status = ?status, "job finished");
        Ok(JobReport {
            job_id,
            task_type,
            status,
            cached: false,
            output,
            error,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Terminate the actor's running jobs, optionally only for some task
    /// types. Returns the task types that were stopped.
    pub fn cancel(&self, actor: &str, task_types: Option<&[TaskType]>) -> Vec<TaskType> {
        let mut slots = lock(&self.slots);
        let targets: Vec<SlotKey> = slots
            .keys()
            .filter(|(a, t)| a == actor && task_types.map_or(true, |ts| ts.contains(t)))
            .cloned()
            .collect();
        let mut stopped = Vec::new();
        for key in targets {
            if let Some(entry) = slots.remove(&key) {
                entry.handle.abort();
                info!(actor, task_type = %key.1, job_id = %entry.job_id, "job cancelled");
                stopped.push(key.1);
            }
        }
        stopped.sort();
        stopped
    }

    /// Jobs currently occupying the actor's slots.
    pub fn running(&self, actor: &str) -> Vec<(TaskType, Uuid)> {
        let slots = lock(&self.slots);
        let mut jobs: Vec<_> = slots
            .iter()
            .filter(|((a, _), _)| a == actor)
            .map(|((_, t), entry)| (*t, entry.job_id))
            .collect();
        jobs.sort();
        jobs
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }
}

struct RunningJob {
    job_id: Uuid,
    slot: SlotKey,
    key: String,
    spec: JobSpec,
    worker: Arc<dyn Worker>,
    timeout: Duration,
    slots: Arc<Mutex<HashMap<SlotKey, SlotEntry>>>,
    cache: Arc<Mutex<RenderCache>>,
}

impl RunningJob {
    async fn run(self, tx: oneshot::Sender<JobOutcome>) {
        let RunningJob {
            job_id,
            slot,
            key,
            spec,
            worker,
            timeout,
            slots,
            cache,
        } = self;

        let outcome = match tokio::time::timeout(timeout, worker.execute(job_id, spec)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%job_id, timeout_ms = timeout.as_millis() as u64, "job timed out; worker terminated");
                Err(JobError::new(
                    ErrorKind::Timeout,
                    format!("Job exceeded {}ms", timeout.as_millis()),
                ))
            }
        };

        let mut slots = lock(&slots);
        if slots.get(&slot).map(|e| e.job_id) != Some(job_id) {
            debug!(%job_id, "job lost its slot; result discarded");
            return;
        }
        slots.remove(&slot);
        if let Ok(output) = &outcome {
            lock(&cache).put(key, output.clone());
        }
        let _ = tx.send(outcome);
    }
}
