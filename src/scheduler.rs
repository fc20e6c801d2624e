// Job scheduler - persist, prioritize, execute, retry, chain
//
// Units of work flow through a single persisted queue. Handlers return
// follow-up jobs, which is how the page pipeline composes
// (doublefetch-page -> page-quorum-check -> send-message) without a
// central orchestrator.
//
// Execution is sequential and cooperative: one job at a time, jobs of
// the same type at least `cooldown_ms` apart.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::KvStorage;
use crate::util::{uniform_ms, Debouncer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const QUEUE_KEY: &str = "jobs|queue";
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(100);

/// First retry delay; doubled per attempt.
const BACKOFF_BASE_MS: u64 = 30_000;
/// Retries never wait longer than this.
const BACKOFF_CAP_MS: u64 = 24 * 60 * 60 * 1000;
/// Re-check delay for jobs refused with `Cooldown`.
const COOLDOWN_RETRY_MS: u64 = 60_000;

/// A follow-up job returned by a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: String,
    pub args: Value,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, args: Value) -> Self {
        Self {
            job_type: job_type.into(),
            args,
        }
    }
}

/// Per-type scheduling parameters.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Higher runs first.
    pub priority: i32,
    /// Uniform random initial delay, in milliseconds.
    pub ready_in_ms: (u64, u64),
    /// Minimum wall-clock gap between starts of same-type jobs.
    pub cooldown_ms: u64,
    /// Queue cap for this type; enqueues beyond it fail with Overflow.
    pub max_jobs_total: usize,
    /// Retries before a transient-failing job is dropped.
    pub max_attempts: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            ready_in_ms: (0, 0),
            cooldown_ms: 0,
            max_jobs_total: 100,
            max_attempts: 5,
        }
    }
}

/// One unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub job_type: String,
    pub args: Value,
    pub ready_at: i64,
    pub attempts: u32,
}

/// Implemented per job type. Exactly one handler per type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, args: Value) -> Result<Vec<JobRequest>>;
}

struct HandlerEntry {
    handler: Arc<dyn JobHandler>,
    config: JobConfig,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<Job>,
    next_id: u64,
    /// Start times for the cooldown gap; not persisted.
    last_start: HashMap<String, i64>,
}

#[derive(Serialize, Deserialize)]
struct QueueSnapshot {
    next_id: u64,
    jobs: Vec<Job>,
}

pub struct JobScheduler {
    clock: Arc<dyn Clock>,
    handlers: std::sync::RwLock<HashMap<String, HandlerEntry>>,
    state: Arc<Mutex<QueueState>>,
    storage: Arc<dyn KvStorage>,
    debouncer: Debouncer,
}

impl JobScheduler {
    pub fn new(storage: Arc<dyn KvStorage>, clock: Arc<dyn Clock>) -> Self {
        let state = Arc::new(Mutex::new(QueueState::default()));

        let persist_state = state.clone();
        let persist_storage = storage.clone();
        let debouncer = Debouncer::new(PERSIST_DEBOUNCE, move || {
            let state = persist_state.clone();
            let storage = persist_storage.clone();
            async move {
                if let Err(err) = persist(&state, storage.as_ref()).await {
                    tracing::warn!("job queue snapshot failed: {err}");
                }
            }
        });

        Self {
            clock,
            handlers: std::sync::RwLock::new(HashMap::new()),
            state,
            storage,
            debouncer,
        }
    }

    /// Install the handler for a job type. A second registration for the
    /// same type is a programming error.
    pub fn register_handler(
        &self,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        config: JobConfig,
    ) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(job_type) {
            return Err(Error::BadJob(format!(
                "handler for {job_type:?} already registered"
            )));
        }
        handlers.insert(job_type.to_string(), HandlerEntry { handler, config });
        Ok(())
    }

    /// Restore the queue snapshot from storage. Corrupted snapshots are
    /// dropped and the queue starts empty.
    pub async fn restore(&self) {
        let stored = match self.storage.get(QUEUE_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("failed to read job queue snapshot: {err:#}");
                return;
            }
        };
        match serde_json::from_value::<QueueSnapshot>(stored) {
            Ok(snapshot) => {
                let mut state = self.state.lock().await;
                state.next_id = snapshot.next_id;
                state.jobs = snapshot.jobs;
            }
            Err(err) => {
                tracing::warn!("dropping corrupted job queue snapshot: {err}");
                let _ = self.storage.remove(QUEUE_KEY).await;
            }
        }
    }

    fn config_for(&self, job_type: &str) -> Result<JobConfig> {
        self.handlers
            .read()
            .unwrap()
            .get(job_type)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| Error::BadJob(format!("no handler for job type {job_type:?}")))
    }

    /// Enqueue one job. Fails with `Overflow` when the per-type cap is
    /// reached.
    pub async fn register_job(&self, job_type: &str, args: Value) -> Result<u64> {
        let config = self.config_for(job_type)?;
        let now = self.clock.now_ms();

        let mut state = self.state.lock().await;
        let queued = state
            .jobs
            .iter()
            .filter(|job| job.job_type == job_type)
            .count();
        if queued >= config.max_jobs_total {
            return Err(Error::Overflow(format!(
                "{queued} jobs of type {job_type:?} already queued"
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        let (min, max) = config.ready_in_ms;
        state.jobs.push(Job {
            id,
            job_type: job_type.to_string(),
            args,
            ready_at: now + uniform_ms(min, max) as i64,
            attempts: 0,
        });
        drop(state);

        self.debouncer.trigger();
        Ok(id)
    }

    /// Number of queued jobs, optionally filtered by type.
    pub async fn pending_jobs(&self, job_type: Option<&str>) -> usize {
        let state = self.state.lock().await;
        state
            .jobs
            .iter()
            .filter(|job| job_type.is_none_or(|t| job.job_type == t))
            .count()
    }

    /// Run every job whose `ready_at` has passed, sequentially, highest
    /// priority first. Returns the number of jobs executed.
    pub async fn process_pending_jobs(&self) -> usize {
        let mut executed = 0;
        loop {
            let Some(job) = self.take_next_runnable().await else {
                break;
            };

            let handler = {
                let handlers = self.handlers.read().unwrap();
                handlers.get(&job.job_type).map(|e| e.handler.clone())
            };
            let Some(handler) = handler else {
                tracing::warn!(job_type = %job.job_type, "dropping job without handler");
                continue;
            };

            tracing::debug!(job_type = %job.job_type, id = job.id, "running job");
            match handler.run(job.args.clone()).await {
                Ok(followups) => {
                    executed += 1;
                    for followup in followups {
                        if let Err(err) =
                            self.register_job(&followup.job_type, followup.args).await
                        {
                            tracing::warn!(
                                job_type = %followup.job_type,
                                "follow-up rejected: {err}"
                            );
                        }
                    }
                }
                Err(err) => {
                    executed += 1;
                    self.handle_failure(job, err).await;
                }
            }
            self.debouncer.trigger();
        }
        executed
    }

    /// Pop the best runnable job: `ready_at` passed, type cooldown
    /// satisfied, ordered by (priority desc, ready_at asc).
    async fn take_next_runnable(&self) -> Option<Job> {
        let now = self.clock.now_ms();
        let configs: HashMap<String, JobConfig> = {
            let handlers = self.handlers.read().unwrap();
            handlers
                .iter()
                .map(|(job_type, entry)| (job_type.clone(), entry.config.clone()))
                .collect()
        };
        let mut state = self.state.lock().await;

        let mut best: Option<(usize, i32, i64)> = None;
        for (index, job) in state.jobs.iter().enumerate() {
            if job.ready_at > now {
                continue;
            }
            let Some(config) = configs.get(&job.job_type) else {
                continue;
            };
            let cooled_down = state
                .last_start
                .get(&job.job_type)
                .is_none_or(|last| now - last >= config.cooldown_ms as i64);
            if !cooled_down {
                continue;
            }
            let key = (config.priority, job.ready_at);
            let better = match best {
                None => true,
                Some((_, priority, ready_at)) => {
                    key.0 > priority || (key.0 == priority && key.1 < ready_at)
                }
            };
            if better {
                best = Some((index, key.0, key.1));
            }
        }

        let (index, _, _) = best?;
        let job = state.jobs.remove(index);
        state.last_start.insert(job.job_type.clone(), now);
        Some(job)
    }

    async fn handle_failure(&self, mut job: Job, err: Error) {
        let config = match self.config_for(&job.job_type) {
            Ok(config) => config,
            Err(_) => return,
        };
        let now = self.clock.now_ms();

        match err {
            Error::Cooldown(reason) => {
                tracing::debug!(job_type = %job.job_type, "job deferred: {reason}");
                job.ready_at = now + COOLDOWN_RETRY_MS as i64;
                self.state.lock().await.jobs.push(job);
            }
            Error::Transient(reason) => {
                job.attempts += 1;
                if job.attempts > config.max_attempts {
                    tracing::warn!(
                        job_type = %job.job_type,
                        attempts = job.attempts,
                        "giving up on job: {reason}"
                    );
                    return;
                }
                job.ready_at = now + backoff_ms(job.attempts) as i64;
                tracing::debug!(
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    ready_at = job.ready_at,
                    "retrying job: {reason}"
                );
                self.state.lock().await.jobs.push(job);
            }
            other => {
                tracing::warn!(job_type = %job.job_type, "dropping job: {other}");
            }
        }
    }

    /// Write the queue snapshot now, bypassing the debounce.
    pub async fn flush(&self) -> Result<()> {
        persist(&self.state, self.storage.as_ref()).await
    }
}

/// Exponential backoff with jitter: 30s, 60s, 120s, ... capped at a day.
fn backoff_ms(attempts: u32) -> u64 {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << (attempts - 1).min(16));
    let capped = base.min(BACKOFF_CAP_MS);
    uniform_ms(capped * 3 / 4, capped * 5 / 4)
}

async fn persist(state: &Mutex<QueueState>, storage: &dyn KvStorage) -> Result<()> {
    let snapshot = {
        let state = state.lock().await;
        QueueSnapshot {
            next_id: state.next_id,
            jobs: state.jobs.clone(),
        }
    };
    let value = serde_json::to_value(&snapshot).map_err(Error::transient)?;
    storage.set(QUEUE_KEY, value).await.map_err(Error::transient)
}
