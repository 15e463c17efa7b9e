//! Execution scheduler: admission control, a fixed pool of worker slots,
//! a bounded FIFO queue, and per-execution handles for status and
//! cancellation.

mod handle;

pub use handle::ExecutionHandle;
pub(crate) use handle::ExecutionReporter;

use handle::Tracker;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::{ExecConfig, OverflowPolicy},
    error::Error,
    normalize::{Normalizer, RawOutcome},
    registry::{LanguageDescriptor, RunnerRegistry},
    sandbox::Sandbox,
    types::{ExecutionRequest, ExecutionResult, ExecutionState, Outcome, ResourceLimits},
    Result,
};

/// Snapshot of the pool's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub pool_size: usize,
    pub queue_depth: usize,
    pub running: usize,
    pub peak_running: usize,
    pub queued: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub completed: usize,
}

/// An admitted request waiting for (or holding) a worker slot
struct Job {
    tracker: Arc<Tracker>,
    descriptor: Arc<LanguageDescriptor>,
    source: String,
    stdin: Option<Vec<u8>>,
    limits: ResourceLimits,
    reply: oneshot::Sender<ExecutionResult>,
    // Held until the job finishes; bounds pool + queue occupancy
    _admission: OwnedSemaphorePermit,
}

struct Pool {
    free_slots: usize,
    queue: VecDeque<Job>,
}

/// Live and recently finished executions, for `status` and `cancel`
struct HandleTable {
    by_id: HashMap<Uuid, Arc<Tracker>>,
    finished: VecDeque<Uuid>,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    peak_running: AtomicUsize,
    admitted: AtomicUsize,
    rejected: AtomicUsize,
    completed: AtomicUsize,
}

struct Shared {
    config: ExecConfig,
    registry: Arc<RunnerRegistry>,
    normalizer: Normalizer,
    admission: Arc<Semaphore>,
    pool: Mutex<Pool>,
    handles: Mutex<HandleTable>,
    counters: Counters,
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Build the registry from `config` and start an idle pool
    pub fn new(config: ExecConfig) -> Result<Self> {
        let registry = config.registry()?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: ExecConfig, registry: RunnerRegistry) -> Result<Self> {
        config.validate()?;
        info!(
            "Scheduler ready: {} workers, queue depth {}, overflow {:?}, {} languages",
            config.pool_size,
            config.queue_depth,
            config.overflow,
            registry.len()
        );
        let capacity = config.pool_size + config.queue_depth;
        let shared = Shared {
            normalizer: Normalizer::new(config.stderr_policy),
            admission: Arc::new(Semaphore::new(capacity)),
            pool: Mutex::new(Pool {
                free_slots: config.pool_size,
                queue: VecDeque::with_capacity(config.queue_depth),
            }),
            handles: Mutex::new(HandleTable {
                by_id: HashMap::new(),
                finished: VecDeque::new(),
            }),
            counters: Counters::default(),
            registry: Arc::new(registry),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &ExecConfig {
        &self.shared.config
    }

    /// Admit `request` and hand back its handle. Language problems are
    /// reported before anything is queued. When pool and queue are full the
    /// request is rejected or waits, per the overflow policy.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionHandle> {
        let shared = &self.shared;
        let descriptor = shared.registry.lookup(&request.language)?;
        if !descriptor.enabled {
            return Err(Error::LanguageDisabled(descriptor.id.clone()));
        }
        if !descriptor.is_executable() {
            return Err(Error::NotExecutable(descriptor.id.clone()));
        }
        if request.source.trim().is_empty() && !descriptor.allow_empty_source {
            return Err(Error::EmptySource(descriptor.id.clone()));
        }

        let admission = match shared.config.overflow {
            OverflowPolicy::Reject => shared.admission.clone().try_acquire_owned().map_err(|_| {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let metrics = self.metrics();
                warn!(
                    "Rejecting {} execution: {} running, {} queued",
                    descriptor.id, metrics.running, metrics.queued
                );
                Error::AdmissionRejected {
                    running: metrics.running,
                    queued: metrics.queued,
                }
            })?,
            OverflowPolicy::Block => shared
                .admission
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Sandbox(format!("Failed to acquire admission permit: {}", e)))?,
        };

        let tracker = Tracker::new(Uuid::new_v4());
        let (reply, result) = oneshot::channel();
        let job = Job {
            tracker: tracker.clone(),
            limits: shared.config.limits_for(request.timeout),
            descriptor,
            source: request.source,
            stdin: request.stdin,
            reply,
            _admission: admission,
        };

        shared.handles().by_id.insert(tracker.id(), tracker.clone());
        shared.counters.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Admitted execution {} ({}), timeout {:?}",
            tracker.id(),
            job.descriptor.id,
            job.limits.wall_clock_timeout
        );

        Shared::dispatch(shared, job);
        Ok(ExecutionHandle::new(tracker, result))
    }

    /// Submit and wait: the operation the HTTP boundary calls
    pub async fn submit_execution(
        &self,
        source: impl Into<String>,
        language: &str,
        stdin: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let request = ExecutionRequest {
            language: language.to_string(),
            source: source.into(),
            stdin,
            timeout,
        };
        let handle = self.submit(request).await?;
        Ok(handle.wait().await)
    }

    /// Cancel a queued or running execution. Returns false when the id is
    /// unknown or the execution already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let Some(tracker) = self.shared.handles().by_id.get(&id).cloned() else {
            return false;
        };

        match tracker.state() {
            ExecutionState::Queued => {
                let removed = {
                    let mut pool = self.shared.pool();
                    pool.queue
                        .iter()
                        .position(|job| job.tracker.id() == id)
                        .and_then(|index| pool.queue.remove(index))
                };
                match removed {
                    Some(Job {
                        tracker,
                        reply,
                        _admission: admission,
                        ..
                    }) => {
                        info!("Execution {} cancelled while queued", id);
                        drop(admission);
                        let result = ExecutionResult::without_process(
                            id,
                            Outcome::Cancelled,
                            "execution cancelled before it started",
                        );
                        self.shared.finish(tracker, reply, result);
                    }
                    // Already handed to a worker; it checks the token first
                    None => {
                        tracker.cancel_token().cancel();
                        return !tracker.state().is_terminal();
                    }
                }
                true
            }
            ExecutionState::Running => {
                info!("Cancelling running execution {}", id);
                tracker.cancel_token().cancel();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: Uuid) -> Option<ExecutionState> {
        self.shared
            .handles()
            .by_id
            .get(&id)
            .map(|tracker| tracker.state())
    }

    pub fn available_slots(&self) -> usize {
        self.shared.pool().free_slots
    }

    pub fn metrics(&self) -> PoolMetrics {
        let counters = &self.shared.counters;
        PoolMetrics {
            pool_size: self.shared.config.pool_size,
            queue_depth: self.shared.config.queue_depth,
            running: counters.running.load(Ordering::SeqCst),
            peak_running: counters.peak_running.load(Ordering::SeqCst),
            queued: self.shared.pool().queue.len(),
            admitted: counters.admitted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
        }
    }
}

/// Returns the slot to the pool when a job ends, however it ends
struct WorkerSlot {
    shared: Arc<Shared>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.shared.counters.running.fetch_sub(1, Ordering::SeqCst);
        Shared::release_slot(&self.shared);
    }
}

impl Shared {
    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start `job` on a free slot, or append it to the queue
    fn dispatch(shared: &Arc<Shared>, job: Job) {
        let mut pool = shared.pool();
        if pool.free_slots > 0 {
            pool.free_slots -= 1;
            drop(pool);
            Self::start(shared, job);
        } else {
            debug!("All workers busy, queueing execution {}", job.tracker.id());
            pool.queue.push_back(job);
        }
    }

    /// Hand a freed slot straight to the oldest queued job, or give it back
    fn release_slot(shared: &Arc<Shared>) {
        let mut pool = shared.pool();
        match pool.queue.pop_front() {
            Some(job) => {
                drop(pool);
                Self::start(shared, job);
            }
            None => pool.free_slots += 1,
        }
    }

    fn start(shared: &Arc<Shared>, job: Job) {
        let running = shared.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        shared
            .counters
            .peak_running
            .fetch_max(running, Ordering::SeqCst);
        let slot = WorkerSlot {
            shared: shared.clone(),
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let Job {
                tracker,
                descriptor,
                source,
                stdin,
                limits,
                reply,
                _admission: admission,
            } = job;

            let id = tracker.id();
            let worker = tokio::spawn(run_job(
                shared.clone(),
                tracker.clone(),
                descriptor,
                source,
                stdin,
                limits,
            ));
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Execution {} worker failed: {}", id, e);
                    ExecutionResult::without_process(
                        id,
                        Outcome::InternalError,
                        format!("execution worker failed: {}", e),
                    )
                }
            };
            // Capacity is back before the caller hears about the result
            drop(slot);
            drop(admission);
            shared.finish(tracker, reply, result);
        });
    }

    /// Record the terminal state and deliver the result, exactly once per job
    fn finish(
        &self,
        tracker: Arc<Tracker>,
        reply: oneshot::Sender<ExecutionResult>,
        result: ExecutionResult,
    ) {
        tracker.advance(ExecutionState::for_outcome(result.outcome));
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            "Execution {} finished: {} in {:?}",
            tracker.id(),
            result.outcome,
            result.duration
        );

        {
            let mut handles = self.handles();
            handles.finished.push_back(tracker.id());
            while handles.finished.len() > self.config.history_limit {
                if let Some(evicted) = handles.finished.pop_front() {
                    handles.by_id.remove(&evicted);
                }
            }
        }

        if reply.send(result).is_err() {
            debug!("Caller for execution {} went away", tracker.id());
        }
    }
}

#[instrument(skip_all, fields(execution = %tracker.id(), language = %descriptor.id))]
async fn run_job(
    shared: Arc<Shared>,
    tracker: Arc<Tracker>,
    descriptor: Arc<LanguageDescriptor>,
    source: String,
    stdin: Option<Vec<u8>>,
    limits: ResourceLimits,
) -> ExecutionResult {
    let id = tracker.id();
    if tracker.cancel_token().is_cancelled() {
        return ExecutionResult::without_process(
            id,
            Outcome::Cancelled,
            "execution cancelled before it started",
        );
    }

    let started = Instant::now();
    let raw = match Sandbox::new(
        id,
        &shared.config.work_root,
        limits,
        shared.config.compile_timeout,
    )
    .await
    {
        Ok(sandbox) => {
            let reporter = ExecutionReporter::new(&tracker);
            sandbox
                .execute(
                    &descriptor,
                    &source,
                    stdin.as_deref(),
                    tracker.cancel_token(),
                    &reporter,
                )
                .await
        }
        Err(e) => {
            error!("Failed to prepare sandbox: {}", e);
            RawOutcome::Internal(e.to_string())
        }
    };

    shared.normalizer.normalize(id, raw, started.elapsed())
}
