use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::types::{ExecutionResult, ExecutionState, Outcome};

#[derive(Debug)]
struct TrackerState {
    state: ExecutionState,
    started_at: Option<SystemTime>,
    process_group: Option<u32>,
    workdir: Option<PathBuf>,
}

/// Scheduler-owned record of one execution's lifecycle
#[derive(Debug)]
pub(crate) struct Tracker {
    id: Uuid,
    submitted_at: SystemTime,
    cancel: CancellationToken,
    inner: Mutex<TrackerState>,
}

impl Tracker {
    pub fn new(id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            id,
            submitted_at: SystemTime::now(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(TrackerState {
                state: ExecutionState::Queued,
                started_at: None,
                process_group: None,
                workdir: None,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`. A backwards or repeated transition means the
    /// bookkeeping is corrupt, which is fatal.
    pub fn advance(&self, next: ExecutionState) {
        let mut inner = self.lock();
        let current = inner.state;
        if !current.can_advance_to(next) {
            drop(inner);
            panic!(
                "execution {}: illegal state transition {:?} -> {:?}",
                self.id, current, next
            );
        }
        if next == ExecutionState::Running {
            inner.started_at = Some(SystemTime::now());
        }
        inner.state = next;
        debug!("Execution {} is now {:?}", self.id, next);
    }
}

/// The sandbox's view of an execution: a weak link it reports progress
/// through. It never keeps the execution alive or decides its final state.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecutionReporter {
    tracker: Weak<Tracker>,
}

impl ExecutionReporter {
    pub fn new(tracker: &Arc<Tracker>) -> Self {
        Self {
            tracker: Arc::downgrade(tracker),
        }
    }

    /// A reporter nobody listens to
    #[cfg(test)]
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn report_running(&self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.advance(ExecutionState::Running);
        }
    }

    pub fn record_process(&self, pgid: u32) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.lock().process_group = Some(pgid);
        }
    }

    pub fn record_workdir(&self, path: &Path) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.lock().workdir = Some(path.to_path_buf());
        }
    }
}

/// Caller's handle on a submitted execution
#[derive(Debug)]
pub struct ExecutionHandle {
    tracker: Arc<Tracker>,
    result: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionHandle {
    pub(crate) fn new(tracker: Arc<Tracker>, result: oneshot::Receiver<ExecutionResult>) -> Self {
        Self { tracker, result }
    }

    pub fn id(&self) -> Uuid {
        self.tracker.id
    }

    pub fn state(&self) -> ExecutionState {
        self.tracker.state()
    }

    pub fn submitted_at(&self) -> SystemTime {
        self.tracker.submitted_at
    }

    /// When a worker picked the execution up
    pub fn started_at(&self) -> Option<SystemTime> {
        self.tracker.lock().started_at
    }

    /// Process group of the step currently (or last) running
    pub fn process_group(&self) -> Option<u32> {
        self.tracker.lock().process_group
    }

    /// Working area assigned to the execution; removed once it finishes
    pub fn workdir(&self) -> Option<PathBuf> {
        self.tracker.lock().workdir.clone()
    }

    /// Wait for the execution's one and only result
    pub async fn wait(self) -> ExecutionResult {
        let id = self.tracker.id;
        match self.result.await {
            Ok(result) => result,
            Err(_) => ExecutionResult::without_process(
                id,
                Outcome::InternalError,
                "execution worker exited without reporting a result",
            ),
        }
    }
}
