use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::job::JobId;
use crate::error::{ArtifexError, Result};

/// The two states of the runner: `IDLE → RUNNING → IDLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running(JobId),
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerState::Idle => write!(f, "IDLE"),
            RunnerState::Running(id) => write!(f, "RUNNING({id})"),
        }
    }
}

/// How the supervising task should stop its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// SIGTERM, or a hard kill where signals do not exist.
    Terminate,
    /// Hard kill, used on shutdown.
    Kill,
}

/// The slot's view of the running job. The process handle itself stays with
/// the supervising task; the slot only holds the way to reach it.
#[derive(Debug)]
pub struct ActiveJob {
    pub id: JobId,
    pub pid: Option<u32>,
    stop: oneshot::Sender<Stop>,
}

impl ActiveJob {
    pub fn new(id: JobId, pid: Option<u32>, stop: oneshot::Sender<Stop>) -> Self {
        Self { id, pid, stop }
    }

    /// Returns false when the supervisor already finished.
    pub fn stop(self, how: Stop) -> bool {
        self.stop.send(how).is_ok()
    }
}

/// Single-slot holder of the active job.
#[derive(Debug, Clone, Default)]
pub struct JobSlot {
    inner: Arc<Mutex<Option<ActiveJob>>>,
}

impl JobSlot {
    pub fn state(&self) -> RunnerState {
        match self.inner.lock().as_ref() {
            Some(active) => RunnerState::Running(active.id),
            None => RunnerState::Idle,
        }
    }

    /// Runs `launch` only while idle and stores the job it yields, all under
    /// one lock so two launches can never both succeed.
    pub fn occupy<T>(&self, launch: impl FnOnce() -> Result<(ActiveJob, T)>) -> Result<T> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(ArtifexError::AlreadyRunning);
        }
        let (active, out) = launch()?;
        *slot = Some(active);
        Ok(out)
    }

    /// Empties the slot, returning what was running.
    pub fn take(&self) -> Option<ActiveJob> {
        self.inner.lock().take()
    }

    /// Empties the slot only if it still holds job `id`.
    pub fn release(&self, id: JobId) -> bool {
        let mut slot = self.inner.lock();
        if slot.as_ref().is_some_and(|active| active.id == id) {
            *slot = None;
            true
        } else {
            false
        }
    }
}
