//! Single-slot worker runner.
//!
//! At most one worker process exists at a time. Its output is streamed as
//! [`OutputEvent`]s on a per-job channel, always ending with exactly one
//! [`OutputEvent::Exited`].

mod job;
mod process;
mod state;

pub use job::{Job, JobId, JobSpec, OutputEvent, StreamTag};
pub use state::{ActiveJob, JobSlot, RunnerState, Stop};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::{ArtifexError, Result};

/// Receiving end of a started job.
#[derive(Debug)]
pub struct JobEvents {
    pub id: JobId,
    pub events: mpsc::UnboundedReceiver<OutputEvent>,
}

impl JobEvents {
    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }
}

pub struct JobRunner {
    slot: JobSlot,
    next_id: AtomicU64,
    env: BTreeMap<String, String>,
    // Flipped once by `shutdown`; every live supervisor holds a receiver,
    // including those of cancelled jobs that left the slot.
    kill_all: watch::Sender<bool>,
}

impl JobRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            slot: JobSlot::default(),
            next_id: AtomicU64::new(1),
            env: config.env.clone(),
            kill_all: watch::channel(false).0,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.slot.state()
    }

    /// Launches `spec` if the runner is idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, spec: JobSpec) -> Result<JobEvents> {
        self.slot.occupy(|| {
            if !spec.script.is_file() {
                return Err(ArtifexError::NotFound(spec.script.display().to_string()));
            }

            let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let mut cmd = process::build_command(&spec, &self.env);
            let child = cmd
                .spawn()
                .map_err(|e| ArtifexError::invocation(spec.executable.display(), e))?;
            let pid = child.id();

            info!(
                job = %id,
                pid = ?pid,
                executable = %spec.executable.display(),
                script = %spec.script.display(),
                "job started"
            );

            let (tx, events) = mpsc::unbounded_channel();
            let (stop_tx, stop_rx) = oneshot::channel();
            tokio::spawn(process::supervise(
                Job::new(id, spec),
                child,
                stop_rx,
                self.kill_all.subscribe(),
                self.slot.clone(),
                tx,
            ));

            Ok((ActiveJob::new(id, pid, stop_tx), JobEvents { id, events }))
        })
    }

    /// Requests termination of the running job and frees the slot at once.
    ///
    /// The job's terminal event still arrives on its own channel.
    pub fn cancel(&self) -> Result<JobId> {
        let active = self.slot.take().ok_or(ArtifexError::NotRunning)?;
        let (id, pid) = (active.id, active.pid);
        if active.stop(Stop::Terminate) {
            info!(job = %id, pid = ?pid, "cancel requested");
        } else {
            debug!(job = %id, "job finished before cancel");
        }
        Ok(id)
    }

    /// Hard-kills every worker still alive, including cancelled ones that
    /// have not exited yet. Used when the host goes away.
    ///
    /// Returns the job that held the slot, if any.
    pub fn shutdown(&self) -> Option<JobId> {
        let active = self.slot.take();
        let live = self.kill_all.receiver_count();
        self.kill_all.send_replace(true);
        if live > 0 {
            info!(workers = live, "killing workers on shutdown");
        }

        let active = active?;
        let id = active.id;
        if !active.stop(Stop::Kill) {
            warn!(job = %id, "job already gone at shutdown");
        }
        Some(id)
    }
}
