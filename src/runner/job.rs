use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generation number assigned to a job at start. Every event carries it, so a
/// late exit from a cancelled job is never attributed to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Interpreter (or any executable) that runs the script.
    pub executable: PathBuf,
    pub script: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Defaults to the script's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Written to the worker's stdin as a single JSON line.
    #[serde(default)]
    pub stdin: Option<serde_json::Value>,
}

impl JobSpec {
    pub fn new(executable: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_stdin(mut self, payload: serde_json::Value) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn working_dir(&self) -> PathBuf {
        match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => self
                .script
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

/// Which worker stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamTag {
    #[serde(rename = "out")]
    Stdout,
    #[serde(rename = "err")]
    Stderr,
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTag::Stdout => write!(f, "out"),
            StreamTag::Stderr => write!(f, "err"),
        }
    }
}

/// Pushed to the job's channel; `Exited` is always the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutputEvent {
    Output {
        job: JobId,
        stream: StreamTag,
        text: String,
    },
    /// `code` is `None` when the worker died from a signal.
    Exited { job: JobId, code: Option<i32> },
}

impl OutputEvent {
    pub fn job(&self) -> JobId {
        match self {
            OutputEvent::Output { job, .. } | OutputEvent::Exited { job, .. } => *job,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputEvent::Exited { .. })
    }
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Terminated,
}

/// One worker invocation. Owned by the task supervising its process.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            status: JobStatus::Running,
            exit_code: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn terminate(&mut self, exit_code: Option<i32>) {
        self.status = JobStatus::Terminated;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}
