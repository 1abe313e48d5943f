//! Request/response surface over the runner and discovery engine.
//!
//! Every operation returns a plain value: `{ok: true, ...data}` on success,
//! `{ok: false, message}` on failure, or a bare list for discovery. Job output
//! is pushed to an [`EventSink`] as it arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::ArtifexConfig;
use crate::desktop::{DesktopShell, SystemShell};
use crate::discovery::{self, DiscoveryEngine, GpuInfo, InterpreterReport};
use crate::error::ArtifexError;
use crate::runner::{JobId, JobRunner, JobSpec, OutputEvent, RunnerState};
use crate::settings::{JsonSettingsStore, SettingsStore};

/// Receives job events pushed by the bridge.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &OutputEvent);
}

impl<F> EventSink for F
where
    F: Fn(&OutputEvent) + Send + Sync,
{
    fn emit(&self, event: &OutputEvent) {
        self(event)
    }
}

/// Outcome of a bridge operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply<T = ()> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T> Reply<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

impl Reply {
    pub fn done() -> Self {
        Self {
            ok: true,
            message: None,
            data: None,
        }
    }
}

impl<T> From<ArtifexError> for Reply<T> {
    fn from(err: ArtifexError) -> Self {
        Reply::failure(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartedJob {
    pub job: JobId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobState {
    pub running: bool,
    pub job: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuReport {
    pub info: GpuInfo,
}

/// One request as it arrives over a transport.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    StartJob(JobSpec),
    CancelJob,
    JobState,
    DiscoverCheckpoints {
        #[serde(default)]
        task: String,
    },
    DiscoverInterpreters,
    DiscoverScripts,
    ValidateInterpreter {
        path: String,
    },
    ValidateFile {
        path: String,
    },
    GpuInfo {
        python: String,
    },
    GetSettings,
    SetSettings {
        settings: Value,
    },
    OpenPath {
        path: String,
    },
    ShowInFolder {
        path: String,
    },
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({"ok": false, "message": e.to_string()}))
}

fn required_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

pub struct Bridge {
    runner: JobRunner,
    engine: Arc<DiscoveryEngine>,
    probe_timeout: Duration,
    settings: Box<dyn SettingsStore>,
    desktop: Box<dyn DesktopShell>,
    sink: Arc<dyn EventSink>,
}

impl Bridge {
    pub fn new(
        config: &ArtifexConfig,
        engine: DiscoveryEngine,
        settings: Box<dyn SettingsStore>,
        desktop: Box<dyn DesktopShell>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            runner: JobRunner::new(&config.runner),
            engine: Arc::new(engine),
            probe_timeout: config.probe.timeout(),
            settings,
            desktop,
            sink,
        }
    }

    /// Bridge wired to the real filesystem, user settings and desktop.
    pub fn from_config(config: &ArtifexConfig, sink: Arc<dyn EventSink>) -> Self {
        let settings = JsonSettingsStore::in_user_config();
        debug!(path = %settings.path().display(), "settings store");
        Self::new(
            config,
            DiscoveryEngine::from_environment(config.discovery.clone()),
            Box::new(settings),
            Box::new(SystemShell),
            sink,
        )
    }

    pub fn start_job(&self, spec: JobSpec) -> Reply<StartedJob> {
        if spec.executable.as_os_str().is_empty() {
            return Reply::failure("Missing interpreter path");
        }
        if spec.script.as_os_str().is_empty() {
            return Reply::failure("Missing script path");
        }

        let mut job = match self.runner.start(spec) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "start rejected");
                return e.into();
            }
        };

        let id = job.id;
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            while let Some(event) = job.recv().await {
                sink.emit(&event);
                if event.is_terminal() {
                    debug!(job = %event.job(), "terminal event delivered");
                }
            }
        });

        Reply::success(StartedJob { job: id })
    }

    pub fn job_state(&self) -> JobState {
        match self.runner.state() {
            RunnerState::Idle => JobState { running: false, job: None },
            RunnerState::Running(id) => JobState { running: true, job: Some(id) },
        }
    }

    pub fn cancel_job(&self) -> Reply {
        match self.runner.cancel() {
            Ok(_) => Reply::done(),
            Err(e) => e.into(),
        }
    }

    /// Kills any running job. Called when the transport goes away.
    pub fn shutdown(&self) {
        if let Some(id) = self.runner.shutdown() {
            info!(job = %id, "job killed on shutdown");
        }
    }

    async fn discover<F>(&self, what: &'static str, scan: F) -> Vec<PathBuf>
    where
        F: FnOnce(&DiscoveryEngine) -> Vec<PathBuf> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        match tokio::task::spawn_blocking(move || scan(&engine)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(what, error = %e, "discovery task failed");
                Vec::new()
            }
        }
    }

    pub async fn discover_checkpoints(&self, task: &str) -> Vec<PathBuf> {
        let task = task.trim().to_lowercase();
        self.discover("checkpoints", move |engine| engine.checkpoints(&task))
            .await
    }

    pub async fn discover_interpreters(&self) -> Vec<PathBuf> {
        self.discover("interpreters", |engine| engine.interpreters())
            .await
    }

    pub async fn discover_scripts(&self) -> Vec<PathBuf> {
        self.discover("scripts", |engine| engine.scripts()).await
    }

    pub async fn validate_interpreter(&self, path: &str) -> Reply<InterpreterReport> {
        let Some(path) = required_path(path) else {
            return Reply::failure("Empty path");
        };
        match discovery::validate_interpreter(&path, self.probe_timeout).await {
            Ok(report) => Reply::success(report),
            Err(e) => e.into(),
        }
    }

    pub fn validate_file(&self, path: &str) -> Reply<FileInfo> {
        let Some(path) = required_path(path) else {
            return Reply::failure("Empty path");
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Reply::success(FileInfo { size: meta.len() }),
            Ok(_) => Reply::failure("Not a file"),
            Err(_) => Reply::failure("File does not exist"),
        }
    }

    pub async fn gpu_info(&self, python: &str) -> Reply<GpuReport> {
        let Some(python) = required_path(python) else {
            return Reply::failure("Empty path");
        };
        match discovery::gpu_info(&python, self.probe_timeout).await {
            Ok(info) => Reply::success(GpuReport { info }),
            Err(e) => e.into(),
        }
    }

    pub fn get_settings(&self) -> Value {
        self.settings.read()
    }

    pub fn set_settings(&self, settings: &Value) -> Reply {
        match self.settings.write(settings) {
            Ok(()) => Reply::done(),
            Err(e) => e.into(),
        }
    }

    fn desktop_call(&self, path: &str, call: impl FnOnce(&dyn DesktopShell, &Path) -> crate::error::Result<()>) -> Reply {
        let Some(path) = required_path(path) else {
            return Reply::failure("Empty path");
        };
        match call(self.desktop.as_ref(), &path) {
            Ok(()) => Reply::done(),
            Err(e) => e.into(),
        }
    }

    pub fn open_path(&self, path: &str) -> Reply {
        self.desktop_call(path, |shell, p| shell.open_path(p))
    }

    pub fn show_in_folder(&self, path: &str) -> Reply {
        self.desktop_call(path, |shell, p| shell.show_in_folder(p))
    }

    /// Runs one request and renders its reply as JSON.
    pub async fn dispatch(&self, request: Request) -> Value {
        match request {
            Request::StartJob(spec) => to_json(&self.start_job(spec)),
            Request::CancelJob => to_json(&self.cancel_job()),
            Request::JobState => to_json(&self.job_state()),
            Request::DiscoverCheckpoints { task } => to_json(&self.discover_checkpoints(&task).await),
            Request::DiscoverInterpreters => to_json(&self.discover_interpreters().await),
            Request::DiscoverScripts => to_json(&self.discover_scripts().await),
            Request::ValidateInterpreter { path } => to_json(&self.validate_interpreter(&path).await),
            Request::ValidateFile { path } => to_json(&self.validate_file(&path)),
            Request::GpuInfo { python } => to_json(&self.gpu_info(&python).await),
            Request::GetSettings => self.get_settings(),
            Request::SetSettings { settings } => to_json(&self.set_settings(&settings)),
            Request::OpenPath { path } => to_json(&self.open_path(&path)),
            Request::ShowInFolder { path } => to_json(&self.show_in_folder(&path)),
        }
    }
}
