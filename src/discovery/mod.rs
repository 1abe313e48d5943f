//! Asset discovery: ranked checkpoint folders, generation scripts and interpreters.

mod interpreter;
mod probe;
mod scorer;

pub use interpreter::{GpuInfo, InterpreterReport, gpu_info, validate_interpreter};
pub use probe::{checkpoint_dirs, find_files_named};
pub use scorer::{Candidate, CandidateScorer, Category, rank};

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use tracing::debug;

use crate::config::DiscoveryConfig;

/// Directories each discovery request searches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRoots {
    pub checkpoints: Vec<PathBuf>,
    pub scripts: Vec<PathBuf>,
    /// Exact script paths checked before any walk.
    pub known_scripts: Vec<PathBuf>,
}

fn dedup(paths: impl IntoIterator<Item = PathBuf>) -> Vec<PathBuf> {
    paths.into_iter().collect::<IndexSet<_>>().into_iter().collect()
}

impl SearchRoots {
    /// Roots around the process working directory and the user's folders.
    pub fn from_environment(config: &DiscoveryConfig) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::around(&cwd, dirs::document_dir(), dirs::download_dir(), config)
    }

    pub fn around(
        cwd: &Path,
        documents: Option<PathBuf>,
        downloads: Option<PathBuf>,
        config: &DiscoveryConfig,
    ) -> Self {
        // `..` of a filesystem root is the root itself.
        let workspace = cwd.parent().unwrap_or(cwd);
        let above = workspace.parent().unwrap_or(workspace);

        let checkpoints = dedup(
            [workspace.to_path_buf(), above.to_path_buf()]
                .into_iter()
                .chain(documents)
                .chain(downloads)
                .chain(config.extra_roots.iter().cloned()),
        );
        let scripts = dedup([cwd.to_path_buf(), workspace.to_path_buf(), above.to_path_buf()]);
        let known_scripts = config
            .known_script_dirs
            .iter()
            .map(|dir| workspace.join(dir).join(&config.script_name))
            .collect();

        Self {
            checkpoints,
            scripts,
            known_scripts,
        }
    }
}

/// Composes the prober and scorer over a fixed set of roots.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    roots: SearchRoots,
}

impl DiscoveryEngine {
    pub fn new(config: DiscoveryConfig, roots: SearchRoots) -> Self {
        Self { config, roots }
    }

    pub fn from_environment(config: DiscoveryConfig) -> Self {
        let roots = SearchRoots::from_environment(&config);
        debug!(?roots, "search roots");
        Self::new(config, roots)
    }

    /// Scored checkpoint folders for `task`, best first.
    pub fn checkpoint_candidates(&self, task: &str) -> Vec<Candidate> {
        let scorer = CandidateScorer::for_task(task, &self.config);
        let found = checkpoint_dirs(&self.roots.checkpoints, &self.config.markers);
        debug!(task, count = found.len(), "checkpoint scan finished");
        rank(found.into_iter().map(|dir| scorer.candidate(dir)).collect())
    }

    /// Checkpoint folder paths for `task`, best first. Never fails.
    pub fn checkpoints(&self, task: &str) -> Vec<PathBuf> {
        self.checkpoint_candidates(task)
            .into_iter()
            .map(|c| c.path)
            .collect()
    }

    /// Generation scripts: known locations first, then bounded walks of each root.
    pub fn script_candidates(&self) -> Vec<Candidate> {
        let mut found: IndexSet<PathBuf> = self
            .roots
            .known_scripts
            .iter()
            .filter(|p| p.is_file())
            .cloned()
            .collect();

        for root in &self.roots.scripts {
            found.extend(find_files_named(
                root,
                &self.config.script_name,
                self.config.max_depth,
            ));
        }

        debug!(count = found.len(), "script scan finished");
        rank(
            found
                .into_iter()
                .map(|p| Candidate::unscored(p, Category::Script))
                .collect(),
        )
    }

    pub fn scripts(&self) -> Vec<PathBuf> {
        self.script_candidates().into_iter().map(|c| c.path).collect()
    }

    /// Interpreter candidates for this process's environment.
    pub fn interpreter_candidates(&self) -> Vec<Candidate> {
        let host = std::env::current_exe().ok();
        interpreter::interpreter_candidates(&self.config, |key| std::env::var(key).ok(), host.as_deref())
            .into_iter()
            .map(|p| Candidate::unscored(p, Category::Interpreter))
            .collect()
    }

    pub fn interpreters(&self) -> Vec<PathBuf> {
        self.interpreter_candidates()
            .into_iter()
            .map(|c| c.path)
            .collect()
    }
}
