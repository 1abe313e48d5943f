use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::DiscoveryConfig;

/// What a discovered path is proposed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Checkpoint,
    Script,
    Interpreter,
}

/// A scored filesystem path proposed for user confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub path: PathBuf,
    pub category: Category,
    /// Fixed table priority of the exact folder name; dominates `score`.
    pub priority: u32,
    /// Hint-match relevance; tiebreaker within a priority tier.
    pub score: u32,
}

/// Derives folder-name hints for a task identifier.
///
/// Rules are checked in order and the first matching prefix wins, so a
/// `t2v` rule listed before `ti2v` never shadows it (`ti2v` does not start
/// with `t2v`).
pub fn name_hints(task: &str, config: &DiscoveryConfig) -> Vec<String> {
    config
        .task_hints
        .iter()
        .find(|rule| task.starts_with(rule.prefix.as_str()))
        .map(|rule| rule.hints.clone())
        .unwrap_or_else(|| config.fallback_hints.clone())
}

/// Lowercased final path component; empty for roots like `/`.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

impl Candidate {
    /// Candidate without hint scoring; [`rank`] keeps these in discovery order.
    pub fn unscored(path: PathBuf, category: Category) -> Self {
        Self {
            path,
            category,
            priority: 0,
            score: 0,
        }
    }
}

/// Scores checkpoint folders against the hints derived from one task.
pub struct CandidateScorer<'a> {
    hints: Vec<String>,
    family_token: String,
    priorities: &'a BTreeMap<String, u32>,
}

impl<'a> CandidateScorer<'a> {
    pub fn for_task(task: &str, config: &'a DiscoveryConfig) -> Self {
        Self {
            hints: name_hints(task, config)
                .into_iter()
                .map(|h| h.to_lowercase())
                .collect(),
            family_token: config.family_token.to_lowercase(),
            priorities: &config.priorities,
        }
    }

    /// +2 per hint contained in the base name, +1 for the family token.
    pub fn score(&self, path: &Path) -> u32 {
        let base = base_name(path);
        let mut score = 0;

        for hint in &self.hints {
            if base.contains(hint.as_str()) {
                score += 2;
            }
        }
        if !self.family_token.is_empty() && base.contains(self.family_token.as_str()) {
            score += 1;
        }

        score
    }

    /// Exact base-name lookup in the priority table; unmapped names get 0.
    pub fn priority(&self, path: &Path) -> u32 {
        self.priorities.get(&base_name(path)).copied().unwrap_or(0)
    }

    pub fn candidate(&self, path: PathBuf) -> Candidate {
        Candidate {
            priority: self.priority(&path),
            score: self.score(&path),
            path,
            category: Category::Checkpoint,
        }
    }
}

/// Orders candidates by priority, then score, both descending.
///
/// The sort is stable, so equal keys keep discovery order.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.score.cmp(&a.score))
    });
    candidates
}
