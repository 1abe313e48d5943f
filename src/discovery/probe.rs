//! Filesystem probing: checkpoint-shaped directories and files by exact name.
//!
//! Every read error is logged at debug level and treated as "not here"; a
//! scan never fails as a whole.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::CheckpointMarkers;

fn entry_names(dir: &Path) -> Option<HashSet<String>> {
    match std::fs::read_dir(dir) {
        Ok(entries) => Some(
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
        ),
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
            None
        }
    }
}

/// Whether `dir` holds a config file plus model shards, a shard index or VAE weights.
///
/// The shard index is also accepted one level down, where sharded releases
/// keep it next to the weights.
pub fn looks_like_checkpoint(dir: &Path, markers: &CheckpointMarkers) -> bool {
    let Some(items) = entry_names(dir) else {
        return false;
    };

    let has_config = markers.config_files.iter().any(|f| items.contains(f));
    if !has_config {
        return false;
    }

    let has_models = markers.model_dirs.iter().any(|d| items.contains(d));
    let has_vae = markers.vae_files.iter().any(|f| items.contains(f));
    if has_models || has_vae || items.contains(&markers.index_file) {
        return true;
    }

    list_subdirs(dir).iter().any(|sub| {
        entry_names(sub).is_some_and(|names| names.contains(&markers.index_file))
    })
}

/// Immediate subdirectories of `root` in name order; empty when unreadable.
pub fn list_subdirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        // `is_dir` follows symlinks and is false on stat errors.
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Checkpoint directories among each root, its children and grandchildren.
pub fn checkpoint_dirs(roots: &[PathBuf], markers: &CheckpointMarkers) -> Vec<PathBuf> {
    let mut found = IndexSet::new();
    let mut check = |dir: &Path| {
        if looks_like_checkpoint(dir, markers) {
            debug!(dir = %dir.display(), "checkpoint directory");
            found.insert(dir.to_path_buf());
        }
    };

    for root in roots {
        check(root);
        for dir in list_subdirs(root) {
            check(&dir);
            for sub in list_subdirs(&dir) {
                check(&sub);
            }
        }
    }

    found.into_iter().collect()
}

/// Files named exactly `name` at most `max_depth` directory levels below `root`.
///
/// Symlinks are followed; loops and unreadable entries are skipped.
pub fn find_files_named(root: &Path, name: &str, max_depth: usize) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        // A file in a directory `max_depth` levels down sits at walk depth `max_depth + 1`.
        .max_depth(max_depth + 1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(root = %root.display(), error = %e, "walk entry skipped");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == name)
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn markers() -> CheckpointMarkers {
        CheckpointMarkers::default()
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"{}").unwrap();
    }

    #[test]
    fn config_plus_model_dir_is_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("config.json"));
        fs::create_dir(tmp.path().join("high_noise_model")).unwrap();
        assert!(looks_like_checkpoint(tmp.path(), &markers()));
    }

    #[test]
    fn config_plus_vae_is_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("configuration.json"));
        touch(&tmp.path().join("Wan2.2_VAE.pth"));
        assert!(looks_like_checkpoint(tmp.path(), &markers()));
    }

    #[test]
    fn index_one_level_down_counts() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("config.json"));
        touch(
            &tmp.path()
                .join("transformer")
                .join("diffusion_pytorch_model.safetensors.index.json"),
        );
        assert!(looks_like_checkpoint(tmp.path(), &markers()));
    }

    #[test]
    fn index_two_levels_down_does_not_count() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("config.json"));
        touch(
            &tmp.path()
                .join("a")
                .join("b")
                .join("diffusion_pytorch_model.safetensors.index.json"),
        );
        assert!(!looks_like_checkpoint(tmp.path(), &markers()));
    }

    #[test]
    fn config_alone_is_not_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("config.json"));
        assert!(!looks_like_checkpoint(tmp.path(), &markers()));
    }

    #[test]
    fn weights_without_config_are_not_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("low_noise_model")).unwrap();
        touch(&tmp.path().join("Wan2.1_VAE.pth"));
        assert!(!looks_like_checkpoint(tmp.path(), &markers()));
    }

    #[test]
    fn missing_directory_is_not_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!looks_like_checkpoint(&tmp.path().join("nope"), &markers()));
    }

    #[test]
    fn list_subdirs_skips_files_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("b")).unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        touch(&tmp.path().join("c.txt"));
        let dirs = list_subdirs(tmp.path());
        assert_eq!(dirs, vec![tmp.path().join("a"), tmp.path().join("b")]);
        assert!(list_subdirs(&tmp.path().join("missing")).is_empty());
    }

    #[test]
    fn checkpoint_scan_covers_three_levels() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in [root.join("one"), root.join("x").join("two"), root.join("x").join("y").join("three")] {
            touch(&dir.join("config.json"));
            fs::create_dir_all(dir.join("google")).unwrap();
        }

        let found = checkpoint_dirs(&[root.to_path_buf()], &markers());
        assert_eq!(found, vec![root.join("one"), root.join("x").join("two")]);
    }

    #[test]
    fn checkpoint_scan_dedups_overlapping_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let ckpt = tmp.path().join("models").join("Wan2.2-TI2V-5B");
        touch(&ckpt.join("config.json"));
        touch(&ckpt.join("Wan2.2_VAE.pth"));

        let roots = vec![tmp.path().to_path_buf(), tmp.path().join("models")];
        assert_eq!(checkpoint_dirs(&roots, &markers()), vec![ckpt]);
    }

    #[test]
    fn find_files_respects_depth_bound() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let top = root.join("generate.py");
        let three = root.join("a").join("b").join("c").join("generate.py");
        let four = root.join("a").join("b").join("c").join("d").join("generate.py");
        for p in [&top, &three, &four] {
            touch(p);
        }

        let found = find_files_named(root, "generate.py", 3);
        assert!(found.contains(&top));
        assert!(found.contains(&three));
        assert!(!found.contains(&four));
    }

    #[test]
    fn find_files_matches_exact_name_only() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("generate.py.bak"));
        touch(&tmp.path().join("x").join("my_generate.py"));
        fs::create_dir_all(tmp.path().join("generate.py")).unwrap();
        assert!(find_files_named(tmp.path(), "generate.py", 3).is_empty());
    }

    #[test]
    fn find_files_on_missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_files_named(&tmp.path().join("missing"), "generate.py", 3).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn find_files_survives_symlink_loops() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = tmp.path().join("inner");
        touch(&inner.join("generate.py"));
        std::os::unix::fs::symlink(tmp.path(), inner.join("loop")).unwrap();

        let found = find_files_named(tmp.path(), "generate.py", 3);
        assert!(found.contains(&inner.join("generate.py")));
    }
}
