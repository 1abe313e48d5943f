//! Worker interpreter candidates and capability probing.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;
use crate::error::{ArtifexError, Result};

/// Sentinel for a library that could not be imported.
pub const MISSING: &str = "missing";
/// Sentinel for a value the interpreter printed nothing for.
pub const UNKNOWN: &str = "unknown";

const TORCH_PROBE: &str = "import torch\nprint(torch.__version__)\nprint(torch.cuda.is_available())";

const LIBRARY_PROBE: &str =
    "import diffusers, PIL\nprint(diffusers.__version__)\nprint(PIL.__version__)";

const GPU_PROBE: &str = r#"import json, torch
avail = torch.cuda.is_available()
name = torch.cuda.get_device_name(0) if avail else ""
mem = torch.cuda.get_device_properties(0).total_memory if avail else 0
bf16 = torch.cuda.is_bf16_supported() if avail else False
cuda_ver = getattr(torch.version, "cuda", None)
has_flash = False
try:
    import flash_attn
    has_flash = True
except Exception:
    pass
print(json.dumps({"available": avail, "name": name, "total_memory": int(mem), "bf16": bf16, "cuda_version": cuda_ver, "flash_attn": has_flash}))"#;

/// Whether the interpreter reports accelerated compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Accelerator {
    Available,
    #[serde(rename = "not available")]
    NotAvailable,
    Unknown,
}

/// Capability report for a validated interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterpreterReport {
    pub version: String,
    pub torch: String,
    pub cuda: Accelerator,
    pub diffusers: String,
    pub pil: String,
}

/// Accelerator details printed by the GPU probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub available: bool,
    pub name: String,
    pub total_memory: u64,
    pub bf16: bool,
    pub cuda_version: Option<String>,
    pub flash_attn: bool,
}

/// Whether `exe` is a real interpreter rather than an embedding host binary.
pub fn is_interpreter_executable(exe: &Path) -> bool {
    let stem = exe
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    stem == "py" || stem.starts_with("python")
}

fn env_interpreter(prefix: &Path, conda: bool) -> PathBuf {
    if cfg!(windows) {
        if conda {
            prefix.join("python.exe")
        } else {
            prefix.join("Scripts").join("python.exe")
        }
    } else {
        prefix.join("bin").join("python")
    }
}

/// Interpreter candidates in preference order, deduplicated.
///
/// Generic names are left for the OS search path to resolve at spawn time.
pub fn interpreter_candidates(
    config: &DiscoveryConfig,
    env: impl Fn(&str) -> Option<String>,
    host_exe: Option<&Path>,
) -> Vec<PathBuf> {
    let mut candidates: IndexSet<PathBuf> = IndexSet::new();

    candidates.extend(config.interpreter_names.iter().map(PathBuf::from));
    candidates.extend(config.interpreter_paths.iter().cloned());

    for (var, conda) in [("VIRTUAL_ENV", false), ("CONDA_PREFIX", true)] {
        if let Some(prefix) = env(var).filter(|v| !v.is_empty()) {
            candidates.insert(env_interpreter(Path::new(&prefix), conda));
        }
    }

    if let Some(exe) = host_exe {
        if is_interpreter_executable(exe) {
            candidates.insert(exe.to_path_buf());
        } else {
            debug!(exe = %exe.display(), "host executable is not an interpreter");
        }
    }

    candidates.into_iter().collect()
}

async fn run_captured(program: &Path, args: &[&str], timeout: Duration) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            ArtifexError::invocation(
                program.display(),
                format!("timed out after {}s", timeout.as_secs_f32()),
            )
        })?
        .map_err(|e| ArtifexError::invocation(program.display(), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim().lines().last() {
            Some(line) => format!("{}: {line}", output.status),
            None => output.status.to_string(),
        };
        return Err(ArtifexError::invocation(program.display(), reason));
    }

    Ok(output)
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

async fn probe(program: &Path, code: &str, timeout: Duration) -> Result<Vec<String>> {
    run_captured(program, &["-c", code], timeout)
        .await
        .map(|out| stdout_lines(&out))
        .map_err(|e| ArtifexError::ProbeUnavailable(e.to_string()))
}

async fn probe_torch(program: &Path, timeout: Duration) -> (String, Accelerator) {
    match probe(program, TORCH_PROBE, timeout).await {
        Ok(lines) => {
            let version = lines.first().cloned().unwrap_or_else(|| UNKNOWN.to_string());
            let cuda = match lines.get(1).map(String::as_str) {
                Some("True") => Accelerator::Available,
                _ => Accelerator::NotAvailable,
            };
            (version, cuda)
        }
        Err(e) => {
            warn!(program = %program.display(), error = %e, "torch probe failed");
            (MISSING.to_string(), Accelerator::Unknown)
        }
    }
}

async fn probe_libraries(program: &Path, timeout: Duration) -> (String, String) {
    match probe(program, LIBRARY_PROBE, timeout).await {
        Ok(lines) => {
            let mut versions = lines.into_iter();
            let diffusers = versions.next().unwrap_or_else(|| UNKNOWN.to_string());
            let pil = versions.next().unwrap_or_else(|| UNKNOWN.to_string());
            (diffusers, pil)
        }
        Err(e) => {
            warn!(program = %program.display(), error = %e, "library probe failed");
            (MISSING.to_string(), MISSING.to_string())
        }
    }
}

/// Runs `<program> -V`, then the optional capability probes.
///
/// Only the version query can fail; probe failures degrade to sentinels.
pub async fn validate_interpreter(program: &Path, timeout: Duration) -> Result<InterpreterReport> {
    let output = run_captured(program, &["-V"], timeout).await?;

    // Python 2 prints its version on stderr.
    let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        version = String::from_utf8_lossy(&output.stderr).trim().to_string();
    }

    let (torch, cuda) = probe_torch(program, timeout).await;
    let (diffusers, pil) = probe_libraries(program, timeout).await;

    Ok(InterpreterReport {
        version,
        torch,
        cuda,
        diffusers,
        pil,
    })
}

/// Queries accelerator details through the interpreter's torch install.
pub async fn gpu_info(program: &Path, timeout: Duration) -> Result<GpuInfo> {
    let output = run_captured(program, &["-c", GPU_PROBE], timeout).await?;
    let lines = stdout_lines(&output);
    let json = lines
        .last()
        .ok_or_else(|| ArtifexError::invocation(program.display(), "probe printed nothing"))?;
    serde_json::from_str(json)
        .map_err(|e| ArtifexError::invocation(program.display(), format!("unreadable probe output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn accelerator_wire_names() {
        let names: Vec<_> = [Accelerator::Available, Accelerator::NotAvailable, Accelerator::Unknown]
            .iter()
            .map(|a| serde_json::to_value(a).unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                serde_json::json!("available"),
                serde_json::json!("not available"),
                serde_json::json!("unknown"),
            ]
        );
    }

    #[test]
    fn candidates_keep_names_then_paths() {
        let mut cfg = DiscoveryConfig::default();
        cfg.interpreter_names = vec!["python".into(), "py".into(), "python".into()];
        cfg.interpreter_paths = vec![PathBuf::from("/opt/py/bin/python3")];

        let found = interpreter_candidates(&cfg, no_env, None);
        assert_eq!(
            found,
            vec![
                PathBuf::from("python"),
                PathBuf::from("py"),
                PathBuf::from("/opt/py/bin/python3"),
            ]
        );
    }

    #[test]
    fn candidates_exclude_embedding_host() {
        let cfg = DiscoveryConfig::default();
        let found = interpreter_candidates(&cfg, no_env, Some(Path::new("/usr/bin/artifex")));
        assert!(!found.contains(&PathBuf::from("/usr/bin/artifex")));
    }

    #[test]
    fn candidates_include_interpreter_host() {
        let cfg = DiscoveryConfig::default();
        let host = Path::new("/home/u/.pyenv/versions/3.11.4/bin/python3.11");
        let found = interpreter_candidates(&cfg, no_env, Some(host));
        assert_eq!(found.last().map(PathBuf::as_path), Some(host));
    }

    #[test]
    fn candidates_include_active_environments() {
        let cfg = DiscoveryConfig::default();
        let env = |key: &str| match key {
            "VIRTUAL_ENV" => Some("/work/.venv".to_string()),
            "CONDA_PREFIX" => Some(String::new()),
            _ => None,
        };
        let found = interpreter_candidates(&cfg, env, None);
        assert!(found.contains(&env_interpreter(Path::new("/work/.venv"), false)));
        assert_eq!(found.len(), cfg.interpreter_names.len() + cfg.interpreter_paths.len() + 1);
    }

    #[yare::parameterized(
        python       = { "/usr/bin/python",        true },
        python3      = { "/usr/bin/python3.11",    true },
        windows      = { "C:/Python311/python.exe", true },
        launcher     = { "py",                     true },
        electron     = { "/opt/app/electron",      false },
        host         = { "/usr/local/bin/artifex", false },
        pypy         = { "/usr/bin/pypy3",         false },
    )]
    fn recognizes_interpreters(path: &str, expected: bool) {
        assert_eq!(is_interpreter_executable(Path::new(path)), expected);
    }

    #[tokio::test]
    async fn validate_missing_program_is_invocation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = validate_interpreter(&tmp.path().join("python"), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ArtifexError::Invocation { .. })));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_python(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("python");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn validate_non_executable_file_fails() {
            let tmp = tempfile::tempdir().unwrap();
            let path = tmp.path().join("python");
            std::fs::write(&path, "not a program").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

            let result = validate_interpreter(&path, Duration::from_secs(5)).await;
            assert!(matches!(result, Err(ArtifexError::Invocation { .. })));
        }

        #[tokio::test]
        async fn validate_non_zero_version_query_fails() {
            let tmp = tempfile::tempdir().unwrap();
            let python = fake_python(tmp.path(), "echo 'bad interpreter' >&2\nexit 2");
            let err = validate_interpreter(&python, Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("bad interpreter"));
        }

        #[tokio::test]
        async fn probes_degrade_to_sentinels() {
            let tmp = tempfile::tempdir().unwrap();
            let python = fake_python(
                tmp.path(),
                r#"if [ "$1" = "-V" ]; then echo "Python 3.11.4"; exit 0; fi
case "$2" in
  *torch*) printf '2.4.0+cu121\nTrue\n' ;;
  *) echo "ModuleNotFoundError: No module named 'diffusers'" >&2; exit 1 ;;
esac"#,
            );

            let report = validate_interpreter(&python, Duration::from_secs(5)).await.unwrap();
            assert_eq!(report.version, "Python 3.11.4");
            assert_eq!(report.torch, "2.4.0+cu121");
            assert_eq!(report.cuda, Accelerator::Available);
            assert_eq!(report.diffusers, MISSING);
            assert_eq!(report.pil, MISSING);
        }

        #[tokio::test]
        async fn failed_torch_probe_reports_unknown_accelerator() {
            let tmp = tempfile::tempdir().unwrap();
            let python = fake_python(
                tmp.path(),
                r#"if [ "$1" = "-V" ]; then echo "Python 3.10.0"; exit 0; fi
case "$2" in
  *diffusers*) printf '0.30.0\n10.4.0\n' ;;
  *) exit 1 ;;
esac"#,
            );

            let report = validate_interpreter(&python, Duration::from_secs(5)).await.unwrap();
            assert_eq!(report.torch, MISSING);
            assert_eq!(report.cuda, Accelerator::Unknown);
            assert_eq!(report.diffusers, "0.30.0");
            assert_eq!(report.pil, "10.4.0");
        }

        #[tokio::test]
        async fn version_on_stderr_is_accepted() {
            let tmp = tempfile::tempdir().unwrap();
            let python = fake_python(
                tmp.path(),
                r#"if [ "$1" = "-V" ]; then echo "Python 2.7.18" >&2; exit 0; fi
exit 1"#,
            );
            let report = validate_interpreter(&python, Duration::from_secs(5)).await.unwrap();
            assert_eq!(report.version, "Python 2.7.18");
        }

        #[tokio::test]
        async fn hung_interpreter_times_out() {
            let tmp = tempfile::tempdir().unwrap();
            let python = fake_python(tmp.path(), "exec sleep 30");
            let started = std::time::Instant::now();
            let err = validate_interpreter(&python, Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("timed out"));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn gpu_info_parses_probe_json() {
            let tmp = tempfile::tempdir().unwrap();
            let python = fake_python(
                tmp.path(),
                r#"echo 'warming up'
echo '{"available": true, "name": "RTX 4090", "total_memory": 25757220864, "bf16": true, "cuda_version": "12.1", "flash_attn": false}'"#,
            );
            let info = gpu_info(&python, Duration::from_secs(5)).await.unwrap();
            assert!(info.available);
            assert_eq!(info.name, "RTX 4090");
            assert_eq!(info.cuda_version.as_deref(), Some("12.1"));
            assert!(!info.flash_attn);
        }

        #[tokio::test]
        async fn gpu_info_rejects_garbage() {
            let tmp = tempfile::tempdir().unwrap();
            let python = fake_python(tmp.path(), "echo 'no torch here'");
            let err = gpu_info(&python, Duration::from_secs(5)).await.unwrap_err();
            assert!(err.to_string().contains("unreadable probe output"));
        }
    }
}
