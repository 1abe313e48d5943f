//! Abertura de arquivos e pastas no gerenciador do sistema.
//!
//! O trait [`DesktopShell`] isola a chamada ao sistema operacional para que a
//! camada de fronteira possa ser testada com um dublê.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use crate::error::{ArtifexError, Result};

/// Operações de "abrir" e "revelar" delegadas ao ambiente desktop.
pub trait DesktopShell: Send + Sync {
    /// Abre o caminho com o aplicativo padrão.
    fn open_path(&self, path: &Path) -> Result<()>;

    /// Revela o caminho na pasta que o contém.
    fn show_in_folder(&self, path: &Path) -> Result<()>;
}

/// Implementação que chama `explorer`, `open` ou `xdg-open`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

/// Programa e argumentos usados para abrir ou revelar `path` nesta plataforma.
pub fn launcher(path: &Path, reveal: bool) -> (&'static str, Vec<PathBuf>) {
    if cfg!(target_os = "windows") {
        if reveal {
            let mut select = std::ffi::OsString::from("/select,");
            select.push(path);
            ("explorer", vec![PathBuf::from(select)])
        } else {
            ("explorer", vec![path.to_path_buf()])
        }
    } else if cfg!(target_os = "macos") {
        if reveal {
            ("open", vec![PathBuf::from("-R"), path.to_path_buf()])
        } else {
            ("open", vec![path.to_path_buf()])
        }
    } else {
        // xdg-open não sabe selecionar um arquivo; abre a pasta que o contém.
        let target = if reveal && !path.is_dir() {
            path.parent().unwrap_or(path)
        } else {
            path
        };
        ("xdg-open", vec![target.to_path_buf()])
    }
}

/// Inicia `program` sem esperar por ele; uma thread recolhe o processo
/// quando ele termina, para não deixar zumbis em sessões longas.
fn spawn_detached(program: &str, args: &[PathBuf]) -> Result<thread::JoinHandle<()>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ArtifexError::invocation(program, e))?;

    let program = program.to_string();
    let reaper = thread::Builder::new()
        .name("desktop-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => debug!(%program, %status, "desktop handler finished"),
            Err(e) => warn!(%program, error = %e, "failed to wait on desktop handler"),
        })?;
    Ok(reaper)
}

fn launch(path: &Path, reveal: bool) -> Result<()> {
    if !path.exists() {
        return Err(ArtifexError::NotFound(path.display().to_string()));
    }
    let (program, args) = launcher(path, reveal);
    debug!(program, path = %path.display(), reveal, "launching desktop handler");
    spawn_detached(program, &args)?;
    Ok(())
}

impl DesktopShell for SystemShell {
    fn open_path(&self, path: &Path) -> Result<()> {
        launch(path, false)
    }

    fn show_in_folder(&self, path: &Path) -> Result<()> {
        launch(path, true)
    }
}
