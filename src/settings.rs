//! Persistência das preferências do usuário em `settings.json`.
//!
//! O conteúdo é opaco para o núcleo: um objeto JSON lido e gravado inteiro.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;

/// Nome do arquivo de preferências.
pub const SETTINGS_FILE: &str = "settings.json";

/// Armazenamento das preferências da interface.
pub trait SettingsStore: Send + Sync {
    /// Lê as preferências; `{}` quando ausentes ou ilegíveis.
    fn read(&self) -> Value;

    /// Substitui as preferências gravadas.
    fn write(&self, settings: &Value) -> Result<()>;
}

/// Preferências guardadas em um arquivo JSON no diretório de configuração do usuário.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Usa `<config_dir>/artifex/settings.json`, ou o diretório atual se o
    /// sistema não informar um diretório de configuração.
    pub fn in_user_config() -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("artifex");
        Self::new(dir.join(SETTINGS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn read(&self) -> Value {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no settings file");
                return Value::Object(Default::default());
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "settings file is not valid JSON");
                Value::Object(Default::default())
            }
        }
    }

    fn write(&self, settings: &Value) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(settings)?)?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}
