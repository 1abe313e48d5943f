//! Configuração do Artifex carregada a partir de `artifex.toml`.
//!
//! A struct [`ArtifexConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `ARTIFEX_PROBE_TIMEOUT_SECS` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "artifex.toml";

/// Variável de ambiente que sobrescreve o timeout das sondas do interpretador.
pub const PROBE_TIMEOUT_ENV: &str = "ARTIFEX_PROBE_TIMEOUT_SECS";

/// Configuração de nível superior carregada de `artifex.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifexConfig {
    /// Parâmetros do processo worker.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Parâmetros das sondas do interpretador.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Heurísticas de descoberta de checkpoints, scripts e interpretadores.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Parâmetros aplicados a todo worker iniciado.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Variáveis de ambiente forçadas sobre o ambiente do host.
    #[serde(default = "default_worker_env")]
    pub env: BTreeMap<String, String>,
}

// Força I/O em UTF-8 no worker Python.
fn default_worker_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ("PYTHONUTF8".to_string(), "1".to_string()),
    ])
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            env: default_worker_env(),
        }
    }
}

/// Parâmetros das sondas executadas contra um interpretador candidato.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Tempo máximo, em segundos, de cada invocação do interpretador.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Valor padrão do timeout: 30s (importar torch pode ser lento).
fn default_timeout_secs() -> u64 {
    30
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Regra que associa um prefixo de tarefa às dicas de nome de pasta.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskHintRule {
    pub prefix: String,
    pub hints: Vec<String>,
}

impl TaskHintRule {
    fn new(prefix: &str, hints: &[&str]) -> Self {
        Self {
            prefix: prefix.to_string(),
            hints: hints.iter().map(|h| h.to_string()).collect(),
        }
    }
}

/// Nomes de arquivos que marcam um diretório como checkpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointMarkers {
    pub config_files: Vec<String>,
    pub model_dirs: Vec<String>,
    pub index_file: String,
    pub vae_files: Vec<String>,
}

impl Default for CheckpointMarkers {
    fn default() -> Self {
        Self {
            config_files: strings(&["configuration.json", "config.json"]),
            model_dirs: strings(&["high_noise_model", "low_noise_model", "google"]),
            index_file: "diffusion_pytorch_model.safetensors.index.json".to_string(),
            vae_files: strings(&["Wan2.1_VAE.pth", "Wan2.2_VAE.pth"]),
        }
    }
}

/// Heurísticas de descoberta. Todas as strings são dados de ajuste do produto.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Regras avaliadas em ordem; a primeira cujo prefixo casa vence.
    pub task_hints: Vec<TaskHintRule>,
    /// Dicas usadas quando nenhuma regra casa.
    pub fallback_hints: Vec<String>,
    /// Token da família de releases que vale +1 no score.
    pub family_token: String,
    /// Prioridade por nome exato (minúsculo) da pasta.
    pub priorities: BTreeMap<String, u32>,
    pub markers: CheckpointMarkers,
    /// Raízes extras para a busca de checkpoints.
    pub extra_roots: Vec<PathBuf>,
    /// Pastas sob o workspace onde `generate.py` costuma estar.
    pub known_script_dirs: Vec<String>,
    pub script_name: String,
    /// Profundidade máxima, em níveis de diretório, da busca de scripts.
    pub max_depth: usize,
    /// Nomes genéricos resolvidos pelo PATH do sistema.
    pub interpreter_names: Vec<String>,
    /// Caminhos absolutos de instalações conhecidas.
    pub interpreter_paths: Vec<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            task_hints: vec![
                TaskHintRule::new("t2v", &["Wan2.2-T2V-A14B", "T2V", "t2v"]),
                TaskHintRule::new("i2v", &["Wan2.2-I2V-A14B", "I2V", "i2v"]),
                TaskHintRule::new("ti2v", &["Wan2.2-TI2V-5B", "TI2V", "ti2v"]),
                TaskHintRule::new("s2v", &["Wan2.2-S2V-14B", "S2V", "s2v"]),
            ],
            fallback_hints: strings(&["Wan2.2"]),
            family_token: "wan2.2".to_string(),
            priorities: BTreeMap::from([
                ("ti2v-5b".to_string(), 4),
                ("wan2.2-ti2v-5b".to_string(), 4),
                ("s2v-14b".to_string(), 3),
                ("wan2.2-s2v-14b".to_string(), 3),
                ("i2v-a14b".to_string(), 2),
                ("wan2.2-i2v-a14b".to_string(), 2),
                ("t2v-a14b".to_string(), 1),
                ("wan2.2-t2v-a14b".to_string(), 1),
            ]),
            markers: CheckpointMarkers::default(),
            extra_roots: Vec::new(),
            known_script_dirs: strings(&["Wan2.2", "Wan2.2_new"]),
            script_name: "generate.py".to_string(),
            max_depth: 3,
            interpreter_names: strings(&["python", "python3", "py"]),
            interpreter_paths: default_interpreter_paths(),
        }
    }
}

// Instalações conhecidas por plataforma.
fn default_interpreter_paths() -> Vec<PathBuf> {
    let paths: &[&str] = if cfg!(windows) {
        &["C:/Python311/python.exe", "C:/Program Files/Python311/python.exe"]
    } else if cfg!(target_os = "macos") {
        &["/opt/homebrew/bin/python3", "/usr/local/bin/python3", "/usr/bin/python3"]
    } else {
        &["/usr/bin/python3", "/usr/local/bin/python3"]
    };
    paths.iter().map(PathBuf::from).collect()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ArtifexConfig {
    /// Carrega a configuração de `artifex.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração do caminho informado, com fallback para os defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<ArtifexConfig>(&contents)
                .with_context(|| format!("invalid config {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    // Variável de ambiente tem precedência sobre o arquivo de configuração.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secs) = lookup(PROBE_TIMEOUT_ENV).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.probe.timeout_secs = secs;
        }
    }
}
