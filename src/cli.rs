//! Interface de linha de comando do Artifex baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, discover,
//! validate, gpu, serve) e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Artifex: núcleo de execução de jobs de geração de vídeo e descoberta de assets.
#[derive(Debug, Parser)]
#[command(name = "artifex", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho de um arquivo de configuração (padrão: ./artifex.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um script de geração e acompanha sua saída.
    Run {
        /// Script a executar (por exemplo, generate.py).
        script: PathBuf,

        /// Interpretador que executa o script.
        #[arg(long, default_value = "python")]
        python: PathBuf,

        /// Diretório de trabalho (padrão: pasta do script).
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Objeto JSON enviado como uma linha no stdin do worker.
        #[arg(long, value_parser = parse_json)]
        stdin: Option<serde_json::Value>,

        /// Argumentos repassados ao script.
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Procura checkpoints, interpretadores ou scripts.
    Discover {
        #[command(subcommand)]
        target: DiscoverTarget,
    },

    /// Valida um interpretador ou um arquivo de entrada.
    Validate {
        #[command(subcommand)]
        target: ValidateTarget,
    },

    /// Consulta a GPU através do torch do interpretador.
    Gpu {
        /// Interpretador a consultar.
        #[arg(long, default_value = "python")]
        python: String,
    },

    /// Atende requisições JSON, uma por linha, no stdin.
    Serve,
}

#[derive(Debug, Subcommand)]
pub enum DiscoverTarget {
    /// Pastas de checkpoint ordenadas para a tarefa.
    Checkpoints {
        /// Identificador da tarefa (por exemplo, ti2v-5B).
        task: String,
    },
    /// Interpretadores candidatos.
    Interpreters,
    /// Scripts de geração encontrados perto do diretório atual.
    Scripts,
}

#[derive(Debug, Subcommand)]
pub enum ValidateTarget {
    /// Versão e bibliotecas de um interpretador.
    Interpreter { path: String },
    /// Existência e tamanho de um arquivo.
    File { path: String },
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}
