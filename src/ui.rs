//! Interface de terminal do Artifex: spinner do job e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente a
//! execução de um worker no terminal.

use std::io::Write;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::bridge::Reply;
use crate::discovery::{Candidate, Category};
use crate::runner::StreamTag;

/// Última linha não vazia de um trecho de saída, considerando `\r` como
/// separador (barras de progresso do Python reescrevem a linha).
pub fn last_status_line(text: &str) -> Option<&str> {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
}

/// Indicador visual de progresso para a execução de um job no terminal.
///
/// O stdout do worker é repassado intacto para o stdout; o stderr aparece
/// em amarelo e sua última linha vira a mensagem do spinner.
pub struct JobProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para sucesso.
    green: Style,
    // Estilo vermelho para falha.
    red: Style,
    // Estilo amarelo para o stderr do worker.
    yellow: Style,
}

impl JobProgress {
    /// Inicia o spinner com a descrição do job.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(description.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Mostra um trecho de saída do worker sem quebrar o spinner.
    pub fn output(&self, stream: StreamTag, text: &str) {
        match stream {
            StreamTag::Stdout => self.pb.suspend(|| {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }),
            StreamTag::Stderr => {
                if let Some(line) = last_status_line(text) {
                    self.pb.set_message(line.to_string());
                }
                self.pb.suspend(|| eprint!("{}", self.yellow.apply_to(text)));
            }
        }
    }

    /// Exibe um aviso acima do spinner.
    pub fn note(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    /// Finaliza o spinner e exibe o código de saída do worker.
    pub fn complete(&self, code: Option<i32>) {
        self.pb.finish_and_clear();
        match code {
            Some(0) => eprintln!("  {} Worker finished", self.green.apply_to("✓")),
            Some(code) => eprintln!("  {} Worker exited with code {code}", self.red.apply_to("✗")),
            None => eprintln!("  {} Worker was terminated", self.red.apply_to("✗")),
        }
    }
}

/// Lista candidatos na ordem recebida; checkpoints mostram prioridade e score.
pub fn print_candidates(title: &str, candidates: &[Candidate]) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    println!("{}", bold.apply_to(title));
    if candidates.is_empty() {
        println!("  {}", dim.apply_to("no matches found"));
    }
    for c in candidates {
        match c.category {
            Category::Checkpoint => println!(
                "  {} {}",
                c.path.display(),
                dim.apply_to(format!("(priority {}, score {})", c.priority, c.score))
            ),
            Category::Script | Category::Interpreter => println!("  {}", c.path.display()),
        }
    }
}

/// Imprime a resposta de uma operação: verde com os dados, ou vermelho com a mensagem.
pub fn print_reply<T: Serialize>(reply: &Reply<T>) {
    if reply.ok {
        println!("{}", Style::new().green().bold().apply_to("ok"));
        if let Some(data) = &reply.data {
            println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
        }
    } else {
        eprintln!(
            "{} {}",
            Style::new().red().bold().apply_to("error:"),
            reply.message.as_deref().unwrap_or("unknown failure")
        );
    }
}
