mod bridge;
mod cli;
mod config;
mod desktop;
mod discovery;
mod error;
mod runner;
mod serve;
mod settings;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use bridge::{Bridge, EventSink};
use cli::{Cli, Command, DiscoverTarget, ValidateTarget};
use config::ArtifexConfig;
use discovery::DiscoveryEngine;
use error::ArtifexError;
use runner::{JobSpec, OutputEvent};
use ui::JobProgress;

fn init_tracing(verbose: bool) {
    let default = if verbose { "artifex=debug" } else { "artifex=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<ArtifexConfig> {
    match path {
        Some(path) if !path.exists() => {
            Err(ArtifexError::Config(format!("config file not found: {}", path.display())).into())
        }
        Some(path) => ArtifexConfig::load_from(path),
        None => ArtifexConfig::load(),
    }
}

/// Bridge for one-shot commands that never start a job.
fn quiet_bridge(config: &ArtifexConfig) -> Bridge {
    let sink: Arc<dyn EventSink> = Arc::new(|event: &OutputEvent| debug!(?event, "unexpected event"));
    Bridge::from_config(config, sink)
}

async fn run_job(config: &ArtifexConfig, spec: JobSpec) -> i32 {
    let (tx, mut events) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(move |event: &OutputEvent| {
        let _ = tx.send(event.clone());
    });
    let bridge = Bridge::from_config(config, sink);

    let description = format!("{} {}", spec.executable.display(), spec.script.display());
    let started = bridge.start_job(spec);
    if !started.ok {
        ui::print_reply(&started);
        return 1;
    }

    let progress = JobProgress::start(&description);
    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(OutputEvent::Output { stream, text, .. }) => progress.output(stream, &text),
                Some(OutputEvent::Exited { code, .. }) => {
                    progress.complete(code);
                    return code.unwrap_or(1);
                }
                None => {
                    progress.complete(None);
                    return 1;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                }
                interrupts += 1;
                if interrupts == 1 {
                    progress.note("Cancelling worker... (Ctrl-C again to kill)");
                    let reply = bridge.cancel_job();
                    if !reply.ok {
                        warn!(message = ?reply.message, "cancel failed");
                    }
                } else {
                    // A worker that ignores SIGTERM stays alive after the cancel.
                    progress.note("Killing worker...");
                    bridge.shutdown();
                }
            }
        }
    }
}

fn discover(config: &ArtifexConfig, target: DiscoverTarget) {
    let engine = DiscoveryEngine::from_environment(config.discovery.clone());
    match target {
        DiscoverTarget::Checkpoints { task } => {
            let task = task.trim().to_lowercase();
            ui::print_candidates(
                &format!("Checkpoints for {task}"),
                &engine.checkpoint_candidates(&task),
            );
        }
        DiscoverTarget::Interpreters => {
            ui::print_candidates("Interpreters", &engine.interpreter_candidates());
        }
        DiscoverTarget::Scripts => {
            ui::print_candidates("Generation scripts", &engine.script_candidates());
        }
    }
}

async fn validate(config: &ArtifexConfig, target: ValidateTarget) -> bool {
    let bridge = quiet_bridge(config);
    match target {
        ValidateTarget::Interpreter { path } => {
            let reply = bridge.validate_interpreter(&path).await;
            ui::print_reply(&reply);
            reply.ok
        }
        ValidateTarget::File { path } => {
            let reply = bridge.validate_file(&path);
            ui::print_reply(&reply);
            reply.ok
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            script,
            python,
            cwd,
            stdin,
            args,
        } => {
            let mut spec = JobSpec::new(python, script).with_args(args);
            if let Some(cwd) = cwd {
                spec = spec.with_cwd(cwd);
            }
            if let Some(payload) = stdin {
                spec = spec.with_stdin(payload);
            }
            let code = run_job(&config, spec).await;
            std::process::exit(code);
        }
        Command::Discover { target } => discover(&config, target),
        Command::Validate { target } => {
            if !validate(&config, target).await {
                std::process::exit(1);
            }
        }
        Command::Gpu { python } => {
            let reply = quiet_bridge(&config).gpu_info(&python).await;
            ui::print_reply(&reply);
            if !reply.ok {
                std::process::exit(1);
            }
        }
        Command::Serve => {
            serve::serve(tokio::io::stdin(), tokio::io::stdout(), |sink| {
                Bridge::from_config(&config, sink)
            })
            .await?;
        }
    }

    Ok(())
}
