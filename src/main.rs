mod cli;
mod config;
mod controller;
mod discovery;
mod error;
mod executor;
mod scheduler;
mod state_machine;
mod store;
mod ui;

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Command};
use config::GbatchConfig;
use controller::{Controller, LogStream, StartOptions};
use error::GbatchError;
use scheduler::RunSummary;
use ui::RunProgress;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG tem precedência; sem ele, warn (ou info com --verbose).
    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// 2 for configuration and usage problems, 1 for everything else.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<GbatchError>())
        .map(GbatchError::exit_code)
        .unwrap_or(1)
}

async fn run(cli: Cli) -> Result<u8> {
    let mut config = GbatchConfig::load(cli.config.as_deref())
        .map_err(|e| GbatchError::Configuration(format!("{e:#}")))?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    let show_progress = !cli.verbose && std::io::stderr().is_terminal();

    match cli.command {
        Command::Start {
            input,
            session,
            concurrency,
            retry_budget,
            timeout,
            pattern,
            command,
        } => {
            let options = StartOptions {
                concurrency,
                retry_budget,
                timeout_secs: timeout,
                pattern,
                command,
            };
            let progress = progress_bar(show_progress);
            let summary = Controller::new(config)
                .with_observer(progress.clone())
                .abort_on_interrupt()
                .start(&input, &session, options)
                .await;
            progress.finish();
            let summary = summary.with_context(|| format!("session '{session}' did not run"))?;
            Ok(report(&session, &summary))
        }
        Command::Resume {
            session,
            concurrency,
        } => {
            let progress = progress_bar(show_progress);
            let summary = Controller::new(config)
                .with_observer(progress.clone())
                .abort_on_interrupt()
                .resume(&session, concurrency)
                .await;
            progress.finish();
            let summary = summary.with_context(|| format!("session '{session}' did not resume"))?;
            Ok(report(&session, &summary))
        }
        Command::Status { session, json } => {
            let status = Controller::new(config).status(&session)?;
            if json {
                ui::print_status_json(&status);
            } else {
                ui::print_status(&status);
            }
            Ok(0)
        }
        Command::Abort { session } => {
            Controller::new(config).abort(&session)?;
            println!("Abort requested for session '{session}'");
            Ok(0)
        }
        Command::Retry { session, key } => {
            let record = Controller::new(config).retry(&session, &key)?;
            println!(
                "Unit '{}' queued for retry; run `gbatch resume {session}` to execute it",
                record.key
            );
            Ok(0)
        }
        Command::Logs {
            session,
            key,
            stderr,
            lines,
        } => {
            let stream = if stderr {
                LogStream::Stderr
            } else {
                LogStream::Stdout
            };
            match Controller::new(config).logs(&session, &key, stream, lines)? {
                Some((path, contents)) => {
                    eprintln!("==> {} <==", path.display());
                    if !contents.is_empty() {
                        println!("{contents}");
                    }
                }
                None => eprintln!("Unit '{key}' has not run yet"),
            }
            Ok(0)
        }
        Command::Sessions => {
            let controller = Controller::new(config);
            let names = controller.sessions()?;
            if names.is_empty() {
                eprintln!("No sessions in {}", controller.state_dir().display());
            }
            for name in names {
                println!("{name}");
            }
            Ok(0)
        }
    }
}

fn progress_bar(visible: bool) -> Arc<RunProgress> {
    Arc::new(if visible {
        RunProgress::new()
    } else {
        RunProgress::hidden()
    })
}

fn report(session: &str, summary: &RunSummary) -> u8 {
    ui::print_summary(session, summary);
    summary.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_follows_error_kind() {
        let config = anyhow::Error::from(GbatchError::Configuration("bad".into()));
        assert_eq!(exit_code_for(&config), 2);

        let missing = anyhow::Error::from(GbatchError::SessionNotFound("s".into()))
            .context("session 's' did not resume");
        assert_eq!(exit_code_for(&missing), 1);
    }
}
