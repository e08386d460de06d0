mod bootstrap;
mod cli;
mod notify;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use keyrot_core::config::Config;
use keyrot_core::orchestrator::{Collaborators, NoticeTemplate, Orchestrator};
use keyrot_core::summary::{EXIT_RUN_ERROR, RunSummary};
use keyrot_core::{AdminIdentitySource, RosterSource, roster};
use keyrot_file::{FileIdentitySource, FileKeySource, FileRosterSource};
use keyrot_ssh::SshConnector;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::cli::{Command, OutputFormat};

fn main() -> Result<()> {
    // Reset SIGPIPE so `keyrot rotate | head` exits quietly.
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    // stdout carries the run summary only.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match cli::parse(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("error: {msg}");
            cli::print_help();
            std::process::exit(EXIT_RUN_ERROR);
        }
    };

    match cli.command {
        Command::Help => {
            cli::print_help();
            Ok(())
        }
        Command::Roster => runtime()?.block_on(cmd_roster(&cli.config)),
        Command::Rotate { format } => {
            // Still single-threaded: harden before the runtime spawns workers
            // and before the admin key is read.
            bootstrap::secure_bootstrap();
            let code = runtime()?.block_on(cmd_rotate(&cli.config, format));
            std::process::exit(code);
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        anyhow::bail!("config file not found at {}", path.display());
    }

    // The config names the admin key location; keep it private.
    keyrot_file::warn_if_exposed(path, "config file");

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}

async fn cmd_roster(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let raw = FileRosterSource::new(&config.roster.path).fetch().await?;
    let users = roster::parse(&raw, &config.roster.format()).map_err(keyrot_core::RotationError::from)?;
    println!("{}", serde_json::to_string_pretty(&users)?);
    Ok(())
}

/// Run one pass and map the outcome to a process exit status.
async fn cmd_rotate(config_path: &Path, format: OutputFormat) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            return EXIT_RUN_ERROR;
        }
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("received shutdown signal; stopping after the current user");
        let _ = cancel_tx.send(true);
    });

    match rotate(&config, cancel_rx).await {
        Ok(summary) => {
            if let Err(e) = print_summary(&summary, format) {
                tracing::error!("could not write run summary: {e}");
            }
            summary.exit_code(config.rotation.failure_policy)
        }
        Err(e) => {
            tracing::error!("rotation aborted: {e:#}");
            EXIT_RUN_ERROR
        }
    }
}

async fn rotate(config: &Config, cancel: watch::Receiver<bool>) -> Result<RunSummary> {
    let identity = FileIdentitySource::new(&config.identity.private_key_path)
        .with_json_field(config.identity.json_field.clone())
        .with_passphrase_env(config.identity.passphrase_env.clone())
        .admin_identity()
        .await?;
    let connector = SshConnector::new(&config.host, identity)?;

    let collaborators = Collaborators {
        connector: Arc::new(connector),
        roster: Arc::new(FileRosterSource::new(&config.roster.path)),
        keys: Arc::new(FileKeySource::new(
            &config.keys.directory,
            config.keys.file_template.clone(),
        )),
        notifier: notify::build(&config.notify)?,
    };
    let orchestrator = Orchestrator::new(
        collaborators,
        config.roster.format(),
        config.rotation.clone(),
        NoticeTemplate::from(&config.notify),
    );
    Ok(orchestrator.run(cancel).await?)
}

fn print_summary(summary: &RunSummary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        OutputFormat::Text => print!("{}", summary.render_text()),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
