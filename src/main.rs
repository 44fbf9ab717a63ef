//! Muster CLI
//!
//! Runs one agent session in the foreground and prints what the manager sees.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use muster::{ManagerConfig, ManagerEvent, SessionManager, SpawnConfig};

#[derive(Parser)]
#[command(name = "muster")]
#[command(author, version, about = "PTY orchestration for coding-agent CLIs")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "MUSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session and relay stdin lines to it
    Run {
        /// Adapter type (claude, gemini, codex, aider, shell, or a configured one)
        #[arg(long = "type", short = 't', default_value = "shell")]
        kind: String,

        /// Session name
        #[arg(long, short)]
        name: Option<String>,

        /// Working directory of the agent
        #[arg(long, short)]
        workdir: Option<PathBuf>,

        /// Enable stall detection with this timeout (e.g. "30s")
        #[arg(long)]
        stall_timeout: Option<humantime::Duration>,

        /// Message to send once the session is ready
        #[arg(long, short)]
        message: Option<String>,
    },

    /// List registered adapter types
    Adapters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("muster=debug")
        } else {
            EnvFilter::new("muster=info")
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ManagerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let manager = SessionManager::from_config(config)?;

    match cli.command {
        Commands::Adapters => {
            for kind in manager.adapter_types() {
                println!("{}", kind);
            }
        }
        Commands::Run {
            kind,
            name,
            workdir,
            stall_timeout,
            message,
        } => {
            if let Some(timeout) = stall_timeout {
                manager.configure_stall_detection(true, Some(timeout.into()), None);
            }
            run(Arc::new(manager), kind, name, workdir, message).await?;
        }
    }

    Ok(())
}

async fn run(
    manager: Arc<SessionManager>,
    kind: String,
    name: Option<String>,
    workdir: Option<PathBuf>,
    message: Option<String>,
) -> anyhow::Result<()> {
    let name = name.unwrap_or_else(|| kind.clone());
    let mut spawn = SpawnConfig::new(name, kind);
    if let Some(dir) = workdir {
        spawn = spawn.with_workdir(dir);
    }

    let mut events = manager.subscribe();
    let handle = manager.spawn(spawn).await?;
    let id = handle.id.clone();
    info!(session = %id, pid = ?handle.pid, "Running {}", handle.kind);

    let terminal = manager
        .attach_terminal(&id)
        .context("session vanished right after spawn")?;
    let _output = terminal.on_data(|data| {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    });

    let mut pending = message;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = manager.send(&id, &line) {
                        warn!("{}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin: {}", e);
                    stdin_open = false;
                }
            },
            event = events.recv() => {
                let Ok(event) = event else { continue };
                if event.session_id() != id {
                    continue;
                }
                match &event {
                    ManagerEvent::SessionReady(_) => {
                        if let Some(text) = pending.take() {
                            manager.send(&id, &text)?;
                        }
                    }
                    ManagerEvent::BlockingPrompt { info, auto_responded, .. } => {
                        info!(auto_responded, "Prompt: {}", info.prompt);
                    }
                    ManagerEvent::LoginRequired { info, .. } => {
                        info!(url = ?info.url, instructions = ?info.instructions, "Login required");
                    }
                    ManagerEvent::StallDetected { duration, .. } => {
                        warn!("No output for {:?}", duration);
                    }
                    ManagerEvent::SessionStopped { reason, .. } => {
                        info!("Session stopped: {}", reason);
                        break;
                    }
                    other => tracing::debug!(event = other.name(), "Event"),
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
