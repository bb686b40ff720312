#![allow(missing_docs)]

//! KarnEvil9 daemon — agentic task kernel behind an HTTP/WS control plane.
//!
//! `karnevil9 start` binds the control plane, wires the kernel
//! collaborators (journal, tool registry, planner, active memory), and
//! runs until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use tracing::{info, warn};

use karnevil9::config::ServerConfig;
use karnevil9::journal::{Journal, MemoryJournal, SqliteJournal};
use karnevil9::kernel::{InMemoryActiveMemory, KeywordPlanner};
use karnevil9::logging;
use karnevil9::server::Server;
use karnevil9::tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "karnevil9", version, about = "Agentic task kernel with a control-plane front door")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon.
    Start {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Opt in to running without an API token.
        #[arg(long)]
        insecure: bool,
    },
    /// Print the effective configuration and exit.
    CheckConfig {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            config,
            port,
            insecure,
        } => start(config, port, insecure).await,
        Command::CheckConfig { config } => {
            logging::init_cli();
            let config = load_config(config)?;
            config.validate().context("configuration invalid")?;
            println!("configuration ok: {}:{}", config.bind_addr, config.port);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ServerConfig> {
    let mut config = match path {
        Some(path) => ServerConfig::load(&path).context("failed to load config")?,
        None => {
            let mut config = ServerConfig::default();
            config.apply_env();
            config
        }
    };
    if config.journal_path.is_none() {
        if let Some(dirs) = ProjectDirs::from("", "", "karnevil9") {
            let data_dir = dirs.data_dir().to_path_buf();
            config.journal_path = Some(data_dir.join("journal.db"));
        }
    }
    Ok(config)
}

async fn start(config: Option<PathBuf>, port: Option<u16>, insecure: bool) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(port) = port {
        config.port = port;
    }
    if insecure {
        config.allow_insecure = true;
    }
    config.validate().context("configuration invalid")?;

    let logs_dir = ProjectDirs::from("", "", "karnevil9")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"));
    let _logging_guard = logging::init_production(&logs_dir)?;

    info!(version = env!("CARGO_PKG_VERSION"), "karnevil9 starting");

    // Journal: SQLite when a path is configured, in-memory otherwise.
    let journal: Arc<dyn Journal> = match &config.journal_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            info!(path = %path.display(), "opening journal");
            Arc::new(SqliteJournal::open(path).await.context("journal open failed")?)
        }
        None => {
            warn!("no journal path configured; events will not survive restarts");
            Arc::new(MemoryJournal::new())
        }
    };

    // Tool registry, hot reloaded from the specs directory when set.
    let registry = match &config.tool_specs_dir {
        Some(dir) => ToolRegistry::with_specs_dir(dir.clone())
            .context("failed to initialise tool registry")?,
        None => Arc::new(ToolRegistry::new()),
    };
    if registry.count() == 0 {
        warn!("no tools registered; sessions will fail planning until tools are added");
    }

    let server = Server::new(
        config,
        journal,
        registry,
        Arc::new(KeywordPlanner),
        Some(Arc::new(InMemoryActiveMemory::default())),
    )?;
    let addr = server.listen().await?;
    info!(%addr, "karnevil9 ready");

    wait_for_shutdown_signal().await;
    server.shutdown().await;
    info!("karnevil9 stopped");
    Ok(())
}

/// Wait for SIGINT or (on Unix) SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
