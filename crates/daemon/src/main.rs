//! Server Dash Daemon
//!
//! Authenticated browser terminal for the Server Dash dashboard.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::protocol::{Role, TokenKey};
use daemon::{AuditLog, DashServer, PtySpawner, SessionGate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// File name prefix for rolling log files.
const LOG_FILE_NAME: &str = "server-dash.log";

/// Server Dash - authenticated remote shell for the dashboard.
#[derive(Parser, Debug)]
#[command(name = "server-dash")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the terminal server
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Print a signed admin token for the session cookie
    Token {
        /// Token lifetime in seconds (overrides config)
        #[arg(long, value_name = "SECS")]
        ttl: Option<u64>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::Config(ConfigCommands::Init { force }) = cli.command {
        return init_config(&config_path, force);
    }

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    let overrides = config.apply_env_overrides();
    if let Commands::Serve { bind: Some(bind) } = &cli.command {
        config.server.bind_address = bind.clone();
    }

    // Validate configuration
    config.validate()?;

    let _log_guard = init_tracing(&config, cli.verbose);
    tracing::debug!("Using config file: {:?}", config_path);
    for (field, value) in &overrides {
        tracing::info!("Overriding {} from environment: {}", field, value);
    }

    match cli.command {
        Commands::Serve { .. } => run_serve(config).await,
        Commands::Token { ttl } => {
            let secret = config.auth.load_secret()?;
            let ttl = Duration::from_secs(ttl.unwrap_or(config.auth.token_ttl_secs));
            let token = TokenKey::from_secret(secret.as_bytes())
                .with_ttl(ttl)
                .issue(Role::Admin)
                .context("Failed to sign token")?;
            println!("{}", token);
            Ok(())
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { .. }) => Ok(()),
    }
}

/// Install the tracing subscriber.
///
/// `--verbose` forces debug output; otherwise `RUST_LOG` wins over the
/// configured level. The returned guard flushes the log file on drop.
fn init_tracing(config: &Config, verbose: bool) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

/// Write the default configuration to `path`.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Serve terminal sessions until SIGTERM or SIGINT.
async fn run_serve(config: Config) -> anyhow::Result<()> {
    let secret = config.auth.load_secret()?;
    let key = TokenKey::from_secret(secret.as_bytes())
        .with_ttl(Duration::from_secs(config.auth.token_ttl_secs));
    let gate = SessionGate::new(Arc::new(key), config.auth.cookie_name.clone());

    let audit = Arc::new(AuditLog::new(config.daemon.audit_log_path()));
    if let Some(path) = audit.path() {
        tracing::info!("Audit log: {}", path.display());
    }

    let bind_address = config.server.bind_address.clone();
    let server = Arc::new(DashServer::new(
        config,
        gate,
        Arc::new(PtySpawner::new()),
        audit,
    )?);
    let listener = server
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;

    tracing::info!("Server Dash terminal starting on {}", bind_address);
    let mut serve = tokio::spawn(Arc::clone(&server).serve(listener));

    tokio::select! {
        signal = wait_for_shutdown_signal() => signal?,
        result = &mut serve => {
            result?.context("Terminal server failed")?;
            return Ok(());
        }
    }
    tracing::info!("Received shutdown signal");

    server.shutdown().await;
    serve.await?.context("Terminal server failed")?;

    tracing::info!("Server Dash terminal stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
