//! runhub daemon
//!
//! Runs the session hub and talks to a running hub over its control socket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use protocol::{Response, SessionList};
use runhub::config::Config;
use runhub::ipc::{get_socket_path, IpcClient};
use runhub::orchestrator::Orchestrator;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// runhub - share one interactive process between many remote observers.
#[derive(Parser, Debug)]
#[command(name = "runhubd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the hub until interrupted
    Start,

    /// Manage sessions on a running hub
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Relay this terminal's stdin/stdout to a session
    Attach {
        /// Session ID to attach to
        session_id: String,
    },

    /// Check that the hub is running
    Ping,
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// Start a new session
    New,

    /// List all live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Close a session
    Close {
        /// Session ID to close
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let _guard = init_logging(&config, cli.verbose, cli.log_file.as_deref())?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    let socket_path = config
        .daemon
        .socket_path
        .clone()
        .unwrap_or_else(get_socket_path);

    match cli.command {
        Commands::Start => run_daemon(config).await?,
        Commands::Sessions(SessionsCommands::New) => {
            let mut client = connect(&socket_path).await?;
            let response = client.new_session().await?;
            print_envelope(&response)?;
        }
        Commands::Sessions(SessionsCommands::List { json }) => {
            let mut client = connect(&socket_path).await?;
            let ids = client.list_sessions().await?;
            print_sessions(ids, json)?;
        }
        Commands::Sessions(SessionsCommands::Close { session_id }) => {
            let mut client = connect(&socket_path).await?;
            let response = client.close_session(&session_id).await?;
            print_envelope(&response)?;
        }
        Commands::Attach { session_id } => {
            let client = connect(&socket_path).await?;
            attach(client, &session_id).await?;
            // Stdin is read on a blocking thread that never returns on its own.
            std::process::exit(0);
        }
        Commands::Ping => {
            let mut client = connect(&socket_path).await?;
            if client.ping().await? {
                println!("runhub is running ({})", socket_path.display());
            } else {
                anyhow::bail!("Unexpected reply from daemon");
            }
        }
    }

    Ok(())
}

/// Initialize tracing; the returned guard flushes the log file on drop.
fn init_logging(
    config: &Config,
    verbose: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path {:?}", path))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect(socket_path).await.map_err(|_| {
        anyhow::anyhow!(
            "Daemon is not running (cannot connect to {})",
            socket_path.display()
        )
    })
}

/// Run the hub until SIGINT or SIGTERM.
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    tracing::info!("runhub daemon starting...");

    let mut orchestrator = Orchestrator::new(config)?;
    orchestrator.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

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

/// Print a response envelope; a `fail` envelope makes the command fail.
fn print_envelope(response: &Response) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(response)?);
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_sessions(ids: Vec<String>, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(&SessionList { ids })?);
    } else if ids.is_empty() {
        println!("No active sessions.");
    } else {
        for id in ids {
            println!("{id}");
        }
    }
    Ok(())
}

/// Relay local stdin/stdout to a session until the hub closes the relay.
async fn attach(mut client: IpcClient, session_id: &str) -> anyhow::Result<()> {
    let response = client.attach(session_id).await?;
    if !response.is_success() {
        anyhow::bail!(
            "Attach failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    tracing::debug!(session_id, "Attached");

    let (mut reader, mut writer) = client.into_relay();

    let input = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        if let Err(e) = tokio::io::copy(&mut stdin, &mut writer).await {
            tracing::debug!("Input relay ended: {}", e);
        }
    });

    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut reader, &mut stdout)
        .await
        .context("Output relay failed")?;
    input.abort();

    eprintln!("\n[session {session_id} closed]");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["runhubd", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "runhubd",
            "ping",
            "-v",
            "-c",
            "/tmp/runhub.toml",
            "--log-file",
            "/tmp/runhub.log",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/runhub.toml")));
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/runhub.log")));
        assert!(matches!(cli.command, Commands::Ping));
    }

    #[test]
    fn test_sessions_list_json() {
        let cli = Cli::try_parse_from(["runhubd", "sessions", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Sessions List command"),
        }
    }

    #[test]
    fn test_sessions_close_requires_id() {
        assert!(Cli::try_parse_from(["runhubd", "sessions", "close"]).is_err());

        let cli = Cli::try_parse_from(["runhubd", "sessions", "close", "abc"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Close { session_id }) => {
                assert_eq!(session_id, "abc")
            }
            _ => panic!("Expected Sessions Close command"),
        }
    }

    #[test]
    fn test_attach_command() {
        let cli = Cli::try_parse_from(["runhubd", "attach", "abc"]).unwrap();
        match cli.command {
            Commands::Attach { session_id } => assert_eq!(session_id, "abc"),
            _ => panic!("Expected Attach command"),
        }
    }
}
