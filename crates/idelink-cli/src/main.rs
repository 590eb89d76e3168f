#![deny(unsafe_code)]

//! idelink CLI: drive an analysis daemon from the command line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use idelink_config::{AppConfig, LoggingConfig};
use idelink_core::protocol::Hover;
use idelink_core::{BuildInfo, ServiceHandle, StopReason, TelemetryCollector, TelemetryReader};

/// idelink: client for an out-of-process IDE analysis daemon.
#[derive(Parser)]
#[command(name = "idelink", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "idelink.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print captured lifecycle telemetry before exiting.
    #[arg(long)]
    telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon, report its status, and shut it down.
    Status,

    /// Ask the daemon for hover information at a position.
    Hover {
        file: PathBuf,
        /// 1-based line.
        line: u32,
        /// 1-based column.
        column: u32,
    },

    /// Stream daemon notifications until Ctrl-C.
    Watch {
        /// Report this file as changed before watching.
        #[arg(long)]
        touch: Option<PathBuf>,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Print build information.
    Version {
        /// Emit JSON instead of a single line.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, from_file) = load_config(&cli.config).await?;
    let telemetry = init_tracing(&config.logging, cli.verbose);
    if !from_file {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Status => cmd_status(&config).await?,
        Commands::Hover { file, line, column } => {
            cmd_hover(&config, Hover { path: file, line, column }).await?
        }
        Commands::Watch { touch } => cmd_watch(&config, touch).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
        Commands::Version { json } => cmd_version(json)?,
    }

    if cli.telemetry {
        print_telemetry(&telemetry);
    }
    Ok(())
}

/// Install the fmt layer (stderr, filtered) and the telemetry collector.
fn init_tracing(logging: &LoggingConfig, verbose: u8) -> TelemetryReader {
    let filter = match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let collector = TelemetryCollector::new(logging.telemetry_buffer);
    let reader = collector.reader();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .with(collector)
        .init();
    reader
}

/// Spawn the daemon, run the handshake, and start the serve loop.
async fn connect(config: &AppConfig) -> Result<(ServiceHandle, JoinHandle<()>)> {
    let init_id = format!("cli-{}", std::process::id());
    let service = ServiceHandle::make(&init_id, &config.daemon)?;

    let init = service
        .initialize_from_saved_state(
            config.project.root.clone(),
            config.project.saved_state_path.clone(),
            config.daemon.wait_for_init,
            config.project.ranked_autocomplete,
        )
        .await;
    if let Err(e) = init {
        service.stop(&init_id, StopReason::EditorExited).await;
        return Err(e).context("daemon failed to initialize");
    }

    let serving = service.clone();
    let serve = tokio::spawn(async move { serving.serve().await });
    Ok((service, serve))
}

async fn disconnect(service: ServiceHandle, serve: JoinHandle<()>) -> Result<()> {
    service.stop("cli-exit", StopReason::EditorExited).await;
    serve.await.context("serve loop panicked")?;
    Ok(())
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let (service, serve) = connect(config).await?;
    println!("{}", service.status());
    disconnect(service, serve).await
}

async fn cmd_hover(config: &AppConfig, request: Hover) -> Result<()> {
    let (service, serve) = connect(config).await?;
    let position = format!(
        "{}:{}:{}",
        request.path.display(),
        request.line,
        request.column
    );

    let reply = service.rpc("cli-hover", request).await;
    let outcome = match reply {
        Ok(Some(text)) => {
            println!("{text}");
            Ok(())
        }
        Ok(None) => {
            println!("No hover information at {position}");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("hover at {position} failed"))),
    };

    disconnect(service, serve).await?;
    outcome
}

async fn cmd_watch(config: &AppConfig, touch: Option<PathBuf>) -> Result<()> {
    let (service, serve) = connect(config).await?;
    if let Some(path) = touch {
        service.notify_file_changed("cli-touch", path);
    }

    let notifications = service.notifications();
    loop {
        tokio::select! {
            next = notifications.pop() => match next {
                Some(notification) => match serde_json::to_string(&notification) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, ?notification, "could not render notification"),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping daemon");
                break;
            }
        }
    }

    disconnect(service, serve).await
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

fn cmd_version(json: bool) -> Result<()> {
    let info = BuildInfo::current();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("idelink {info}");
    }
    Ok(())
}

fn print_telemetry(telemetry: &TelemetryReader) {
    for event in telemetry.events() {
        eprintln!(
            "[{:>8.3}s] {:<5} {:<18} {}{}",
            event.elapsed_secs,
            event.level,
            event.event,
            event.message,
            event
                .error
                .as_ref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }
}

/// Load the config file if it exists, otherwise defaults. The flag reports
/// whether the file was read.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use idelink_test_utils::config::TestConfigBuilder;
    use idelink_test_utils::init_test_tracing;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_hover_arguments() {
        let cli = Cli::parse_from(["idelink", "-vv", "hover", "src/lib.rs", "10", "4"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Hover { file, line, column } => {
                assert_eq!(file, PathBuf::from("src/lib.rs"));
                assert_eq!((line, column), (10, 4));
            }
            _ => panic!("expected hover command"),
        }
    }

    #[test]
    fn test_parse_watch_with_touch() {
        let cli = Cli::parse_from(["idelink", "--telemetry", "watch", "--touch", "a.rs"]);
        assert!(cli.telemetry);
        assert!(matches!(
            cli.command,
            Commands::Watch { touch: Some(ref p) } if p == Path::new("a.rs")
        ));
    }

    #[test]
    fn test_parse_version_json() {
        let cli = Cli::parse_from(["idelink", "version", "--json"]);
        assert!(matches!(cli.command, Commands::Version { json: true }));
    }

    #[tokio::test]
    async fn test_load_config_missing_file_uses_defaults() {
        let (config, from_file) = load_config(Path::new("/nonexistent/idelink.toml"))
            .await
            .unwrap();
        assert!(!from_file);
        assert_eq!(config.daemon.shutdown_timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_load_config_reads_file() {
        let (_dir, path) = TestConfigBuilder::new()
            .daemon_binary("/usr/local/bin/analyzer")
            .shutdown_timeout_secs(9)
            .project_root("/work/project")
            .write_temp();

        let (config, from_file) = load_config(&path).await.unwrap();
        assert!(from_file);
        assert_eq!(
            config.daemon.binary,
            PathBuf::from("/usr/local/bin/analyzer")
        );
        assert_eq!(config.daemon.shutdown_timeout_secs, 9);
        assert_eq!(config.project.root, PathBuf::from("/work/project"));
    }

    #[tokio::test]
    async fn test_load_config_rejects_invalid_file() {
        let (_dir, path) = TestConfigBuilder::new().shutdown_timeout_secs(0).write_temp();
        let err = load_config(&path).await.unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }

    #[tokio::test]
    async fn test_connect_reports_missing_binary() {
        init_test_tracing();
        let config = TestConfigBuilder::new()
            .daemon_binary("/nonexistent/ide-daemon")
            .build();
        let err = connect(&config).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn daemon"));
    }
}
