//! stated - state namespace daemon
//!
//! Prepares the shared namespace root (optionally as a size-limited tmpfs),
//! then waits for SIGINT or SIGTERM and tears it down again.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use stated_daemon::logging::init_tracing;
use stated_daemon::{ConfigManager, DaemonConfig, Provisioner};
use tokio::signal;
use tracing::{info, warn};

/// stated - filesystem-backed state notification daemon
#[derive(Parser)]
#[command(name = "stated")]
#[command(about = "Provision the stated namespace and keep it alive")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start(StartArgs),
    /// Validate configuration
    Validate(ValidateArgs),
    /// Generate default configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "stated.toml")]
    config: PathBuf,

    /// Run in foreground (don't daemonize)
    #[arg(short, long)]
    foreground: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file to validate
    #[arg(short, long, default_value = "stated.toml")]
    config: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    /// Output file for generated config
    #[arg(short, long, default_value = "stated.toml")]
    output: PathBuf,

    /// Overwrite existing file
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Detach before any runtime threads exist
    let command = match cli.command {
        Commands::Start(mut args) => {
            args.config = absolute(&args.config)?;
            if !args.foreground {
                daemonize()?;
            }
            Commands::Start(args)
        }
        other => other,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to build the tokio runtime")?;

    runtime.block_on(async {
        match command {
            Commands::Start(args) => start_daemon(args).await,
            Commands::Validate(args) => validate_config(args).await,
            Commands::Config(args) => generate_config(args).await,
        }
    })
}

/// Start the stated daemon
async fn start_daemon(args: StartArgs) -> Result<()> {
    let mut config_manager = ConfigManager::new();
    let found = args.config.exists();
    if found {
        config_manager
            .load_from_file(&args.config)
            .await
            .with_context(|| "Failed to load configuration")?;
    }

    let config = config_manager.get_config().await;
    ConfigManager::validate(&config)?;

    let level = if args.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_tracing(level, config.logging.file.as_deref())?;

    info!("Starting stated daemon v{}", env!("CARGO_PKG_VERSION"));
    if !found {
        warn!("Configuration file not found, using defaults");
    }

    let mut provisioner =
        Provisioner::new(config.client.shared_root.clone(), config.provision.clone());
    provisioner.prepare()?;

    shutdown_signal().await?;

    provisioner.release()?;
    info!("stated stopped");
    Ok(())
}

/// Validate configuration file
async fn validate_config(args: ValidateArgs) -> Result<()> {
    let mut config_manager = ConfigManager::new();
    config_manager.load_from_file(&args.config).await?;

    let config = config_manager.get_config().await;
    ConfigManager::validate(&config)?;

    println!("✓ Configuration is valid");
    Ok(())
}

/// Generate default configuration file
async fn generate_config(args: ConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "Configuration file already exists: {}",
            args.output.display()
        );
    }

    let config_manager = ConfigManager::new();
    config_manager.save_to_file(&args.output).await?;

    println!(
        "Generated configuration file: {} (shared root {})",
        args.output.display(),
        DaemonConfig::default().client.shared_root.display()
    );
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().with_context(|| "Failed to read the working directory")?;
    Ok(cwd.join(path))
}

fn daemonize() -> Result<()> {
    if unsafe { libc::daemon(0, 0) } < 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| "Unable to daemonize");
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .with_context(|| "Failed to install SIGTERM handler")?;

    tokio::select! {
        result = signal::ctrl_c() => result.with_context(|| "Failed to install Ctrl+C handler")?,
        _ = terminate.recv() => {},
    }

    info!("Shutdown signal received, releasing the namespace");
    Ok(())
}
