//! statectl - read, write and watch named state from the shell

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stated_daemon::logging::init_tracing;
use stated_system::{Client, NotificationKind, Watcher};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

/// sysexits(3) codes
const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;

#[derive(Parser)]
#[command(name = "statectl")]
#[command(about = "Read, write and watch stated names")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current value of a name
    Get { name: String },
    /// Publish a new value for a name
    Set { name: String, value: String },
    /// Print every change to the given names until interrupted
    Watch {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EX_USAGE);
        }
    };

    let level = if cli.debug { "debug" } else { "warn" };
    if let Err(e) = init_tracing(level, None) {
        eprintln!("{:#}", e);
    }

    let client = match Client::from_env() {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to initialize the state client: {}", e);
            return ExitCode::from(EX_DATAERR);
        }
    };

    match cli.command {
        Commands::Get { name } => get_state(&client, &name),
        Commands::Set { name, value } => set_state(&client, &name, &value),
        Commands::Watch { names } => match watch_states(Arc::new(client), &names).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::from(EX_DATAERR)
            }
        },
    }
}

fn get_state(client: &Client, name: &str) -> ExitCode {
    let value = client.subscribe(name).and_then(|()| client.get(name));
    match value {
        Ok(value) => {
            let mut stdout = std::io::stdout().lock();
            if stdout.write_all(&value).and_then(|()| stdout.flush()).is_err() {
                return ExitCode::from(EX_DATAERR);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Unable to read {}: {}", name, e);
            ExitCode::from(EX_DATAERR)
        }
    }
}

fn set_state(client: &Client, name: &str, value: &str) -> ExitCode {
    if let Err(e) = client.bind(name) {
        error!("{}", e);
        println!("ERROR: unable to bind to key");
        return ExitCode::from(EX_DATAERR);
    }
    if let Err(e) = client.publish(name, value.as_bytes()) {
        error!("{}", e);
        println!("ERROR: unable to publish new value");
        return ExitCode::from(EX_DATAERR);
    }
    ExitCode::SUCCESS
}

async fn watch_states(client: Arc<Client>, names: &[String]) -> Result<()> {
    for name in names {
        client
            .subscribe(name)
            .with_context(|| format!("Unable to subscribe to {}", name))?;
    }

    let watcher = Watcher::spawn(Arc::clone(&client), 256)?;
    let mut notifications = watcher.subscribe();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.with_context(|| "Failed to install Ctrl+C handler")?;
                break;
            }
            received = notifications.recv() => match received {
                Ok(notification) => {
                    let value = String::from_utf8_lossy(&notification.value);
                    match notification.kind {
                        NotificationKind::Changed => println!("{}={}", notification.name, value),
                        NotificationKind::Deleted => {
                            println!("{} deleted (last value {})", notification.name, value)
                        }
                    }
                    if names.iter().all(|name| !client.is_subscribed(name)) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} notifications", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    watcher.shutdown().await;
    Ok(())
}
