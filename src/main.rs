use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::BufReader;
use tracing::{error, info};

use chatmap::config::AppConfig;
use chatmap::{commands, init_tracing, next_message, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "chatmap",
    version,
    about = "Turns chat messages into deduplicated, geocoded places"
)]
struct Cli {
    /// Data directory; overrides DATA_DIR
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read messages from stdin, one per line, until EOF or Ctrl-C
    Run,
    /// Handle a single message and print the outcome
    Resolve {
        /// Message text
        text: Vec<String>,
    },
    /// Print every stored place, newest first
    Places,
    /// Delete one place by id
    Delete { id: i64 },
    /// Delete every place
    Clear,
    /// Run one TTL pass now
    Sweep,
    /// Print the effective configuration and store status
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let state = AppState::initialize(config).context("failed to initialise chatmap")?;

    let result = match cli.command {
        Command::Run => run(&state).await,
        Command::Resolve { text } => {
            let outcome = state
                .pipeline()
                .handle_message(&text.join(" "), Utc::now())
                .await
                .context("failed to store place")?;
            print_json(&outcome)
        }
        Command::Places => print_json(&commands::list_places(&state)?),
        Command::Delete { id } => print_json(&commands::delete_place(&state, id).await?),
        Command::Clear => print_json(&commands::clear_places(&state).await?),
        Command::Sweep => print_json(&commands::sweep_now(&state).await?),
        Command::Config => print_json(&commands::status(&state)?),
    };
    state.shutdown();
    result
}

async fn run(state: &AppState) -> Result<()> {
    let sweeper = state.sweeper().clone().spawn();
    let pipeline = state.pipeline();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut buf = Vec::new();
    info!("reading messages from stdin");

    loop {
        tokio::select! {
            line = next_message(&mut stdin, &mut buf) => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(err) => {
                        error!(?err, "failed to read stdin");
                        break;
                    }
                };
                match pipeline.handle_message(&line, Utc::now()).await {
                    Ok(outcome) => print_json(&outcome)?,
                    // The message is dropped; the loop keeps going.
                    Err(err) => error!(?err, "failed to store place"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    sweeper.shutdown();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
