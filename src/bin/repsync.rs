//! repsync — command-line driver for the sync core
//!
//! Exercises resilient loading against real endpoints and shows the
//! effective configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use repsync::transport::HttpTransport;
use repsync::{FetchCandidate, FetchEvent, FetchOutcome, SyncClient, SyncConfig, SyncEvent};

/// repsync CLI
#[derive(Parser)]
#[command(name = "repsync")]
#[command(version = repsync::PKG_VERSION)]
#[command(about = "Client-side sync core: resilient fetch and config inspection")]
struct Args {
    /// Config file (default: <config dir>/repsync/config.toml)
    #[arg(short, long, env = "REPSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load from ordered candidate sources with retry and failover
    Fetch {
        /// Candidate sources, most preferred first
        #[arg(required = true)]
        sources: Vec<String>,
        /// Retries per candidate after the first attempt
        #[arg(long)]
        retries: Option<u32>,
        /// Delay before the first retry, in milliseconds
        #[arg(long)]
        base_delay_ms: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = SyncConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml_string()?);
        }

        Command::Fetch {
            sources,
            retries,
            base_delay_ms,
        } => {
            let mut options = config.fetch.clone();
            if let Some(n) = retries {
                options = options.max_retries_per_candidate(n);
            }
            if let Some(ms) = base_delay_ms {
                options = options.base_delay(Duration::from_millis(ms));
            }

            let transport = Arc::new(HttpTransport::from_config(&config.transport)?);
            let client = SyncClient::builder()
                .transport(transport)
                .config(config)
                .build()?;

            let candidates = FetchCandidate::ordered(sources);
            let session =
                client.load_resilient_observed(candidates, Some(options), print_event);

            match session.wait().await {
                FetchOutcome::Ready { candidate, value } => {
                    eprintln!("loaded from {}", candidate.source_ref);
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                FetchOutcome::Exhausted { history } => {
                    for record in &history {
                        eprintln!(
                            "{}: {} (after {} retries)",
                            record.candidate.source_ref, record.last_error, record.retries
                        );
                    }
                    return Err("all candidates failed".into());
                }
                FetchOutcome::Cancelled => return Err("cancelled".into()),
            }
        }
    }

    Ok(())
}

fn print_event(event: &SyncEvent) {
    if let SyncEvent::Fetch(FetchEvent::Attempting {
        candidate, retry, ..
    }) = event
    {
        if *retry == 0 {
            eprintln!("trying {}", candidate.source_ref);
        } else {
            eprintln!("retry {retry} of {}", candidate.source_ref);
        }
    }
}
