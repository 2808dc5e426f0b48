//! cartwatch CLI: run the session-aggregation engine over a JSONL event
//! stream, validate configuration, or look up a stored session summary.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use cartwatch_core::broker::{Broker, MemoryBroker};
use cartwatch_core::classifier::WeightedClassifier;
use cartwatch_core::config::EngineConfig;
use cartwatch_core::engine::Engine;
use cartwatch_core::error::{Error, Result};
use cartwatch_core::logging::init_logging;
use cartwatch_core::sink::{SessionSink, SqliteSink};

#[derive(Parser)]
#[command(
    name = "cartwatch",
    version,
    about = "Real-time session aggregation and cart-abandonment engine"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "cartwatch.toml", env = "CARTWATCH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume a JSONL event stream and persist session summaries.
    Run {
        /// Input file with one event JSON object per line ("-" for stdin).
        #[arg(long, default_value = "-")]
        input: String,

        /// SQLite database for session summaries.
        #[arg(long, default_value = "cartwatch.db")]
        db: PathBuf,

        /// Fixed classifier seed, for reproducible runs.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Parse and validate the configuration, then exit.
    ValidateConfig,

    /// Print the stored summary for one session.
    Show {
        /// SQLite database for session summaries.
        #[arg(long, default_value = "cartwatch.db")]
        db: PathBuf,

        /// Session id to look up.
        session_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(&cli.config)?;

    match cli.command {
        Command::ValidateConfig => {
            // `load` already validated; just echo the effective settings.
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Show { db, session_id } => {
            let sink = SqliteSink::open(&db)?;
            match sink.fetch(&session_id)? {
                Some(summary) => {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    Ok(())
                }
                None => Err(Error::Engine(format!("no summary for {session_id}"))),
            }
        }
        Command::Run { input, db, seed } => {
            init_logging(&config.log).map_err(|e| Error::Engine(e.to_string()))?;
            run_stream(config, &input, &db, seed).await
        }
    }
}

async fn run_stream(
    config: EngineConfig,
    input: &str,
    db: &Path,
    seed: Option<u64>,
) -> Result<()> {
    let broker = Arc::new(MemoryBroker::new(config.workers));
    let sink = Arc::new(SqliteSink::open(db)?);
    let classifier = Arc::new(match seed {
        Some(seed) => WeightedClassifier::seeded(&config.abandonment_weights, seed),
        None => WeightedClassifier::new(&config.abandonment_weights),
    });

    let engine = Engine::new(config, broker.clone(), sink, classifier)?;
    let handle = engine.start()?;

    let published = publish_events(&broker, input)?;
    info!(events = published, "input stream published");

    // Let the workers catch up before flushing.
    while broker.ready() + broker.in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = handle.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Publish each non-empty line of `input` to the broker, keyed by the
/// event's `session_id` so per-session ordering survives partitioning.
fn publish_events(broker: &MemoryBroker, input: &str) -> Result<u64> {
    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(input)?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut published = 0u64;
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Malformed lines still get published; the engine validates and
        // counts them, keeping one drop path for bad input.
        let key = serde_json::from_str::<serde_json::Value>(trimmed)
            .ok()
            .and_then(|v| {
                v.get("session_id")
                    .and_then(|s| s.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        broker.publish(&key, trimmed);
        published += 1;
    }
    Ok(published)
}
