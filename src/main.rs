use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use readout_gateway::pipeline::Destination;
use readout_gateway::{Config, Daemon, RunOptions};

/// Readout - ordered text-to-speech playback over a synthesis task queue
#[derive(Parser)]
#[command(name = "readout", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/readout/config.toml)
    #[arg(short, long, env = "READOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers, sweeper and playback in one process
    Run {
        /// Destinations to play back, as ROOM/CHANNEL
        #[arg(short, long = "destination")]
        destinations: Vec<Destination>,

        /// Submit lines read from stdin
        #[arg(long)]
        stdin: bool,

        /// Do not run synthesis workers in this process
        #[arg(long)]
        no_workers: bool,
    },
    /// Run synthesis workers only
    Worker {
        /// Number of workers (overrides config)
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },
    /// Delete expired results and stale artifacts
    Sweep {
        /// Sweep once and exit instead of running on an interval
        #[arg(long)]
        once: bool,
    },
    /// Queue one text for synthesis
    Submit {
        /// Target as ROOM/CHANNEL
        destination: Destination,
        /// Text to read out
        text: String,
    },
    /// Show queue status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,readout_gateway=info",
        1 => "info,readout_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command.unwrap_or(Command::Run {
        destinations: Vec::new(),
        stdin: false,
        no_workers: false,
    }) {
        Command::Run {
            destinations,
            stdin,
            no_workers,
        } => {
            let daemon = Daemon::new(config)?;
            daemon
                .run(RunOptions {
                    workers: !no_workers,
                    sweeper: true,
                    destinations,
                    read_stdin: stdin,
                })
                .await?;
        }
        Command::Worker { concurrency } => {
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            let daemon = Daemon::new(config)?;
            daemon
                .run(RunOptions {
                    workers: true,
                    ..RunOptions::default()
                })
                .await?;
        }
        Command::Sweep { once } => {
            let daemon = Daemon::new(config)?;
            if once {
                let report = daemon.sweeper().sweep_once().await?;
                println!(
                    "Removed {} expired result(s), {} artifact(s) and {} stale ready entries",
                    report.expired_results, report.artifacts_removed, report.ready_entries_removed
                );
            } else {
                daemon
                    .run(RunOptions {
                        sweeper: true,
                        ..RunOptions::default()
                    })
                    .await?;
            }
        }
        Command::Submit { destination, text } => {
            let daemon = Daemon::new(config)?;
            let task_id = daemon.submitter().submit(&text, destination).await?;
            println!("{task_id}");
        }
        Command::Status { json } => {
            let daemon = Daemon::new(config)?;
            let status = daemon.status().await?;
            if json {
                println!("{}", status.to_json()?);
            } else {
                println!("Backend:       {}", status.backend);
                println!("Pending tasks: {}", status.pending_tasks);
            }
        }
    }

    Ok(())
}
