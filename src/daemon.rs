//! Readout daemon: wires the broker, workers, sweeper and destinations together

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::broker::{Broker, MemoryBroker, SqliteBroker};
use crate::config::{BrokerBackend, Config};
use crate::destinations::DestinationManager;
use crate::pipeline::{
    Destination, FailureNotice, PollerSettings, Sweeper, TaskSubmitter, WorkerPool, WorkerSettings,
};
use crate::voice::{AudioSink, CommandSynthesizer, Synthesizer, sink_from_config};
use crate::{Result, db};

/// How often the sqlite backend re-checks an empty queue or ready-list
const SQLITE_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How long busy workers get to finish their job on shutdown
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Lines buffered between the stdin thread and the submitter
const STDIN_BUFFER: usize = 32;

/// Which parts of the pipeline a process runs
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run the synthesis worker pool
    pub workers: bool,
    /// Run the housekeeping sweeper
    pub sweeper: bool,
    /// Destinations to activate at startup
    pub destinations: Vec<Destination>,
    /// Submit lines read from stdin (`[ROOM/CHANNEL] text`)
    pub read_stdin: bool,
}

/// Snapshot reported by `readout status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Backend description
    pub backend: String,
    /// Tasks submitted but not yet finished
    pub pending_tasks: usize,
}

impl StatusReport {
    /// Render as pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The readout daemon
pub struct Daemon {
    config: Config,
    broker: Broker,
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
}

impl Daemon {
    /// Create a daemon from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the broker backend cannot be opened
    pub fn new(config: Config) -> Result<Self> {
        let broker = open_broker(&config)?;
        let synthesizer: Arc<dyn Synthesizer> =
            Arc::new(CommandSynthesizer::new(config.synthesis.clone()));
        let sink = sink_from_config(&config.playback);
        Ok(Self::with_components(config, broker, synthesizer, sink))
    }

    /// Create a daemon from already built components
    #[must_use]
    pub fn with_components(
        config: Config,
        broker: Broker,
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        Self {
            config,
            broker,
            synthesizer,
            sink,
        }
    }

    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    #[must_use]
    pub fn submitter(&self) -> TaskSubmitter {
        TaskSubmitter::new(
            Arc::clone(&self.broker.queue),
            self.config.synthesis.max_text_length,
        )
    }

    #[must_use]
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.broker.store),
            self.config.synthesis.scratch_dir.clone(),
            self.config.housekeeping.retention,
            self.config.housekeeping.sweep_interval,
        )
    }

    #[must_use]
    pub fn destinations(&self) -> DestinationManager {
        DestinationManager::new(
            Arc::clone(&self.broker.store),
            Arc::clone(&self.sink),
            PollerSettings::from(&self.config),
        )
    }

    #[must_use]
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::spawn(
            self.config.worker.concurrency,
            &self.broker,
            &self.synthesizer,
            &WorkerSettings::from(&self.config.worker),
        )
    }

    /// Report backend state
    ///
    /// # Errors
    ///
    /// Returns error if the task queue cannot be queried
    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            backend: describe_backend(&self.config.broker),
            pending_tasks: self.broker.queue.pending().await?,
        })
    }

    /// Run until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown signal cannot be installed
    pub async fn run(self, options: RunOptions) -> Result<()> {
        tracing::info!(
            backend = %describe_backend(&self.config.broker),
            workers = options.workers,
            sweeper = options.sweeper,
            destinations = options.destinations.len(),
            "starting readout daemon"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = options.workers.then(|| self.worker_pool());
        let sweeper = options
            .sweeper
            .then(|| tokio::spawn(self.sweeper().run(shutdown_rx.clone())));

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let destinations = Arc::new(self.destinations().with_notices(notice_tx));
        for destination in &options.destinations {
            destinations.activate(*destination).await;
        }
        let notices = tokio::spawn(log_notices(notice_rx));

        let feeder = match (options.read_stdin, options.destinations.first()) {
            (true, Some(&default)) => Some(tokio::spawn(feed_stdin(
                self.submitter(),
                Arc::clone(&destinations),
                default,
                shutdown_rx.clone(),
            ))),
            (true, None) => {
                tracing::warn!("stdin input needs at least one destination, ignoring stdin");
                None
            }
            (false, _) => None,
        };

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");

        let _ = shutdown_tx.send(true);
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        destinations.shutdown().await;
        if let Some(pool) = pool {
            pool.shutdown(WORKER_STOP_GRACE).await;
        }
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        drop(destinations);
        let _ = notices.await;

        tracing::info!("readout daemon stopped");
        Ok(())
    }
}

/// Open the broker backend named in the configuration
///
/// # Errors
///
/// Returns error if the database cannot be opened
pub fn open_broker(config: &Config) -> Result<Broker> {
    let visibility_timeout = config.worker.visibility_timeout;
    Ok(match &config.broker {
        BrokerBackend::Memory => {
            Broker::from_backend(Arc::new(MemoryBroker::new(visibility_timeout)))
        }
        BrokerBackend::Sqlite { path } => {
            let pool = db::init(path)?;
            Broker::from_backend(Arc::new(SqliteBroker::new(
                pool,
                visibility_timeout,
                SQLITE_RECHECK_INTERVAL,
            )))
        }
    })
}

fn describe_backend(backend: &BrokerBackend) -> String {
    match backend {
        BrokerBackend::Memory => "memory".to_string(),
        BrokerBackend::Sqlite { path } => format!("sqlite ({})", path.display()),
    }
}

async fn log_notices(mut notices: mpsc::UnboundedReceiver<FailureNotice>) {
    while let Some(notice) = notices.recv().await {
        tracing::warn!(
            destination = %notice.destination,
            task_id = %notice.request_id,
            status = notice.status.as_str(),
            reason = %notice.reason,
            "text will not be read out"
        );
    }
}

/// Read stdin lines on a plain thread, outside the runtime's blocking pool
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(STDIN_BUFFER);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    break;
                }
            }
        }
        tracing::debug!("stdin closed");
    });
    rx
}

async fn feed_stdin(
    submitter: TaskSubmitter,
    destinations: Arc<DestinationManager>,
    default: Destination,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = spawn_stdin_reader();

    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            break;
        };

        let Some((destination, text)) = parse_line(&line, default) else {
            continue;
        };
        destinations.activate(destination).await;

        match submitter.submit(text, destination).await {
            Ok(task_id) => tracing::debug!(%task_id, %destination, "submitted from stdin"),
            Err(e) => tracing::warn!(%destination, error = %e, "submission rejected"),
        }
    }
}

/// Split an input line into its destination and text
///
/// A leading `ROOM/CHANNEL` token picks the destination; otherwise the
/// whole line goes to `default`. Blank lines are skipped.
fn parse_line(line: &str, default: Destination) -> Option<(Destination, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some((head, rest)) = line.split_once(char::is_whitespace)
        && let Ok(destination) = head.parse::<Destination>()
    {
        let rest = rest.trim();
        return (!rest.is_empty()).then_some((destination, rest));
    }

    Some((default, line))
}
