use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::broker::{AmqpConnector, BrokerClient, MemoryBroker};
use crate::config::{APP_NAME, CONSUMER_TAG_PREFIX};
use crate::dispatcher::{Dispatcher, recorded};
use crate::engine::{CryptEngine, verify};
use crate::settings::Settings;
use crate::storage::FileStorage;
use crate::store::Store;
use crate::types::JobId;
use crate::ui;

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the configured keys unlock.
    Unlock,

    /// Run the engine on one container and store its payload.
    Ingest {
        /// Encrypted container.
        file: PathBuf,

        /// Job id the archive paths are derived from.
        #[arg(long, default_value_t = 0)]
        job_id: JobId,
    },

    /// Re-verify the archived copies of a job.
    Verify {
        job_id: JobId,
    },

    /// List jobs, newest first.
    Jobs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Feed a JSON-lines message file through the dispatcher on an in-process broker.
    Replay {
        file: PathBuf,
    },

    /// Consume the configured queue on the AMQP broker until interrupted.
    Worker,
}

#[derive(Parser)]
#[command(name = APP_NAME, version, about = "Ingest OpenPGP-encrypted submissions into the archive.")]
pub struct App {
    /// Settings file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,

    #[arg(skip)]
    settings: Settings,
}

impl App {
    pub fn init() -> Result<Self> {
        let mut app = Self::parse();
        app.settings = Settings::load(app.config.as_deref())?;

        let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&app.settings.worker.log_level)).context("invalid log filter")?;
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_file(true).with_line_number(true).finish();
        tracing::subscriber::set_global_default(subscriber)?;

        Ok(app)
    }

    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Unlock => Self::unlock(&self.settings),
            Commands::Ingest { file, job_id } => Self::ingest(&self.settings, file, job_id).await,
            Commands::Verify { job_id } => Self::verify(&self.settings, job_id).await,
            Commands::Jobs { limit } => Self::jobs(&self.settings, limit),
            Commands::Replay { file } => Self::replay(&self.settings, &file).await,
            Commands::Worker => Self::worker(&self.settings).await,
        }
    }

    fn unlock(settings: &Settings) -> Result<()> {
        let keyring = settings.keys.keyring()?;
        ui::show_keys(&keyring);
        Ok(())
    }

    async fn ingest(settings: &Settings, file: PathBuf, job_id: JobId) -> Result<()> {
        let keyring = settings.keys.keyring()?;
        let archive = FileStorage::new(&settings.storage.archive);
        let backup = FileStorage::new(&settings.storage.backup);

        let path = file.clone();
        let ingested = tokio::task::spawn_blocking(move || CryptEngine::service(&keyring).ingest(&path, job_id, &archive, &backup, keyring.archive(), &[]))
            .await?
            .with_context(|| format!("failed to ingest {}", file.display()))?;

        ui::show_ingested(&ingested);
        Ok(())
    }

    async fn verify(settings: &Settings, job_id: JobId) -> Result<()> {
        let store = Store::open(&settings.database.path, &settings.worker.name)?;
        let job = store.get(job_id)?;
        let recorded = recorded(&job)?;
        let keyring = Arc::new(settings.keys.keyring()?);

        verify::verify(&recorded, keyring).await.with_context(|| format!("job {job_id} failed verification"))?;
        ui::show_verified(job_id, &recorded.archive_path, &recorded.backup_path);
        Ok(())
    }

    fn jobs(settings: &Settings, limit: usize) -> Result<()> {
        let store = Store::open(&settings.database.path, &settings.worker.name)?;
        ui::show_jobs(&store.list(limit)?);
        Ok(())
    }

    async fn replay(settings: &Settings, file: &Path) -> Result<()> {
        let text = fs::read_to_string(file).with_context(|| format!("failed to read messages: {}", file.display()))?;
        let queue = settings.broker.queue.as_str();

        let broker = MemoryBroker::new();
        broker.declare_queue(queue);
        let mut count = 0;
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            broker.push(queue, line, None)?;
            count += 1;
        }
        broker.close(queue);
        ensure!(count > 0, "no messages in {}", file.display());
        info!(count, queue, "messages queued");

        let dispatcher = Self::dispatcher(settings)?;
        let client = BrokerClient::new(broker.clone(), settings.broker.connection_attempts, settings.broker.backoff()).on_failure(|e| error!("giving up on the broker: {e}"));
        client.connect().await.context("broker unreachable")?;
        let handled = dispatcher.run(&client, queue).await.context("consuming stopped")?;

        ui::show_published(&broker.published(), handled, broker.dead_letters().len());
        Ok(())
    }

    async fn worker(settings: &Settings) -> Result<()> {
        let Some(url) = settings.broker.url.clone() else {
            bail!("no broker URL; set [broker] url or LEGA_BROKER_URL");
        };
        let queue = settings.broker.queue.as_str();
        let dispatcher = Self::dispatcher(settings)?;

        let connector = AmqpConnector::new(url, format!("{CONSUMER_TAG_PREFIX}-{}", settings.worker.name));
        let client = BrokerClient::new(connector, settings.broker.connection_attempts, settings.broker.backoff()).on_failure(|e| error!("giving up on the broker: {e}"));
        client.connect().await.context("broker unreachable")?;
        info!(queue, worker = %settings.worker.name, "worker started");

        tokio::select! {
            handled = dispatcher.run(&client, queue) => {
                let handled = handled.context("consuming stopped")?;
                info!(handled, "queue closed");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown")?;
                info!("interrupted, shutting down");
            }
        }
        Ok(())
    }

    fn dispatcher(settings: &Settings) -> Result<Dispatcher<FileStorage>> {
        let keyring = Arc::new(settings.keys.keyring()?);
        let store = Store::open(&settings.database.path, &settings.worker.name)?;
        store.set_busy_timeout(settings.database.busy_timeout())?;

        let dispatcher = Dispatcher::new(
            store,
            keyring,
            FileStorage::new(&settings.storage.inbox),
            FileStorage::new(&settings.storage.archive),
            FileStorage::new(&settings.storage.backup),
        );
        Ok(dispatcher.with_retry(settings.broker.max_redeliveries, settings.broker.backoff()))
    }
}
