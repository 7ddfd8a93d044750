//! Message routing.
//!
//! The [`Dispatcher`] decodes each delivery, runs the stage its `type` names
//! and turns the result into an [`Outcome`]:
//!
//! - success acknowledges the message
//! - a from-user failure is recorded, reported to the submitter and acknowledged
//! - a transient failure is requeued after a delay, up to a redelivery limit,
//!   and then handled as fatal
//! - anything else is recorded, reported to the operators and dead-lettered
//!
//! Every failure of a known job is also reported to the operators.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hashbrown::HashMap;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{Backoff, BrokerClient, BrokerError, Connector, Delivery, Outcome};
use crate::config::{
    DEFAULT_MAX_REDELIVERIES, DEFAULT_MAX_RETRY_DELAY_MS, DEFAULT_RETRY_DELAY_MS, OPERATOR_ERROR_ROUTING_KEY, OPERATOR_EXCHANGE, USER_ERROR_ROUTING_KEY, USER_EXCHANGE,
    VERIFIED_ROUTING_KEY,
};
use crate::engine::verify::{self, Recorded};
use crate::engine::{CryptEngine, EngineError, Ingested, Keyring};
use crate::error::{ErrorKind, IngestError, StageContext, StageError, UserError};
use crate::message::{AccessionRequest, FileRequest, Message, OperatorReport, UserErrorReport, Verified};
use crate::storage::{FileStorage, Storage};
use crate::store::{DatasetState, Job, Store, StoreError, Verification};
use crate::types::{Checksum, ChecksumAlgorithm, JobId, JobStatus, Stage};

/// Routes messages to pipeline stages.
pub struct Dispatcher<S> {
    store: Store,
    keyring: Arc<Keyring>,
    inbox: FileStorage,
    archive: S,
    backup: S,
    max_redeliveries: u32,
    retry_backoff: Backoff,
    /// Transient failures per message body, reset by a first delivery.
    attempts: Mutex<HashMap<[u8; 32], u32>>,
}

impl<S: Storage + Clone + 'static> Dispatcher<S> {
    pub fn new(store: Store, keyring: Arc<Keyring>, inbox: FileStorage, archive: S, backup: S) -> Self {
        Self {
            store,
            keyring,
            inbox,
            archive,
            backup,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            retry_backoff: Backoff::new(Duration::from_millis(DEFAULT_RETRY_DELAY_MS), Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS)),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Requeues a transiently failing message at most `max_redeliveries`
    /// times, waiting `backoff` before each requeue.
    #[must_use]
    pub fn with_retry(mut self, max_redeliveries: u32, backoff: Backoff) -> Self {
        self.max_redeliveries = max_redeliveries;
        self.retry_backoff = backoff;
        self
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Handles every message of `queue` until it is drained.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker channel fails.
    pub async fn run<C: Connector>(&self, client: &BrokerClient<C>, queue: &str) -> Result<u64, BrokerError> {
        client.consume(queue, |delivery| self.handle(client, delivery)).await
    }

    /// Handles one delivery.
    pub async fn handle<C: Connector>(&self, client: &BrokerClient<C>, delivery: Delivery) -> Outcome {
        let correlation_id = delivery.properties.correlation_id.clone().unwrap_or_default();

        let message = match Message::parse(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!("rejecting malformed message: {e}");
                let report = OperatorReport { error: "MalformedMessage".to_owned(), message: e.to_string() };
                self.publish(client, OPERATOR_EXCHANGE, OPERATOR_ERROR_ROUTING_KEY, &report, &correlation_id).await;
                return Outcome::Reject { requeue: false };
            }
        };

        debug!(kind = message.kind(), redelivered = delivery.redelivered, "dispatching");
        let key: [u8; 32] = Sha256::digest(&delivery.body).into();
        match self.route(client, &message, &correlation_id, delivery.redelivered).await {
            Ok(()) => {
                self.forget(&key);
                Outcome::Ack
            }
            Err(failure) if failure.error.kind() == ErrorKind::Transient => self.retry(client, &message, failure, key, delivery.redelivered, &correlation_id).await,
            Err(failure) => {
                self.forget(&key);
                self.fail(client, &message, &failure, &correlation_id).await
            }
        }
    }

    /// Requeues a transient failure, or gives up on it once the message was
    /// redelivered `max_redeliveries` times.
    async fn retry<C: Connector>(&self, client: &BrokerClient<C>, message: &Message, failure: StageError, key: [u8; 32], redelivered: bool, correlation_id: &str) -> Outcome {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let count = attempts.entry(key).or_insert(0);
            // A first delivery starts over, whatever an earlier run of the same body left behind.
            *count = if redelivered { *count + 1 } else { 1 };
            *count
        };

        if attempt > self.max_redeliveries {
            self.forget(&key);
            let exhausted = StageError {
                stage: failure.stage,
                job_id: failure.job_id,
                error: IngestError::Fatal(format!("gave up after {attempt} attempts: {}", failure.error.technical())),
            };
            return self.fail(client, message, &exhausted, correlation_id).await;
        }

        let delay = self.retry_backoff.delay(attempt - 1);
        warn!(attempt, ?delay, "{failure}, requeueing");
        sleep(delay).await;
        Outcome::Reject { requeue: true }
    }

    fn forget(&self, key: &[u8; 32]) {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    async fn route<C: Connector>(&self, client: &BrokerClient<C>, message: &Message, correlation_id: &str, redelivered: bool) -> Result<(), StageError> {
        match message {
            Message::Ingest(file) => self.ingest(client, file, correlation_id, redelivered).await,
            Message::Cancel(file) => self.cancel(file),
            Message::Accession(request) => self.accession(request),
            Message::Mapping(request) => {
                self.store.map(&request.dataset_id, &request.accession_ids).stage(Stage::Mapping, None)?;
                Ok(())
            }
            Message::Release(request) => self.set_dataset_state(&request.dataset_id, DatasetState::Released),
            Message::Deprecate(request) => self.set_dataset_state(&request.dataset_id, DatasetState::Deprecated),
            Message::Permission(request) => {
                self.store.grant(&request.dataset_id, &request.user).stage(Stage::Dataset, None)?;
                info!(dataset_id = %request.dataset_id, user = %request.user, "permission granted");
                Ok(())
            }
            Message::PermissionDeleted(request) => {
                let revoked = self.store.revoke(&request.dataset_id, &request.user).stage(Stage::Dataset, None)?;
                info!(dataset_id = %request.dataset_id, user = %request.user, revoked, "permission revoked");
                Ok(())
            }
            Message::Heartbeat => {
                info!("heartbeat");
                Ok(())
            }
        }
    }

    async fn ingest<C: Connector>(&self, client: &BrokerClient<C>, file: &FileRequest, correlation_id: &str, redelivered: bool) -> Result<(), StageError> {
        let created = self.store.create(correlation_id, &file.user, &file.filepath, file.encrypted_checksum()).stage(Stage::Dispatch, None)?;
        let job_id = created.job_id;

        async move {
            if created.existing && !redelivered {
                return Ok(());
            }

            match self.store.status(job_id).stage(Stage::Ingest, Some(job_id))? {
                JobStatus::Received => {
                    self.store.mark_in_ingestion(job_id).stage(Stage::Ingest, Some(job_id))?;
                }
                JobStatus::InIngestion => info!("resuming interrupted ingestion"),
                JobStatus::Verified => return self.verify(client, job_id, correlation_id).await,
                JobStatus::Archived => return self.announce(client, job_id, correlation_id).await,
                status => {
                    info!(%status, "job already finished");
                    return Ok(());
                }
            }

            let inbox = self
                .inbox
                .inbox_path(&file.user, &file.filepath)
                .map_err(|e| UserError::InboxMissing(format!("{e:#}")))
                .stage(Stage::Ingest, Some(job_id))?;
            let ingested = self.run_engine(inbox, job_id, file.encrypted_checksums.clone()).await.stage(Stage::Ingest, Some(job_id))?;

            let verification = Verification {
                session_key_fingerprints: ingested.session_key_fingerprints.clone(),
                header: ingested.header_hex(),
                archive_path: ingested.archive_path.display().to_string(),
                backup_path: ingested.backup_path.display().to_string(),
                archive_size: ingested.pass.archived.size(),
                archive_checksum: ingested.pass.archived.sha256_hex(),
                decrypted_checksum: ingested.pass.decrypted.sha256_hex(),
                decrypted_md5: ingested.pass.decrypted.md5_hex(),
            };

            match self.store.record_session_key_use(job_id, &verification) {
                Ok(()) => info!(session_keys = verification.session_key_fingerprints.len(), "job verified"),
                Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                    self.discard(&ingested);
                    info!(status = %from, "job finished during ingestion");
                    return Ok(());
                }
                Err(e) => {
                    self.discard(&ingested);
                    return Err(e).stage(Stage::Ingest, Some(job_id));
                }
            }

            self.verify(client, job_id, correlation_id).await
        }
        .instrument(info_span!("ingest", job_id, stage = %Stage::Ingest))
        .await
    }

    async fn run_engine(&self, inbox: PathBuf, job_id: JobId, expected: Vec<Checksum>) -> Result<Ingested, EngineError> {
        let keyring = Arc::clone(&self.keyring);
        let archive = self.archive.clone();
        let backup = self.backup.clone();

        tokio::task::spawn_blocking(move || CryptEngine::service(&keyring).ingest(&inbox, job_id, &archive, &backup, keyring.archive(), &expected))
            .await
            .map_err(|e| EngineError::Storage(format!("ingestion task failed: {e}")))?
    }

    /// Removes the copies of an ingestion that will not be kept.
    fn discard(&self, ingested: &Ingested) {
        for (storage, path) in [(&self.archive, &ingested.archive_path), (&self.backup, &ingested.backup_path)] {
            if let Err(e) = storage.remove(path) {
                warn!(path = %path.display(), "failed to remove discarded copy: {e:#}");
            }
        }
    }

    /// `VERIFIED -> ARCHIVED` once both copies check out.
    async fn verify<C: Connector>(&self, client: &BrokerClient<C>, job_id: JobId, correlation_id: &str) -> Result<(), StageError> {
        let job = self.store.get(job_id).stage(Stage::Verify, Some(job_id))?;
        if job.status != JobStatus::Verified {
            info!(status = %job.status, "verification skipped");
            return Ok(());
        }

        let recorded = recorded(&job).stage(Stage::Verify, Some(job_id))?;
        verify::verify(&recorded, Arc::clone(&self.keyring)).await.stage(Stage::Verify, Some(job_id))?;

        if !self.store.mark_archived(job_id).stage(Stage::Verify, Some(job_id))? {
            info!("job left VERIFIED during verification");
            return Ok(());
        }
        info!(archive = %recorded.archive_path.display(), backup = %recorded.backup_path.display(), "copies verified");

        self.announce(client, job_id, correlation_id).await
    }

    /// Tells the submitter an archived file is ready for an accession id.
    async fn announce<C: Connector>(&self, client: &BrokerClient<C>, job_id: JobId, correlation_id: &str) -> Result<(), StageError> {
        let job = self.store.get(job_id).stage(Stage::Verify, Some(job_id))?;
        let decrypted_checksums = [(ChecksumAlgorithm::Sha256, &job.decrypted_checksum), (ChecksumAlgorithm::Md5, &job.decrypted_md5)]
            .into_iter()
            .filter_map(|(algorithm, value)| value.as_ref().map(|value| Checksum::new(algorithm, value.clone())))
            .collect();

        let verified = Verified { user: job.user, filepath: job.inbox_path, decrypted_checksums };
        client.publish(USER_EXCHANGE, VERIFIED_ROUTING_KEY, &verified, correlation_id).await.stage(Stage::Verify, Some(job_id))
    }

    fn cancel(&self, file: &FileRequest) -> Result<(), StageError> {
        let _span = info_span!("cancel", stage = %Stage::Cancel).entered();
        let Some(job_id) = self.store.find(&file.user, &file.filepath).stage(Stage::Cancel, None)? else {
            warn!(user = %file.user, filepath = %file.filepath, "no job to cancel");
            return Ok(());
        };

        self.store.cancel(job_id).stage(Stage::Cancel, Some(job_id))?;
        Ok(())
    }

    fn accession(&self, request: &AccessionRequest) -> Result<(), StageError> {
        let file = &request.file;
        let _span = info_span!("accession", stage = %Stage::Accession, accession_id = %request.accession_id).entered();

        let Some(job_id) = self.store.find(&file.user, &file.filepath).stage(Stage::Accession, None)? else {
            return Err(IngestError::Fatal(format!("no job for {}:{}", file.user, file.filepath))).stage(Stage::Accession, None);
        };

        let job = self.store.get(job_id).stage(Stage::Accession, Some(job_id))?;
        if matches!(job.status, JobStatus::Error | JobStatus::Canceled) {
            info!(job_id, status = %job.status, "accession ignored");
            return Ok(());
        }

        for checksum in &request.decrypted_checksums {
            let recorded = match checksum.algorithm {
                ChecksumAlgorithm::Sha256 => job.decrypted_checksum.as_deref(),
                ChecksumAlgorithm::Md5 => job.decrypted_md5.as_deref(),
            };
            if recorded.is_some_and(|recorded| !recorded.eq_ignore_ascii_case(&checksum.value)) {
                return Err(UserError::ChecksumMismatch(format!("decrypted {} is not {}", checksum.algorithm.as_ref(), checksum.value))).stage(Stage::Accession, Some(job_id));
            }
        }

        self.store.finalize(job_id, &request.accession_id).stage(Stage::Accession, Some(job_id))
    }

    fn set_dataset_state(&self, dataset_id: &str, state: DatasetState) -> Result<(), StageError> {
        self.store.set_dataset_state(dataset_id, state).stage(Stage::Dataset, None)?;
        info!(dataset_id, state = state.as_ref(), "dataset state changed");
        Ok(())
    }

    async fn fail<C: Connector>(&self, client: &BrokerClient<C>, message: &Message, failure: &StageError, correlation_id: &str) -> Outcome {
        let error = &failure.error;
        let kind = error.kind();

        if kind == ErrorKind::FromUser {
            warn!("{failure}");
        } else {
            error!("{failure}");
        }

        if let Some(job_id) = failure.job_id {
            if let Err(e) = self.store.set_error(job_id, error.name(), &error.technical(), kind == ErrorKind::FromUser) {
                error!(job_id, "failed to record error: {e}");
            }
        }

        if let (IngestError::FromUser(_), Some(file)) = (error, message.file()) {
            let report = UserErrorReport {
                user: file.user.clone(),
                filepath: file.filepath.clone(),
                reason: error.technical(),
                encrypted_checksums: (!file.encrypted_checksums.is_empty()).then(|| file.encrypted_checksums.clone()),
            };
            self.publish(client, USER_EXCHANGE, USER_ERROR_ROUTING_KEY, &report, correlation_id).await;
        }

        let report = OperatorReport { error: error.name().to_owned(), message: failure.to_string() };
        self.publish(client, OPERATOR_EXCHANGE, OPERATOR_ERROR_ROUTING_KEY, &report, correlation_id).await;

        match kind {
            ErrorKind::FromUser => Outcome::Ack,
            _ => Outcome::Reject { requeue: false },
        }
    }

    async fn publish<C: Connector, T: serde::Serialize>(&self, client: &BrokerClient<C>, exchange: &str, routing_key: &str, message: &T, correlation_id: &str) {
        if let Err(e) = client.publish(exchange, routing_key, message, correlation_id).await {
            error!(exchange, routing_key, "failed to publish report: {e}");
        }
    }
}

/// What a verified job recorded about its copies.
///
/// # Errors
///
/// Returns a fatal error when the job lacks a field or holds an invalid one.
pub fn recorded(job: &Job) -> Result<Recorded, IngestError> {
    let invalid = |field: &str| IngestError::Fatal(format!("job {} has no valid {field}", job.id));
    let digest = |field: &str, value: Option<&str>| -> Result<[u8; 32], IngestError> {
        let bytes = hex::decode(value.ok_or_else(|| invalid(field))?).map_err(|_| invalid(field))?;
        bytes.try_into().map_err(|_| invalid(field))
    };

    Ok(Recorded {
        archive_path: job.archive_path.as_deref().map(PathBuf::from).ok_or_else(|| invalid("archive path"))?,
        backup_path: job.backup_path.as_deref().map(PathBuf::from).ok_or_else(|| invalid("backup path"))?,
        size: job.archive_size.ok_or_else(|| invalid("archive size"))?,
        archive_sha256: digest("archive checksum", job.archive_checksum.as_deref())?,
        decrypted_sha256: digest("decrypted checksum", job.decrypted_checksum.as_deref())?,
        header: hex::decode(job.header.as_deref().ok_or_else(|| invalid("header"))?).map_err(|_| invalid("header"))?,
    })
}
