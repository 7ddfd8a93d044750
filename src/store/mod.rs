//! # Job Store
//!
//! The durable state of the pipeline: one row per submitted file, the
//! session key fingerprints seen so far, error records, the status history
//! and the dataset tables.
//!
//! Every transition is a single conditional statement run inside its own
//! transaction together with its history row. The only read-then-write is
//! the session key replay check, which runs in the same transaction as the
//! insert it guards ([`Store::record_session_key_use`]).
//!
//! The store wraps one SQLite connection behind an `Arc<Mutex<_>>`; clones
//! share the connection.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::debug;

use crate::config::DEFAULT_BUSY_TIMEOUT_MS;
use crate::types::{JobId, JobStatus};

mod dataset;
mod jobs;
mod schema;

pub use dataset::{Dataset, DatasetState};
pub use jobs::{Created, ErrorRecord, Job, Verification};

/// Failures of the job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// A session key of this file was already used by another submission.
    #[error("session key {fingerprint} already used by job {job_id}")]
    SessionKeyAlreadyUsed { fingerprint: String, job_id: JobId },

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition { job_id: JobId, from: JobStatus, to: JobStatus },

    /// An idempotent update was re-applied with a different value.
    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("dataset {0} not found")]
    DatasetNotFound(String),

    #[error("accession {0} does not belong to a completed job")]
    UnknownAccession(String),

    #[error("unknown status label {0:?} in the database")]
    UnknownStatus(String),
}

impl StoreError {
    /// Returns whether retrying the operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen),
            _ => false,
        }
    }
}

/// Handle on the job database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    hostname: String,
}

impl Store {
    /// Opens (and if needed creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the file cannot be opened or the schema cannot be created.
    pub fn open(path: &Path, hostname: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        Self::with_connection(conn, hostname)
    }

    /// A private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the schema cannot be created.
    pub fn in_memory(hostname: impl Into<String>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, hostname)
    }

    fn with_connection(conn: Connection, hostname: impl Into<String>) -> Result<Self, StoreError> {
        schema::init(&conn)?;
        debug!(version = schema::VERSION, "job store ready");
        Ok(Self { conn: Arc::new(Mutex::new(conn)), hostname: hostname.into() })
    }

    /// How long a statement waits for another connection's lock before
    /// failing with a busy error. Zero fails at once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when SQLite refuses the setting.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        self.lock()?.busy_timeout(timeout)?;
        Ok(())
    }

    /// Name recorded with every error row.
    #[inline]
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` in an immediate transaction, committing when it returns `Ok`.
    // IMMEDIATE takes the write lock up front, so a check-then-insert inside
    // `f` cannot be interleaved with another worker's write.
    fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.lock()?;
        f(&conn)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_status(label: &str) -> Result<JobStatus, StoreError> {
    label.parse().map_err(|_| StoreError::UnknownStatus(label.to_owned()))
}

/// SQL list of status labels, for `status IN (...)` clauses.
fn status_list(statuses: &[JobStatus]) -> String {
    statuses.iter().map(|status| format!("'{}'", status.label())).collect::<Vec<_>>().join(", ")
}
