//! Job lifecycle transitions.

use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, Transaction, params};
use tracing::{debug, info, warn};

use crate::store::{Store, StoreError, now, parse_status, status_list};
use crate::types::{Checksum, ChecksumAlgorithm, JobId, JobStatus};

/// A job row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub correlation_id: String,
    pub user: String,
    pub inbox_path: String,
    pub status: JobStatus,
    pub encrypted_checksum: Option<Checksum>,
    /// SHA-256 of the cleartext.
    pub decrypted_checksum: Option<String>,
    pub decrypted_md5: Option<String>,
    /// Rewrapped header, hex encoded.
    pub header: Option<String>,
    pub archive_path: Option<String>,
    pub backup_path: Option<String>,
    pub archive_size: Option<u64>,
    /// SHA-256 of the archived payload.
    pub archive_checksum: Option<String>,
    pub accession_id: Option<String>,
    pub dataset_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    const COLUMNS: &'static str = "id, correlation_id, user, inbox_path, status, encrypted_checksum, encrypted_checksum_type, decrypted_checksum, decrypted_md5, header, \
                                   archive_path, backup_path, archive_size, archive_checksum, accession_id, dataset_id, created_at, updated_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(Self, String)> {
        let checksum: Option<String> = row.get(5)?;
        let checksum_type: Option<String> = row.get(6)?;
        let encrypted_checksum = match (checksum, checksum_type) {
            (Some(value), Some(kind)) => ChecksumAlgorithm::from_str(&kind).ok().map(|algorithm| Checksum::new(algorithm, value)),
            _ => None,
        };
        let archive_size: Option<i64> = row.get(12)?;

        let job = Self {
            id: row.get(0)?,
            correlation_id: row.get(1)?,
            user: row.get(2)?,
            inbox_path: row.get(3)?,
            status: JobStatus::Received,
            encrypted_checksum,
            decrypted_checksum: row.get(7)?,
            decrypted_md5: row.get(8)?,
            header: row.get(9)?,
            archive_path: row.get(10)?,
            backup_path: row.get(11)?,
            archive_size: archive_size.and_then(|size| u64::try_from(size).ok()),
            archive_checksum: row.get(13)?,
            accession_id: row.get(14)?,
            dataset_id: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        };
        Ok((job, row.get(4)?))
    }
}

/// Outcome of [`Store::create`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Created {
    pub job_id: JobId,
    /// The submission was already in progress under this id.
    pub existing: bool,
}

/// What a successful ingestion records.
#[derive(Clone, Debug, Default)]
pub struct Verification {
    pub session_key_fingerprints: Vec<String>,
    pub header: String,
    pub archive_path: String,
    pub backup_path: String,
    pub archive_size: u64,
    pub archive_checksum: String,
    pub decrypted_checksum: String,
    pub decrypted_md5: String,
}

/// A row of the errors table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    pub job_id: JobId,
    pub hostname: String,
    pub kind: String,
    pub message: String,
    pub from_user: bool,
    pub occurred_at: String,
}

impl Store {
    /// Creates a job for a submission, or returns the unfinished job that
    /// already covers the same checksum, user and inbox path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn create(&self, correlation_id: &str, user: &str, inbox_path: &str, encrypted_checksum: Option<&Checksum>) -> Result<Created, StoreError> {
        let value = encrypted_checksum.map(|checksum| checksum.value.to_ascii_lowercase());
        let kind = encrypted_checksum.map(|checksum| checksum.algorithm.as_ref().to_owned());

        self.transaction(|tx| {
            let query = format!(
                "SELECT id FROM jobs WHERE user = ?1 AND inbox_path = ?2 AND encrypted_checksum IS ?3 AND status NOT IN ({}) ORDER BY id LIMIT 1",
                status_list(JobStatus::TERMINAL)
            );
            if let Some(job_id) = tx.query_row(&query, params![user, inbox_path, value], |row| row.get(0)).optional()? {
                info!(job_id, user, inbox_path, "submission already in progress");
                return Ok(Created { job_id, existing: true });
            }

            let at = now();
            tx.execute(
                "INSERT INTO jobs (correlation_id, user, inbox_path, status, encrypted_checksum, encrypted_checksum_type, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![correlation_id, user, inbox_path, JobStatus::Received.label(), value, kind, at],
            )?;
            let job_id = tx.last_insert_rowid();
            record_history(tx, job_id, JobStatus::Received)?;

            info!(job_id, user, inbox_path, "job created");
            Ok(Created { job_id, existing: false })
        })
    }

    /// Loads a job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] when there is no such job.
    pub fn get(&self, job_id: JobId) -> Result<Job, StoreError> {
        self.read(|conn| {
            let query = format!("SELECT {} FROM jobs WHERE id = ?1", Job::COLUMNS);
            let (mut job, status) = conn.query_row(&query, params![job_id], Job::from_row).optional()?.ok_or(StoreError::JobNotFound(job_id))?;
            job.status = parse_status(&status)?;
            Ok(job)
        })
    }

    /// Current status of a job.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobNotFound`] when there is no such job.
    pub fn status(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        self.read(|conn| current_status(conn, job_id))
    }

    /// The most recent job for a user's inbox file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn find(&self, user: &str, inbox_path: &str) -> Result<Option<JobId>, StoreError> {
        self.read(|conn| Ok(conn.query_row("SELECT id FROM jobs WHERE user = ?1 AND inbox_path = ?2 ORDER BY id DESC LIMIT 1", params![user, inbox_path], |row| row.get(0)).optional()?))
    }

    /// Job owning an accession id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn find_accession(&self, accession_id: &str) -> Result<Option<JobId>, StoreError> {
        self.read(|conn| Ok(conn.query_row("SELECT id FROM jobs WHERE accession_id = ?1", params![accession_id], |row| row.get(0)).optional()?))
    }

    /// Jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn list(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.read(|conn| {
            let query = format!("SELECT {} FROM jobs ORDER BY id DESC LIMIT ?1", Job::COLUMNS);
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], Job::from_row)?;

            rows.map(|row| -> Result<Job, StoreError> {
                let (mut job, status) = row?;
                job.status = parse_status(&status)?;
                Ok(job)
            })
            .collect()
        })
    }

    /// `RECEIVED -> IN_INGESTION`. Returns whether the job moved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn mark_in_ingestion(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.transaction(|tx| transition(tx, job_id, &[JobStatus::Received], JobStatus::InIngestion))
    }

    /// Records the session keys of a verified ingestion and moves the job
    /// `IN_INGESTION -> VERIFIED`, in one transaction.
    ///
    /// # Errors
    ///
    /// - [`StoreError::SessionKeyAlreadyUsed`] when any fingerprint is
    ///   already known; nothing is written
    /// - [`StoreError::InvalidTransition`] when the job is not in ingestion
    pub fn record_session_key_use(&self, job_id: JobId, verification: &Verification) -> Result<(), StoreError> {
        self.transaction(|tx| {
            for fingerprint in &verification.session_key_fingerprints {
                let owner: Option<JobId> = tx.query_row("SELECT job_id FROM session_key_checksums WHERE fingerprint = ?1", params![fingerprint], |row| row.get(0)).optional()?;
                if let Some(owner) = owner {
                    warn!(job_id, owner, "session key replayed");
                    return Err(StoreError::SessionKeyAlreadyUsed { fingerprint: fingerprint.clone(), job_id: owner });
                }
            }

            let at = now();
            for fingerprint in &verification.session_key_fingerprints {
                tx.execute("INSERT INTO session_key_checksums (fingerprint, job_id, created_at) VALUES (?1, ?2, ?3)", params![fingerprint, job_id, at])?;
            }

            let changed = tx.execute(
                "UPDATE jobs SET status = ?1, header = ?2, archive_path = ?3, backup_path = ?4, archive_size = ?5, archive_checksum = ?6, \
                 decrypted_checksum = ?7, decrypted_md5 = ?8, updated_at = ?9 WHERE id = ?10 AND status = ?11",
                params![
                    JobStatus::Verified.label(),
                    verification.header,
                    verification.archive_path,
                    verification.backup_path,
                    i64::try_from(verification.archive_size).unwrap_or(i64::MAX),
                    verification.archive_checksum,
                    verification.decrypted_checksum,
                    verification.decrypted_md5,
                    at,
                    job_id,
                    JobStatus::InIngestion.label(),
                ],
            )?;
            if changed == 0 {
                let from = current_status(tx, job_id)?;
                return Err(StoreError::InvalidTransition { job_id, from, to: JobStatus::Verified });
            }

            record_history(tx, job_id, JobStatus::Verified)?;
            debug!(job_id, keys = verification.session_key_fingerprints.len(), "session keys recorded");
            Ok(())
        })
    }

    /// `VERIFIED -> ARCHIVED`. Returns whether the job moved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn mark_archived(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.transaction(|tx| transition(tx, job_id, &[JobStatus::Verified], JobStatus::Archived))
    }

    /// Assigns the accession id, `ARCHIVED -> COMPLETED`.
    ///
    /// Re-applying the same accession id succeeds without a change.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] for a different accession id, or one taken by another job
    /// - [`StoreError::InvalidTransition`] when the job is neither archived nor completed
    pub fn finalize(&self, job_id: JobId, accession_id: &str) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let (status, current): (String, Option<String>) =
                tx.query_row("SELECT status, accession_id FROM jobs WHERE id = ?1", params![job_id], |row| Ok((row.get(0)?, row.get(1)?))).optional()?.ok_or(StoreError::JobNotFound(job_id))?;

            match (parse_status(&status)?, current) {
                (JobStatus::Completed, Some(current)) if current == accession_id => {
                    debug!(job_id, accession_id, "accession already assigned");
                    Ok(())
                }
                (JobStatus::Completed, Some(current)) => Err(StoreError::Conflict(format!("job {job_id} already has accession {current}, not {accession_id}"))),
                (JobStatus::Archived, _) => {
                    let owner: Option<JobId> = tx.query_row("SELECT id FROM jobs WHERE accession_id = ?1", params![accession_id], |row| row.get(0)).optional()?;
                    if let Some(owner) = owner {
                        return Err(StoreError::Conflict(format!("accession {accession_id} already belongs to job {owner}")));
                    }

                    tx.execute(
                        "UPDATE jobs SET status = ?1, accession_id = ?2, updated_at = ?3 WHERE id = ?4",
                        params![JobStatus::Completed.label(), accession_id, now(), job_id],
                    )?;
                    record_history(tx, job_id, JobStatus::Completed)?;
                    info!(job_id, accession_id, "job completed");
                    Ok(())
                }
                (from, _) => Err(StoreError::InvalidTransition { job_id, from, to: JobStatus::Completed }),
            }
        })
    }

    /// Cancels a job that has not finished. Returns whether it moved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn cancel(&self, job_id: JobId) -> Result<bool, StoreError> {
        let moved = self.transaction(|tx| transition(tx, job_id, JobStatus::ACTIVE, JobStatus::Canceled))?;
        if moved {
            info!(job_id, "job canceled");
        } else {
            debug!(job_id, "cancel ignored, job already finished");
        }
        Ok(moved)
    }

    /// Records an error and moves an unfinished job to `ERROR`.
    ///
    /// The error row is written even when the job already finished; the
    /// return value tells whether the status changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn set_error(&self, job_id: JobId, kind: &str, message: &str, from_user: bool) -> Result<bool, StoreError> {
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO errors (job_id, hostname, kind, message, from_user, occurred_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![job_id, self.hostname(), kind, message, from_user, now()],
            )?;
            transition(tx, job_id, JobStatus::ACTIVE, JobStatus::Error)
        })
    }

    /// Errors recorded for a job, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn errors(&self, job_id: JobId) -> Result<Vec<ErrorRecord>, StoreError> {
        self.read(|conn| {
            let mut statement = conn.prepare("SELECT job_id, hostname, kind, message, from_user, occurred_at FROM errors WHERE job_id = ?1 ORDER BY id")?;
            let rows = statement.query_map(params![job_id], |row| {
                Ok(ErrorRecord { job_id: row.get(0)?, hostname: row.get(1)?, kind: row.get(2)?, message: row.get(3)?, from_user: row.get(4)?, occurred_at: row.get(5)? })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Every status a job went through, in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on database failures.
    pub fn history(&self, job_id: JobId) -> Result<Vec<JobStatus>, StoreError> {
        self.read(|conn| {
            let mut statement = conn.prepare("SELECT status FROM status_history WHERE job_id = ?1 ORDER BY id")?;
            let labels = statement.query_map(params![job_id], |row| row.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?;
            labels.iter().map(|label| parse_status(label)).collect()
        })
    }
}

fn current_status(conn: &rusqlite::Connection, job_id: JobId) -> Result<JobStatus, StoreError> {
    let label: String = conn.query_row("SELECT status FROM jobs WHERE id = ?1", params![job_id], |row| row.get(0)).optional()?.ok_or(StoreError::JobNotFound(job_id))?;
    parse_status(&label)
}

/// Moves a job to `to` when its status is one of `from`. Returns whether it moved.
fn transition(tx: &Transaction<'_>, job_id: JobId, from: &[JobStatus], to: JobStatus) -> Result<bool, StoreError> {
    let query = format!("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})", status_list(from));
    let changed = tx.execute(&query, params![to.label(), now(), job_id])?;
    if changed == 0 {
        // Distinguish a missing job from a job in another state.
        current_status(tx, job_id)?;
        return Ok(false);
    }

    record_history(tx, job_id, to)?;
    debug!(job_id, status = %to, "status changed");
    Ok(true)
}

fn record_history(tx: &Transaction<'_>, job_id: JobId, status: JobStatus) -> rusqlite::Result<()> {
    tx.execute("INSERT INTO status_history (job_id, status, changed_at) VALUES (?1, ?2, ?3)", params![job_id, status.label(), now()])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::in_memory("test-host").unwrap()
    }

    fn verification(fingerprint: &str) -> Verification {
        Verification {
            session_key_fingerprints: vec![fingerprint.to_owned()],
            header: "c1".into(),
            archive_path: "/archive/000/000/000/000/000/000/01".into(),
            backup_path: "/backup/000/000/000/000/000/000/01".into(),
            archive_size: 82,
            archive_checksum: "aa".into(),
            decrypted_checksum: "bb".into(),
            decrypted_md5: "cc".into(),
        }
    }

    fn verified(store: &Store, path: &str, fingerprint: &str) -> JobId {
        let job_id = store.create("corr", "john", path, None).unwrap().job_id;
        assert!(store.mark_in_ingestion(job_id).unwrap());
        store.record_session_key_use(job_id, &verification(fingerprint)).unwrap();
        job_id
    }

    #[test]
    fn test_create_returns_existing_unfinished_job() {
        let store = store();
        let checksum = Checksum::sha256("ABCD");

        let first = store.create("c1", "john", "/a.c4gh", Some(&checksum)).unwrap();
        let second = store.create("c2", "john", "/a.c4gh", Some(&Checksum::sha256("abcd"))).unwrap();
        assert!(!first.existing);
        assert_eq!(second, Created { job_id: first.job_id, existing: true });

        let other_user = store.create("c3", "jane", "/a.c4gh", Some(&checksum)).unwrap();
        assert_ne!(other_user.job_id, first.job_id);

        let other_checksum = store.create("c4", "john", "/a.c4gh", Some(&Checksum::sha256("ef"))).unwrap();
        assert_ne!(other_checksum.job_id, first.job_id);
    }

    #[test]
    fn test_create_after_terminal_job_makes_a_new_one() {
        let store = store();
        let first = store.create("c1", "john", "/a.c4gh", None).unwrap();
        store.set_error(first.job_id, "HeaderDecryption", "bad header", true).unwrap();

        let second = store.create("c2", "john", "/a.c4gh", None).unwrap();
        assert!(!second.existing);
        assert_ne!(second.job_id, first.job_id);
    }

    #[test]
    fn test_full_lifecycle() {
        let store = store();
        let job_id = verified(&store, "/a.c4gh", "fp1");
        assert!(store.mark_archived(job_id).unwrap());
        store.finalize(job_id, "EGAF00000000001").unwrap();

        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.accession_id.as_deref(), Some("EGAF00000000001"));
        assert_eq!(job.archive_size, Some(82));
        assert_eq!(
            store.history(job_id).unwrap(),
            [JobStatus::Received, JobStatus::InIngestion, JobStatus::Verified, JobStatus::Archived, JobStatus::Completed]
        );
    }

    #[test]
    fn test_replayed_session_key_is_rejected() {
        let store = store();
        let first = verified(&store, "/a.c4gh", "fp1");

        let second = store.create("corr", "john", "/copy.c4gh", None).unwrap().job_id;
        store.mark_in_ingestion(second).unwrap();
        let result = store.record_session_key_use(second, &verification("fp1"));
        assert!(matches!(result, Err(StoreError::SessionKeyAlreadyUsed { job_id, .. }) if job_id == first));

        // Nothing from the failed transaction is kept.
        assert_eq!(store.status(second).unwrap(), JobStatus::InIngestion);
        assert!(store.get(second).unwrap().header.is_none());
    }

    #[test]
    fn test_fingerprints_of_failed_transition_are_rolled_back() {
        let store = store();
        let job_id = store.create("corr", "john", "/a.c4gh", None).unwrap().job_id;

        // Still RECEIVED, so the update does not apply.
        let result = store.record_session_key_use(job_id, &verification("fp9"));
        assert!(matches!(result, Err(StoreError::InvalidTransition { from: JobStatus::Received, .. })));

        let other = verified(&store, "/b.c4gh", "fp9");
        assert_eq!(store.status(other).unwrap(), JobStatus::Verified);
    }

    #[test]
    fn test_cancel_completed_job_is_a_no_op() {
        let store = store();
        let job_id = verified(&store, "/a.c4gh", "fp1");
        store.mark_archived(job_id).unwrap();
        store.finalize(job_id, "EGAF1").unwrap();

        assert!(!store.cancel(job_id).unwrap());
        assert_eq!(store.status(job_id).unwrap(), JobStatus::Completed);
    }

    #[test]
    fn test_cancel_running_job() {
        let store = store();
        let job_id = store.create("corr", "john", "/a.c4gh", None).unwrap().job_id;
        store.mark_in_ingestion(job_id).unwrap();

        assert!(store.cancel(job_id).unwrap());
        assert_eq!(store.status(job_id).unwrap(), JobStatus::Canceled);
        assert!(!store.mark_archived(job_id).unwrap());
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let store = store();
        let job_id = verified(&store, "/a.c4gh", "fp1");
        store.mark_archived(job_id).unwrap();

        store.finalize(job_id, "EGAF1").unwrap();
        store.finalize(job_id, "EGAF1").unwrap();
        assert!(matches!(store.finalize(job_id, "EGAF2"), Err(StoreError::Conflict(_))));
        assert_eq!(store.history(job_id).unwrap().iter().filter(|status| **status == JobStatus::Completed).count(), 1);
    }

    #[test]
    fn test_finalize_refuses_taken_accession() {
        let store = store();
        let first = verified(&store, "/a.c4gh", "fp1");
        let second = verified(&store, "/b.c4gh", "fp2");
        store.mark_archived(first).unwrap();
        store.mark_archived(second).unwrap();

        store.finalize(first, "EGAF1").unwrap();
        assert!(matches!(store.finalize(second, "EGAF1"), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_finalize_before_archive() {
        let store = store();
        let job_id = verified(&store, "/a.c4gh", "fp1");
        assert!(matches!(store.finalize(job_id, "EGAF1"), Err(StoreError::InvalidTransition { from: JobStatus::Verified, .. })));
    }

    #[test]
    fn test_error_on_finished_job_is_recorded_only() {
        let store = store();
        let job_id = store.create("corr", "john", "/a.c4gh", None).unwrap().job_id;
        store.cancel(job_id).unwrap();

        assert!(!store.set_error(job_id, "Storage", "late failure", false).unwrap());
        assert_eq!(store.status(job_id).unwrap(), JobStatus::Canceled);

        let errors = store.errors(job_id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].hostname, "test-host");
        assert!(!errors[0].from_user);
    }

    #[test]
    fn test_set_error_moves_running_job() {
        let store = store();
        let job_id = store.create("corr", "john", "/a.c4gh", None).unwrap().job_id;
        assert!(store.set_error(job_id, "ChecksumMismatch", "bad checksum", true).unwrap());
        assert_eq!(store.status(job_id).unwrap(), JobStatus::Error);
        assert!(store.errors(job_id).unwrap()[0].from_user);
    }

    #[test]
    fn test_missing_job() {
        let store = store();
        assert!(matches!(store.get(404), Err(StoreError::JobNotFound(404))));
        assert!(matches!(store.cancel(404), Err(StoreError::JobNotFound(404))));
    }

    #[test]
    fn test_find_and_list() {
        let store = store();
        let first = store.create("c1", "john", "/a.c4gh", None).unwrap().job_id;
        let second = store.create("c2", "jane", "/b.c4gh", None).unwrap().job_id;

        assert_eq!(store.find("john", "/a.c4gh").unwrap(), Some(first));
        assert_eq!(store.find("john", "/b.c4gh").unwrap(), None);

        let jobs = store.list(10).unwrap();
        assert_eq!(jobs.iter().map(|job| job.id).collect::<Vec<_>>(), [second, first]);
    }
}
