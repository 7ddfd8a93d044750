//! Datasets: accession mapping, release state and access permissions.

use rusqlite::{OptionalExtension, params};
use strum::{AsRefStr, EnumString};
use tracing::{debug, info};

use crate::store::{Store, StoreError, now};
use crate::types::{JobId, JobStatus};

/// Publication state of a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetState {
    Registered,
    Released,
    Deprecated,
}

/// A dataset row with its members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    pub state: DatasetState,
    pub accession_ids: Vec<String>,
    pub users: Vec<String>,
}

impl Store {
    /// Maps accessions to a dataset, creating the dataset if needed.
    ///
    /// Mapping an accession to the dataset it already belongs to changes
    /// nothing. Returns the number of newly mapped accessions.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnknownAccession`] when an accession has no completed job
    /// - [`StoreError::Conflict`] when an accession belongs to another dataset
    /// - [`StoreError::Conflict`] when `accession_ids` is empty
    pub fn map(&self, dataset_id: &str, accession_ids: &[String]) -> Result<usize, StoreError> {
        if accession_ids.is_empty() {
            return Err(StoreError::Conflict(format!("mapping for dataset {dataset_id} lists no accession")));
        }

        self.transaction(|tx| {
            let at = now();
            tx.execute(
                "INSERT INTO datasets (id, state, created_at, updated_at) VALUES (?1, ?2, ?3, ?3) ON CONFLICT (id) DO NOTHING",
                params![dataset_id, DatasetState::Registered.as_ref(), at],
            )?;

            let mut mapped = 0;
            for accession_id in accession_ids {
                let row: Option<(JobId, String, Option<String>)> = tx
                    .query_row("SELECT id, status, dataset_id FROM jobs WHERE accession_id = ?1", params![accession_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .optional()?;

                match row {
                    Some((_, status, _)) if status != JobStatus::Completed.label() => return Err(StoreError::UnknownAccession(accession_id.clone())),
                    None => return Err(StoreError::UnknownAccession(accession_id.clone())),
                    Some((_, _, Some(current))) if current == dataset_id => debug!(accession_id, dataset_id, "accession already mapped"),
                    Some((_, _, Some(current))) => return Err(StoreError::Conflict(format!("accession {accession_id} belongs to dataset {current}, not {dataset_id}"))),
                    Some((job_id, _, None)) => {
                        tx.execute("UPDATE jobs SET dataset_id = ?1, updated_at = ?2 WHERE id = ?3", params![dataset_id, at, job_id])?;
                        mapped += 1;
                    }
                }
            }

            info!(dataset_id, mapped, "accessions mapped");
            Ok(mapped)
        })
    }

    /// Moves a dataset to `state`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] when the dataset does not exist.
    pub fn set_dataset_state(&self, dataset_id: &str, state: DatasetState) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let changed = tx.execute("UPDATE datasets SET state = ?1, updated_at = ?2 WHERE id = ?3", params![state.as_ref(), now(), dataset_id])?;
            if changed == 0 {
                return Err(StoreError::DatasetNotFound(dataset_id.to_owned()));
            }
            info!(dataset_id, state = state.as_ref(), "dataset state changed");
            Ok(())
        })
    }

    /// Grants `user` access to a dataset. Granting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] when the dataset does not exist.
    pub fn grant(&self, dataset_id: &str, user: &str) -> Result<(), StoreError> {
        self.transaction(|tx| {
            ensure_dataset(tx, dataset_id)?;
            tx.execute(
                "INSERT INTO dataset_permissions (dataset_id, user, granted_at) VALUES (?1, ?2, ?3) ON CONFLICT (dataset_id, user) DO NOTHING",
                params![dataset_id, user, now()],
            )?;
            info!(dataset_id, user, "permission granted");
            Ok(())
        })
    }

    /// Revokes `user`'s access to a dataset. Returns whether a permission existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] when the dataset does not exist.
    pub fn revoke(&self, dataset_id: &str, user: &str) -> Result<bool, StoreError> {
        self.transaction(|tx| {
            ensure_dataset(tx, dataset_id)?;
            let removed = tx.execute("DELETE FROM dataset_permissions WHERE dataset_id = ?1 AND user = ?2", params![dataset_id, user])?;
            info!(dataset_id, user, "permission revoked");
            Ok(removed > 0)
        })
    }

    /// Loads a dataset with its accessions and permitted users.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatasetNotFound`] when the dataset does not exist.
    pub fn dataset(&self, dataset_id: &str) -> Result<Dataset, StoreError> {
        self.read(|conn| {
            let state: String =
                conn.query_row("SELECT state FROM datasets WHERE id = ?1", params![dataset_id], |row| row.get(0)).optional()?.ok_or_else(|| StoreError::DatasetNotFound(dataset_id.to_owned()))?;
            let state = state.parse().map_err(|_| StoreError::UnknownStatus(state.clone()))?;

            let mut statement = conn.prepare("SELECT accession_id FROM jobs WHERE dataset_id = ?1 ORDER BY accession_id")?;
            let accession_ids = statement.query_map(params![dataset_id], |row| row.get(0))?.collect::<rusqlite::Result<Vec<String>>>()?;

            let mut statement = conn.prepare("SELECT user FROM dataset_permissions WHERE dataset_id = ?1 ORDER BY user")?;
            let users = statement.query_map(params![dataset_id], |row| row.get(0))?.collect::<rusqlite::Result<Vec<String>>>()?;

            Ok(Dataset { id: dataset_id.to_owned(), state, accession_ids, users })
        })
    }
}

fn ensure_dataset(conn: &rusqlite::Connection, dataset_id: &str) -> Result<(), StoreError> {
    let exists = conn.query_row("SELECT 1 FROM datasets WHERE id = ?1", params![dataset_id], |_| Ok(())).optional()?.is_some();
    if exists { Ok(()) } else { Err(StoreError::DatasetNotFound(dataset_id.to_owned())) }
}
