//! Common type definitions for the ingestion pipeline.
//!
//! # Overview
//!
//! - [`JobStatus`]: Lifecycle states of a submitted file
//! - [`Stage`]: Pipeline stage names used in logs and error records
//! - [`ChecksumAlgorithm`] / [`Checksum`]: Checksums exchanged in messages and stored per job
//! - [`JobId`]: Database identifier of a job

use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString, IntoStaticStr};

/// Database identifier of a job.
pub type JobId = i64;

/// Lifecycle state of a job.
///
/// `COMPLETED`, `ERROR` and `CANCELED` are terminal: once a job is in one of
/// them no transition applies any more.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The upload notification was accepted and a row created.
    Received,

    /// A worker is decrypting and streaming the payload.
    InIngestion,

    /// Header and payload decrypted, checksums captured.
    Verified,

    /// Primary and backup copies re-checked against the captured checksums.
    Archived,

    /// An accession id was assigned.
    Completed,

    /// The job failed; see the errors table.
    Error,

    /// The submitter canceled the job.
    Canceled,
}

impl JobStatus {
    /// Array of the terminal states.
    pub const TERMINAL: &'static [Self] = &[Self::Completed, Self::Error, Self::Canceled];

    /// Array of the states a job can still leave.
    pub const ACTIVE: &'static [Self] = &[Self::Received, Self::InIngestion, Self::Verified, Self::Archived];

    /// Returns whether no transition leaves this state.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Returns the label stored in the database.
    #[inline]
    #[must_use]
    pub fn label(self) -> &'static str {
        self.into()
    }
}

impl Display for JobStatus {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.label())
    }
}

/// A pipeline stage, used to label logs and error records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Dispatch,
    Ingest,
    Verify,
    Accession,
    Mapping,
    Cancel,
    Dataset,
}

impl Stage {
    #[inline]
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Ingest => "ingest",
            Self::Verify => "verify",
            Self::Accession => "accession",
            Self::Mapping => "mapping",
            Self::Cancel => "cancel",
            Self::Dataset => "dataset",
        }
    }
}

impl Display for Stage {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.label())
    }
}

/// Digest algorithms used for file checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

/// A checksum as carried in messages: `{"type": "sha256", "value": "..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type")]
    pub algorithm: ChecksumAlgorithm,

    /// Lowercase hex digest.
    pub value: String,
}

impl Checksum {
    #[inline]
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self { algorithm, value: value.into() }
    }

    #[inline]
    pub fn sha256(value: impl Into<String>) -> Self {
        Self::new(ChecksumAlgorithm::Sha256, value)
    }

    #[inline]
    pub fn md5(value: impl Into<String>) -> Self {
        Self::new(ChecksumAlgorithm::Md5, value)
    }
}
