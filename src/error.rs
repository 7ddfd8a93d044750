//! Error taxonomy of the pipeline.
//!
//! Every failure that reaches the dispatcher is an [`IngestError`] of one of
//! three kinds, and the kind alone decides what happens to the message:
//!
//! | Kind                  | Message        | Reported to       |
//! |-----------------------|----------------|-------------------|
//! | [`ErrorKind::FromUser`]  | acknowledged   | submitter         |
//! | [`ErrorKind::Transient`] | requeued       | logs only         |
//! | [`ErrorKind::Fatal`]     | dead-lettered  | operators         |

use std::fmt::{self, Display, Formatter};

use crate::broker::BrokerError;
use crate::engine::EngineError;
use crate::store::StoreError;
use crate::types::{JobId, Stage};

/// How a failure is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    FromUser,
    Transient,
    Fatal,
}

/// A problem with what the submitter sent.
///
/// `Display` is the informal reason; [`UserError::technical`] is the precise one.
#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("File not found in inbox")]
    InboxMissing(String),

    #[error("Error decrypting the header of this file")]
    HeaderDecryption(String),

    #[error("Error decrypting the content of this file")]
    PayloadDecryption(String),

    #[error("Invalid checksum")]
    ChecksumMismatch(String),

    #[error("Session key (likely) already used")]
    SessionKeyAlreadyUsed(String),

    #[error("Unsupported file format")]
    UnsupportedFeature(String),

    #[error("Malformed encrypted file")]
    MalformedContainer(String),
}

impl UserError {
    /// The precise reason.
    #[must_use]
    pub fn technical(&self) -> &str {
        match self {
            Self::InboxMissing(s)
            | Self::HeaderDecryption(s)
            | Self::PayloadDecryption(s)
            | Self::ChecksumMismatch(s)
            | Self::SessionKeyAlreadyUsed(s)
            | Self::UnsupportedFeature(s)
            | Self::MalformedContainer(s) => s,
        }
    }

    /// Name recorded in the errors table.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InboxMissing(_) => "InboxMissing",
            Self::HeaderDecryption(_) => "HeaderDecryption",
            Self::PayloadDecryption(_) => "PayloadDecryption",
            Self::ChecksumMismatch(_) => "ChecksumMismatch",
            Self::SessionKeyAlreadyUsed(_) => "SessionKeyAlreadyUsed",
            Self::UnsupportedFeature(_) => "UnsupportedFeature",
            Self::MalformedContainer(_) => "MalformedContainer",
        }
    }
}

/// A classified pipeline failure.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    FromUser(#[from] UserError),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl IngestError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FromUser(_) => ErrorKind::FromUser,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Name recorded in the errors table.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::FromUser(e) => e.name(),
            Self::Transient(_) => "Transient",
            Self::Fatal(_) => "Fatal",
        }
    }

    /// The precise reason, for logs, the errors table and operators.
    #[must_use]
    pub fn technical(&self) -> String {
        match self {
            Self::FromUser(e) => format!("{e}: {}", e.technical()),
            Self::Transient(s) | Self::Fatal(s) => s.clone(),
        }
    }
}

impl From<EngineError> for IngestError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::HeaderDecryption(s) => UserError::HeaderDecryption(s).into(),
            EngineError::PayloadDecryption(s) => UserError::PayloadDecryption(s).into(),
            EngineError::ChecksumMismatch(s) => UserError::ChecksumMismatch(s).into(),
            EngineError::UnsupportedFeature(s) => UserError::UnsupportedFeature(s).into(),
            EngineError::InboxMissing(path) => UserError::InboxMissing(path.display().to_string()).into(),
            EngineError::Container(e) => UserError::MalformedContainer(e.to_string()).into(),
            other @ (EngineError::Storage(_) | EngineError::Corrupted(_) | EngineError::Crypto(_) | EngineError::Io(_)) => Self::Fatal(other.to_string()),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::SessionKeyAlreadyUsed { .. } => UserError::SessionKeyAlreadyUsed(error.to_string()).into(),
            e if e.is_transient() => Self::Transient(e.to_string()),
            e => Self::Fatal(e.to_string()),
        }
    }
}

impl From<BrokerError> for IngestError {
    fn from(error: BrokerError) -> Self {
        if error.is_transient() { Self::Transient(error.to_string()) } else { Self::Fatal(error.to_string()) }
    }
}

/// An [`IngestError`] with the stage and job it happened in.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub job_id: Option<JobId>,
    pub error: IngestError,
}

impl Display for StageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.job_id {
            Some(job_id) => write!(f, "[{}] job {job_id}: {}", self.stage, self.error.technical()),
            None => write!(f, "[{}] {}", self.stage, self.error.technical()),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Attaches stage context to a result, like `anyhow::Context`.
pub trait StageContext<T> {
    /// # Errors
    ///
    /// Returns the error converted into a [`StageError`].
    fn stage(self, stage: Stage, job_id: Option<JobId>) -> Result<T, StageError>;
}

impl<T, E: Into<IngestError>> StageContext<T> for Result<T, E> {
    fn stage(self, stage: Stage, job_id: Option<JobId>) -> Result<T, StageError> {
        self.map_err(|e| StageError { stage, job_id, error: e.into() })
    }
}
