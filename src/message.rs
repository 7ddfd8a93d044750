//! JSON messages exchanged with the broker.
//!
//! Incoming messages are tagged by their `type` field; [`Message::parse`]
//! tells a body that is not JSON, lacks a `type` or names an unknown one apart
//! from a known message with missing fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Checksum;

/// Every `type` the dispatcher understands.
pub const MESSAGE_TYPES: &[&str] = &["ingest", "cancel", "accession", "mapping", "deprecate", "release", "permission", "permission.deleted", "heartbeat"];

/// Why a body could not be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message is not JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("message has no type")]
    MissingType,

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} message: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An incoming message.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Ingest(FileRequest),
    Cancel(FileRequest),
    Accession(AccessionRequest),
    Mapping(MappingRequest),
    Deprecate(DatasetRequest),
    Release(DatasetRequest),
    Permission(PermissionRequest),
    #[serde(rename = "permission.deleted")]
    PermissionDeleted(PermissionRequest),
    Heartbeat,
}

impl Message {
    /// Decodes a message body.
    ///
    /// # Errors
    ///
    /// See [`MessageError`].
    pub fn parse(body: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(body).map_err(MessageError::NotJson)?;
        let kind = value.get("type").and_then(Value::as_str).ok_or(MessageError::MissingType)?;
        if !MESSAGE_TYPES.contains(&kind) {
            return Err(MessageError::UnknownType(kind.to_owned()));
        }

        let kind = kind.to_owned();
        serde_json::from_value(value).map_err(|source| MessageError::Invalid { kind, source })
    }

    /// The `type` of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ingest(_) => "ingest",
            Self::Cancel(_) => "cancel",
            Self::Accession(_) => "accession",
            Self::Mapping(_) => "mapping",
            Self::Deprecate(_) => "deprecate",
            Self::Release(_) => "release",
            Self::Permission(_) => "permission",
            Self::PermissionDeleted(_) => "permission.deleted",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// The submitted file this message is about, if any.
    #[must_use]
    pub fn file(&self) -> Option<&FileRequest> {
        match self {
            Self::Ingest(file) | Self::Cancel(file) => Some(file),
            Self::Accession(accession) => Some(&accession.file),
            _ => None,
        }
    }
}

/// An uploaded file: `ingest` and `cancel`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileRequest {
    pub user: String,
    pub filepath: String,

    /// Checksums of the inbox file asserted by the submitter.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encrypted_checksums: Vec<Checksum>,
}

impl FileRequest {
    /// The asserted SHA-256 of the inbox file, if any, falling back to the first checksum.
    #[must_use]
    pub fn encrypted_checksum(&self) -> Option<&Checksum> {
        self.encrypted_checksums.iter().find(|c| c.algorithm == crate::types::ChecksumAlgorithm::Sha256).or_else(|| self.encrypted_checksums.first())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessionRequest {
    #[serde(flatten)]
    pub file: FileRequest,
    pub accession_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decrypted_checksums: Vec<Checksum>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MappingRequest {
    pub dataset_id: String,
    pub accession_ids: Vec<String>,
}

/// `release` and `deprecate`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatasetRequest {
    pub dataset_id: String,
}

/// `permission` and `permission.deleted`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PermissionRequest {
    pub dataset_id: String,
    pub user: String,
}

/// Reported to the submitter when their file was refused.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserErrorReport {
    pub user: String,
    pub filepath: String,
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_checksums: Option<Vec<Checksum>>,
}

/// Reported to the operators.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperatorReport {
    pub error: String,
    pub message: String,
}

/// Published once both archived copies were verified.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Verified {
    pub user: String,
    pub filepath: String,
    pub decrypted_checksums: Vec<Checksum>,
}
