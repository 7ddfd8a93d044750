//! # Streaming Crypt Engine
//!
//! Turns an inbox container into an archived file in one pass:
//!
//! 1. Header packets are read until the encrypted payload packet starts.
//!    Every session key packet is tried against the service keys; at least
//!    one must yield a session key.
//! 2. For every recovered session key, a new session key packet is produced
//!    for the archive master key. Their concatenation is the job's header.
//! 3. The payload packet is copied byte for byte (framing included) to the
//!    primary and backup targets while the same bytes are decrypted
//!    segment by segment and the literal data is hashed.
//! 4. The integrity trailer is checked, the container must end after the
//!    payload, and asserted checksums of the inbox file are compared.
//!
//! Any failure removes both targets ([`CryptEngine::ingest`]).
//!
//! The archived copy holds the payload still encrypted under the original
//! session key. Together with the rewrapped header it can only be read
//! with the archive master key; [`verify`] does exactly that.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cipher::{Checksums, CryptoError, EncryptedSessionKey, SessionKey, SymmetricAlgorithm, UnlockedKey, resolve};
use crate::config::SEIPD_VERSION;
use crate::packet::{PacketError, PacketReader, Tag, read_u8};
use crate::storage::Storage;
use crate::types::{Checksum, JobId};

mod literal;
mod segment;
mod stream;
pub mod verify;

pub use literal::LiteralInfo;
pub use segment::SegmentDecryptor;
pub use stream::{DecryptingReader, HashingReader, TeeReader};

/// Failures of the streaming engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Container(PacketError),

    /// None of the session key packets could be decrypted.
    #[error("header decryption failed: {0}")]
    HeaderDecryption(String),

    #[error("payload decryption failed: {0}")]
    PayloadDecryption(String),

    #[error("unsupported container feature: {0}")]
    UnsupportedFeature(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("file not found in inbox: {0}")]
    InboxMissing(PathBuf),

    /// Writing or reading an archive copy failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// An archived copy no longer matches what was recorded at ingestion.
    #[error("archive copy corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl EngineError {
    /// Wraps the error so it can cross a [`Read`] boundary; [`EngineError::from`] recovers it.
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

/// Recovers an [`EngineError`] that crossed a [`Read`] boundary.
fn unwrap_io(error: io::Error) -> Result<EngineError, io::Error> {
    if !error.get_ref().is_some_and(|inner| inner.is::<EngineError>()) {
        return Err(error);
    }
    match error.into_inner().map(|inner| inner.downcast::<EngineError>()) {
        Some(Ok(inner)) => Ok(*inner),
        _ => Ok(EngineError::Storage("unreadable engine error".into())),
    }
}

impl From<PacketError> for EngineError {
    fn from(error: PacketError) -> Self {
        match error {
            PacketError::Unsupported(reason) => Self::UnsupportedFeature(reason),
            PacketError::Io(e) => match unwrap_io(e) {
                Ok(inner) => inner,
                // Decompressors report corrupt streams as invalid data or input.
                Err(e) if matches!(e.kind(), io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput) => Self::Container(PacketError::malformed(e.to_string())),
                Err(e) => Self::Io(e),
            },
            other => Self::Container(other),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(error: io::Error) -> Self {
        match unwrap_io(error) {
            Ok(inner) => inner,
            Err(e) => PacketError::from(e).into(),
        }
    }
}

/// The keys the engine works with.
#[derive(Debug)]
pub struct Keyring {
    service: Vec<UnlockedKey>,
    archive: UnlockedKey,
    any_key_id: bool,
}

impl Keyring {
    pub fn new(service: Vec<UnlockedKey>, archive: UnlockedKey, any_key_id: bool) -> Self {
        Self { service, archive, any_key_id }
    }

    #[inline]
    #[must_use]
    pub fn service(&self) -> &[UnlockedKey] {
        &self.service
    }

    #[inline]
    #[must_use]
    pub fn archive(&self) -> &UnlockedKey {
        &self.archive
    }
}

/// Everything one pass over a container learned.
#[derive(Debug)]
pub struct Pass {
    pub session_keys: Vec<SessionKey>,
    pub cipher: SymmetricAlgorithm,
    pub literal: LiteralInfo,
    /// Checksums of the literal data.
    pub decrypted: Checksums,
    /// Checksums of the whole container.
    pub encrypted: Checksums,
    /// Checksums of the payload packet as copied to the targets.
    pub archived: Checksums,
}

/// The result of ingesting one file.
#[derive(Debug)]
pub struct Ingested {
    /// Session key packets for the archive key, concatenated.
    pub header: Vec<u8>,
    pub session_key_fingerprints: Vec<String>,
    pub archive_path: PathBuf,
    pub backup_path: PathBuf,
    pub pass: Pass,
}

impl Ingested {
    #[must_use]
    pub fn header_hex(&self) -> String {
        hex::encode(&self.header)
    }
}

/// Decrypts containers with a set of keys.
pub struct CryptEngine<'a> {
    keys: &'a [UnlockedKey],
    any_key_id: bool,
}

impl<'a> CryptEngine<'a> {
    pub fn new(keys: &'a [UnlockedKey], any_key_id: bool) -> Self {
        Self { keys, any_key_id }
    }

    /// An engine over the service keys of `keyring`.
    pub fn service(keyring: &'a Keyring) -> Self {
        Self::new(keyring.service(), keyring.any_key_id)
    }

    /// An engine that reads archived files.
    pub fn archive(keyring: &'a Keyring) -> Self {
        Self::new(std::slice::from_ref(keyring.archive()), false)
    }

    /// Ingests the inbox file `inbox` for job `job_id` into both storage targets.
    ///
    /// On any failure both targets are removed before the error is returned.
    ///
    /// # Errors
    ///
    /// See [`EngineError`]; `expected` holds checksums of the inbox file asserted by the submitter.
    pub fn ingest<S: Storage>(&self, inbox: &Path, job_id: JobId, primary: &S, backup: &S, archive_key: &UnlockedKey, expected: &[Checksum]) -> Result<Ingested, EngineError> {
        let container = match std::fs::File::open(inbox) {
            Ok(file) => io::BufReader::new(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(EngineError::InboxMissing(inbox.to_path_buf())),
            Err(e) => return Err(EngineError::Io(e)),
        };

        let archive_path = primary.locate(job_id);
        let backup_path = backup.locate(job_id);

        let result = self.ingest_into(container, &archive_path, &backup_path, primary, backup, archive_key, expected);
        match result {
            Ok((header, pass)) => {
                let session_key_fingerprints = pass.session_keys.iter().map(SessionKey::fingerprint).collect();
                info!(job_id, archive = %archive_path.display(), size = pass.archived.size(), "payload archived");
                Ok(Ingested { header, session_key_fingerprints, archive_path, backup_path, pass })
            }
            Err(error) => {
                for (storage, path) in [(primary, &archive_path), (backup, &backup_path)] {
                    if let Err(e) = storage.remove(path) {
                        warn!(path = %path.display(), "failed to remove partial output: {e:#}");
                    }
                }
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ingest_into<R: Read, S: Storage>(
        &self,
        container: R,
        archive_path: &Path,
        backup_path: &Path,
        primary: &S,
        backup: &S,
        archive_key: &UnlockedKey,
        expected: &[Checksum],
    ) -> Result<(Vec<u8>, Pass), EngineError> {
        let storage = |e: anyhow::Error| EngineError::Storage(format!("{e:#}"));
        let mut primary_writer = primary.create(archive_path).map_err(storage)?;
        let mut backup_writer = backup.create(backup_path).map_err(storage)?;

        let pass = self.process(container, &mut primary_writer, &mut backup_writer)?;
        primary_writer.flush().map_err(|e| EngineError::Storage(format!("failed to flush {}: {e}", archive_path.display())))?;
        backup_writer.flush().map_err(|e| EngineError::Storage(format!("failed to flush {}: {e}", backup_path.display())))?;

        for checksum in expected {
            if !pass.encrypted.matches(checksum) {
                return Err(EngineError::ChecksumMismatch(format!("inbox file {} is not {}", checksum.algorithm.as_ref(), checksum.value)));
            }
        }

        let header = rewrap(&pass.session_keys, archive_key)?;
        Ok((header, pass))
    }

    /// Runs one pass over `container`, copying the payload packet to both writers.
    ///
    /// # Errors
    ///
    /// See [`EngineError`].
    pub fn process<R: Read>(&self, container: R, primary: &mut dyn Write, backup: &mut dyn Write) -> Result<Pass, EngineError> {
        let mut packets = PacketReader::new(HashingReader::new(container));
        let mut session_keys: Vec<SessionKey> = Vec::new();
        let mut failures = Vec::new();

        let payload = loop {
            let Some(header) = packets.next_header()? else {
                return Err(PacketError::malformed("container holds no encrypted data").into());
            };

            match header.tag {
                Tag::PublicKeyEncryptedSessionKey => {
                    let body = packets.read_body(&header)?;
                    match self.recover(&body) {
                        Ok(session) if session_keys.iter().any(|known| known.key() == session.key()) => {}
                        Ok(session) => session_keys.push(session),
                        Err(e) => failures.push(e.to_string()),
                    }
                }
                tag if tag.is_payload() => break header,
                tag => {
                    let length = packets.body(&header).skip_to_end()?;
                    debug!(tag = tag.id(), length, "skipping header packet");
                }
            }
        };

        if session_keys.is_empty() {
            let reason = if failures.is_empty() { "no session key packet addressed to us".to_owned() } else { failures.join("; ") };
            return Err(EngineError::HeaderDecryption(reason));
        }
        debug!(count = session_keys.len(), "session keys recovered");

        let integrity_protected = payload.tag == Tag::SymEncryptedIntegrityProtectedData;
        let mut tee = TeeReader::new(packets.get_mut(), primary, backup);
        tee.write_through(payload.raw()).map_err(EngineError::from)?;

        let (literal, decrypted, cipher) = {
            let mut body = crate::packet::BodyReader::new(&mut tee, payload.length);
            if integrity_protected {
                let version = read_u8(&mut body)?;
                if version != SEIPD_VERSION {
                    return Err(EngineError::UnsupportedFeature(format!("version {version} integrity protected data")));
                }
            }

            let decryptor = SegmentDecryptor::new(session_keys.clone(), integrity_protected)?;
            let mut clear = DecryptingReader::new(&mut body, decryptor);
            let mut digests = crate::cipher::Digests::new();
            let literal = literal::extract(&mut clear, &mut digests)?;
            let trailing = clear.drain().map_err(EngineError::from)?;
            if trailing > 0 {
                return Err(PacketError::malformed(format!("{trailing} bytes after the literal data")).into());
            }
            let cipher = clear.selected().map_or(session_keys[0].algorithm(), SessionKey::algorithm);
            (literal, digests.finalize(), cipher)
        };
        let archived = tee.into_digests().finalize();

        if let Some(extra) = packets.next_header()? {
            return Err(EngineError::UnsupportedFeature(format!("packet with tag {} after the encrypted payload", extra.tag.id())));
        }

        let mut hashing = packets.into_inner();
        hashing.drain().map_err(EngineError::from)?;
        let encrypted = hashing.into_digests().finalize();

        debug!(sha256 = %decrypted.sha256_hex(), size = decrypted.size(), "payload decrypted");
        Ok(Pass { session_keys, cipher, literal, decrypted, encrypted, archived })
    }

    /// Decrypts a whole container without copying it anywhere.
    pub fn decrypt<R: Read>(&self, container: R) -> Result<Pass, EngineError> {
        self.process(container, &mut io::sink(), &mut io::sink())
    }

    fn recover(&self, body: &[u8]) -> Result<SessionKey, CryptoError> {
        let packet = EncryptedSessionKey::parse(body)?;
        let mut last = None;

        for key in self.keys {
            match resolve(&packet, key, self.any_key_id) {
                Ok(session) => {
                    debug!(key_id = %key.key_id(), cipher = %session.algorithm(), "session key recovered");
                    return Ok(session);
                }
                Err(e) => last = Some(e),
            }
        }

        Err(last.unwrap_or_else(|| CryptoError::DecryptionFailed(format!("no key for recipient {}", packet.key_id()))))
    }
}

/// Wraps every session key for the archive key and concatenates the packets.
///
/// # Errors
///
/// Returns [`EngineError::Crypto`] when the archive key cannot be encrypted to.
pub fn rewrap(session_keys: &[SessionKey], archive_key: &UnlockedKey) -> Result<Vec<u8>, EngineError> {
    let mut header = Vec::new();
    for session in session_keys {
        header.extend(EncryptedSessionKey::wrap(session, archive_key.public())?.to_packet()?);
    }
    Ok(header)
}
