//! Re-verification of archived copies.
//!
//! Runs after a job reached `VERIFIED`: both copies are re-read from storage
//! and compared with what was captured while streaming, then the primary copy
//! is decrypted again through the rewrapped header with the archive key.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use subtle::ConstantTimeEq;
use tokio::fs::File;
use tracing::{debug, info};

use crate::cipher::Checksums;
use crate::engine::{CryptEngine, EngineError, Keyring};

/// What ingestion recorded about a job's archived copies.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub archive_path: PathBuf,
    pub backup_path: PathBuf,
    /// Size of the archived payload packet.
    pub size: u64,
    /// SHA-256 of the archived payload packet.
    pub archive_sha256: [u8; 32],
    /// SHA-256 of the cleartext.
    pub decrypted_sha256: [u8; 32],
    /// Rewrapped header.
    pub header: Vec<u8>,
}

/// Checks both copies, then decrypts the primary with the archive key.
///
/// # Errors
///
/// Returns [`EngineError::Corrupted`] when a copy no longer matches and
/// [`EngineError::Storage`] when a copy cannot be read.
pub async fn verify(recorded: &Recorded, keyring: Arc<Keyring>) -> Result<(), EngineError> {
    for path in [&recorded.archive_path, &recorded.backup_path] {
        check_copy(path, recorded.size, &recorded.archive_sha256).await?;
    }

    let header = recorded.header.clone();
    let path = recorded.archive_path.clone();
    let pass = tokio::task::spawn_blocking(move || -> Result<_, EngineError> {
        let file = std::fs::File::open(&path).map_err(|e| EngineError::Storage(format!("failed to open {}: {e}", path.display())))?;
        let container = io::Cursor::new(header).chain(io::BufReader::new(file));
        CryptEngine::archive(&keyring).decrypt(container)
    })
    .await
    .map_err(|e| EngineError::Storage(format!("verification task failed: {e}")))??;

    if !bool::from(pass.decrypted.sha256().ct_eq(&recorded.decrypted_sha256)) {
        return Err(EngineError::Corrupted(format!(
            "{} decrypts to {}, expected {}",
            recorded.archive_path.display(),
            pass.decrypted.sha256_hex(),
            hex::encode(recorded.decrypted_sha256)
        )));
    }

    info!(archive = %recorded.archive_path.display(), "archived copies verified");
    Ok(())
}

async fn check_copy(path: &Path, size: u64, sha256: &[u8; 32]) -> Result<(), EngineError> {
    let file = File::open(path).await.map_err(|e| EngineError::Storage(format!("failed to open {}: {e}", path.display())))?;
    let checksums = Checksums::from_reader(file).await.map_err(|e| EngineError::Storage(format!("{e:#}")))?;

    if checksums.size() != size {
        return Err(EngineError::Corrupted(format!("{} holds {} bytes, expected {size}", path.display(), checksums.size())));
    }
    if !bool::from(checksums.sha256().ct_eq(sha256)) {
        return Err(EngineError::Corrupted(format!("{} has SHA-256 {}, expected {}", path.display(), checksums.sha256_hex(), hex::encode(sha256))));
    }

    debug!(path = %path.display(), size, "copy matches");
    Ok(())
}
