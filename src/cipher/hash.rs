//! File checksums.
//!
//! Every job records SHA-256 and MD5 of what it saw: the inbox container,
//! the cleartext and the archived payload. [`Digests`] accumulates them while
//! a stream is being processed; [`Checksums::from_reader`] recomputes them
//! from a file when a copy is verified later.

use anyhow::{Context, Result, ensure};
use md5::Md5;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::SEGMENT_SIZE;
use crate::types::{Checksum, ChecksumAlgorithm};

/// Running SHA-256 and MD5 of a byte stream.
#[derive(Clone, Default)]
pub struct Digests {
    sha256: Sha256,
    md5: Md5,
    size: u64,
}

impl Digests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.md5.update(data);
        self.size += data.len() as u64;
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn finalize(self) -> Checksums {
        Checksums { sha256: self.sha256.finalize().into(), md5: self.md5.finalize().into(), size: self.size }
    }
}

/// Final checksums of a byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksums {
    sha256: [u8; 32],
    md5: [u8; 16],
    size: u64,
}

impl Checksums {
    /// Computes the checksums of a data stream asynchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the underlying stream fails.
    pub async fn from_reader<R: AsyncRead + Unpin>(mut reader: R) -> Result<Self> {
        let mut digests = Digests::new();
        let mut buffer = vec![0u8; SEGMENT_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer).await.context("failed to read data for hashing")?;
            if bytes_read == 0 {
                break;
            }
            digests.update(&buffer[..bytes_read]);
        }

        Ok(digests.finalize())
    }

    #[inline]
    #[must_use]
    pub fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    #[inline]
    #[must_use]
    pub fn md5(&self) -> &[u8; 16] {
        &self.md5
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    #[must_use]
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    /// Verifies the SHA-256 against a hex digest in constant time.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest is not valid hex or does not match.
    pub fn verify_sha256(&self, expected_hex: &str) -> Result<()> {
        let expected = hex::decode(expected_hex).with_context(|| format!("invalid SHA-256 digest {expected_hex:?}"))?;
        ensure!(bool::from(self.sha256.as_slice().ct_eq(&expected)), "SHA-256 mismatch: expected {expected_hex}, computed {}", self.sha256_hex());
        Ok(())
    }

    /// Returns whether an asserted checksum matches. Case of the hex digits is ignored.
    #[must_use]
    pub fn matches(&self, checksum: &Checksum) -> bool {
        let Ok(expected) = hex::decode(checksum.value.trim()) else {
            return false;
        };
        let actual: &[u8] = match checksum.algorithm {
            ChecksumAlgorithm::Sha256 => &self.sha256,
            ChecksumAlgorithm::Md5 => &self.md5,
        };
        bool::from(actual.ct_eq(&expected))
    }

    /// The checksums in message form, SHA-256 first.
    #[must_use]
    pub fn to_list(&self) -> Vec<Checksum> {
        vec![Checksum::sha256(self.sha256_hex()), Checksum::md5(self.md5_hex())]
    }
}
