//! # String-to-Key Derivation
//!
//! Private keys at rest are encrypted with a symmetric key derived from the
//! owner's passphrase (RFC 4880 §3.7). Three specifiers exist:
//!
//! - **Simple**: the passphrase is hashed once.
//! - **Salted**: an 8-byte salt is prepended to the passphrase.
//! - **Iterated and salted**: salt + passphrase is hashed repeatedly until
//!   `count` bytes have been processed, where the one-byte coded count
//!   expands to `(16 + (c & 15)) << ((c >> 4) + 6)`.
//!
//! When the key is longer than one digest, several hash contexts are run in
//! parallel, the i-th one preloaded with i zero bytes, and their outputs
//! concatenated.

use std::io::Read;

use zeroize::Zeroizing;

use crate::cipher::{CryptoError, HashAlgorithm, Hasher};
use crate::config::{S2K_MAX_COUNT, S2K_SALT_LEN};
use crate::packet::{read_array, read_u8};
use crate::secret::{Passphrase, SecretBytes};

/// Hashing is fed in blocks of this size rather than one seed at a time.
const FEED_BLOCK: usize = 64 * 1024;

/// A string-to-key specifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum S2k {
    Simple { hash: HashAlgorithm },
    Salted { hash: HashAlgorithm, salt: [u8; S2K_SALT_LEN] },
    IteratedSalted { hash: HashAlgorithm, salt: [u8; S2K_SALT_LEN], count: usize },
}

impl S2k {
    /// Expands a one-byte coded iteration count.
    #[inline]
    #[must_use]
    pub fn decode_count(coded: u8) -> usize {
        (16 + usize::from(coded & 15)) << ((coded >> 4) + 6)
    }

    /// Reads a specifier: type byte, hash id, then salt and coded count as the type requires.
    ///
    /// # Errors
    ///
    /// Type 2 (reserved) and the GNU extensions 100..=110 are reported as
    /// [`CryptoError::UnsupportedScheme`].
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, CryptoError> {
        let kind = read_u8(reader)?;
        match kind {
            0 => Ok(Self::Simple { hash: HashAlgorithm::from_id(read_u8(reader)?)? }),
            1 => {
                let hash = HashAlgorithm::from_id(read_u8(reader)?)?;
                let salt = read_array::<S2K_SALT_LEN, R>(reader)?;
                Ok(Self::Salted { hash, salt })
            }
            3 => {
                let hash = HashAlgorithm::from_id(read_u8(reader)?)?;
                let salt = read_array::<S2K_SALT_LEN, R>(reader)?;
                let count = Self::decode_count(read_u8(reader)?);
                Ok(Self::IteratedSalted { hash, salt, count })
            }
            2 => Err(CryptoError::UnsupportedScheme("reserved S2K type 2".into())),
            100..=110 => Err(CryptoError::UnsupportedScheme(format!("GNU experimental S2K type {kind}"))),
            other => Err(CryptoError::UnsupportedScheme(format!("unknown S2K type {other}"))),
        }
    }

    #[must_use]
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            Self::Simple { hash } | Self::Salted { hash, .. } | Self::IteratedSalted { hash, .. } => *hash,
        }
    }

    /// Derives a `key_len`-byte key from `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedScheme`] for an iteration count
    /// beyond what any coded count can express.
    pub fn derive_key(&self, passphrase: &Passphrase, key_len: usize) -> Result<SecretBytes, CryptoError> {
        let (salt, count): (&[u8], usize) = match self {
            Self::Simple { .. } => (&[], 0),
            Self::Salted { salt, .. } => (salt, 0),
            Self::IteratedSalted { salt, count, .. } => (salt, *count),
        };

        if count > S2K_MAX_COUNT {
            return Err(CryptoError::UnsupportedScheme(format!("S2K count {count} exceeds {S2K_MAX_COUNT}")));
        }

        let mut seed = Zeroizing::new(Vec::with_capacity(salt.len() + passphrase.as_bytes().len()));
        seed.extend_from_slice(salt);
        seed.extend_from_slice(passphrase.as_bytes());

        let total = count.max(seed.len());
        let block = Zeroizing::new(if seed.is_empty() { Vec::new() } else { seed.repeat((FEED_BLOCK / seed.len()).max(1)) });

        let hash = self.hash();
        let mut key = Zeroizing::new(Vec::with_capacity(key_len + hash.digest_len()));
        let mut preload = 0usize;

        while key.len() < key_len {
            let mut hasher = Hasher::new(hash);
            hasher.update(&vec![0u8; preload]);

            let mut remaining = total;
            while remaining >= block.len() && !block.is_empty() {
                hasher.update(&block);
                remaining -= block.len();
            }
            // `block` is whole repetitions of the seed, so any prefix continues the sequence.
            hasher.update(&block[..remaining.min(block.len())]);

            key.extend_from_slice(&Zeroizing::new(hasher.finalize()));
            preload += 1;
        }

        key.truncate(key_len);
        Ok(SecretBytes::new(&key))
    }
}
