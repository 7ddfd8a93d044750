//! # Key Material and Symmetric Decryption
//!
//! This module turns the opaque bodies produced by the packet decoder into
//! usable keys:
//!
//! - [`SecretKey`] parses a (possibly locked) secret-key packet and
//!   [`SecretKey::unlock`] derives the unlock key from a passphrase via
//!   [`S2k`], decrypts the private material and validates it.
//! - [`EncryptedSessionKey`] parses a public-key encrypted session key packet;
//!   [`resolve`] recovers the per-file [`SessionKey`] with an [`UnlockedKey`],
//!   and [`EncryptedSessionKey::wrap`] produces the archive-side packet.
//! - [`CfbDecryptor`] / [`CfbEncryptor`] run the OpenPGP CFB mode over the
//!   supported block ciphers.
//! - [`Digests`] / [`Checksums`] accumulate the file checksums recorded per job.
//!
//! ## Algorithm Support
//!
//! | Kind       | Supported                                        | Rejected as unsupported     |
//! |------------|--------------------------------------------------|-----------------------------|
//! | Symmetric  | 3DES, CAST5, Blowfish, AES-128/192/256           | IDEA, Twofish, Camellia     |
//! | Hash (S2K) | MD5, SHA-1, RIPEMD-160, SHA-224/256/384/512      | everything else             |
//! | Public key | RSA (decrypt), ElGamal (decrypt), DSA (unlock)   | experimental ids 100..=110  |

use std::fmt::{Display, Formatter};

use crate::packet::PacketError;

mod cfb;
mod digest;
mod hash;
mod key;
mod s2k;
mod session;

pub use cfb::{CfbDecryptor, CfbEncryptor};
pub use digest::Hasher;
pub use hash::{Checksums, Digests};
pub use key::{KeyId, PrivateKey, PublicKey, PublicKeyAlgorithm, PublicParams, SecretKey, UnlockedKey, load_secret_keys};
pub use s2k::S2k;
pub use session::{EncryptedSessionKey, SessionKey, resolve};

/// Failures while unlocking keys or recovering session keys.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The private material did not validate after decryption.
    #[error("wrong passphrase: private key material failed its {0} check")]
    WrongPassphrase(&'static str),

    /// A well-formed packet uses an algorithm or scheme we do not implement.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The session key could not be recovered or failed its checksum.
    #[error("session key decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key material that parses but is mathematically inconsistent.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Symmetric ciphers (RFC 4880 §9.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymmetricAlgorithm {
    TripleDes,
    Cast5,
    Blowfish,
    Aes128,
    Aes192,
    Aes256,
}

impl SymmetricAlgorithm {
    /// Looks up an algorithm id.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedScheme`] for ids we do not implement
    /// and for unknown ids.
    pub fn from_id(id: u8) -> Result<Self, CryptoError> {
        match id {
            2 => Ok(Self::TripleDes),
            3 => Ok(Self::Cast5),
            4 => Ok(Self::Blowfish),
            7 => Ok(Self::Aes128),
            8 => Ok(Self::Aes192),
            9 => Ok(Self::Aes256),
            0 => Err(CryptoError::UnsupportedScheme("plaintext symmetric algorithm".into())),
            1 => Err(CryptoError::UnsupportedScheme("symmetric algorithm IDEA".into())),
            10 => Err(CryptoError::UnsupportedScheme("symmetric algorithm Twofish".into())),
            11..=13 => Err(CryptoError::UnsupportedScheme("symmetric algorithm Camellia".into())),
            other => Err(CryptoError::UnsupportedScheme(format!("unknown symmetric algorithm {other}"))),
        }
    }

    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::TripleDes => 2,
            Self::Cast5 => 3,
            Self::Blowfish => 4,
            Self::Aes128 => 7,
            Self::Aes192 => 8,
            Self::Aes256 => 9,
        }
    }

    /// Key length in bytes.
    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            Self::Cast5 | Self::Blowfish | Self::Aes128 => 16,
            Self::TripleDes | Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Block length in bytes, which is also the CFB IV length.
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            Self::TripleDes | Self::Cast5 | Self::Blowfish => 8,
            Self::Aes128 | Self::Aes192 | Self::Aes256 => 16,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::TripleDes => "3DES",
            Self::Cast5 => "CAST5",
            Self::Blowfish => "Blowfish",
            Self::Aes128 => "AES-128",
            Self::Aes192 => "AES-192",
            Self::Aes256 => "AES-256",
        }
    }
}

impl Display for SymmetricAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Hash algorithms usable in S2K specifiers (RFC 4880 §9.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Ripemd160,
    Sha256,
    Sha384,
    Sha512,
    Sha224,
}

impl HashAlgorithm {
    /// Looks up an algorithm id.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedScheme`] for unknown ids.
    pub fn from_id(id: u8) -> Result<Self, CryptoError> {
        match id {
            1 => Ok(Self::Md5),
            2 => Ok(Self::Sha1),
            3 => Ok(Self::Ripemd160),
            8 => Ok(Self::Sha256),
            9 => Ok(Self::Sha384),
            10 => Ok(Self::Sha512),
            11 => Ok(Self::Sha224),
            other => Err(CryptoError::UnsupportedScheme(format!("unknown hash algorithm {other}"))),
        }
    }

    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Md5 => 1,
            Self::Sha1 => 2,
            Self::Ripemd160 => 3,
            Self::Sha256 => 8,
            Self::Sha384 => 9,
            Self::Sha512 => 10,
            Self::Sha224 => 11,
        }
    }

    /// Digest length in bytes.
    #[must_use]
    pub fn digest_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 | Self::Ripemd160 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}
