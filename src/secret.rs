//! Containers for key material and passphrases that wipe themselves on drop.

use std::fmt::{Debug, Formatter};

use secrecy::{ExposeSecret, SecretBox, SecretString};
use zeroize::Zeroize;

/// Session keys, derived keys and decrypted PKCS#1 blocks.
pub struct SecretBytes {
    inner: SecretBox<Vec<u8>>,
}

impl SecretBytes {
    pub fn new(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Takes ownership of `data` without copying it.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { inner: SecretBox::new(Box::new(data)) }
    }

    #[inline]
    pub fn expose_secret(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.expose_secret().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.expose_secret().is_empty()
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self::new(self.expose_secret())
    }
}

impl Debug for SecretBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([... {} bytes ...])", self.len())
    }
}

/// Passphrase protecting a private key at rest.
///
/// OpenPGP hashes passphrases as raw octets, so no text encoding is
/// assumed. An empty passphrase is what unprotected keys are unlocked with.
pub struct Passphrase {
    octets: SecretBox<Vec<u8>>,
}

impl Passphrase {
    pub fn new(passphrase: &str) -> Self {
        Self { octets: SecretBox::new(Box::new(passphrase.as_bytes().to_vec())) }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new("")
    }

    /// Takes the first line of `raw`, the way a passphrase file or an injected
    /// secret is read. Everything from the line break on is wiped before it is
    /// dropped.
    pub fn decode(mut raw: Vec<u8>) -> Self {
        let mut end = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
        raw[end..].zeroize();
        raw.truncate(end);
        Self { octets: SecretBox::new(Box::new(raw)) }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.octets.expose_secret()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&SecretString> for Passphrase {
    fn from(secret: &SecretString) -> Self {
        Self::decode(secret.expose_secret().as_bytes().to_vec())
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase([redacted])")
    }
}
