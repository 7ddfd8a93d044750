//! # Public and Secret Keys
//!
//! Version 4 key packets (RFC 4880 §5.5) share a public prefix: version,
//! creation time, algorithm and the algorithm's public MPIs. The v4
//! fingerprint is the SHA-1 of `0x99 || u16 length || public prefix`, and
//! the key id is its low 64 bits.
//!
//! A secret key packet continues with a string-to-key usage byte that
//! decides how the private MPIs are protected:
//!
//! | Usage     | Encryption                      | Integrity                   |
//! |-----------|---------------------------------|-----------------------------|
//! | 0         | none                            | sum of bytes mod 65536      |
//! | 254       | cipher + S2K specifier + IV     | SHA-1 of the private MPIs   |
//! | 255       | cipher + S2K specifier + IV     | sum of bytes mod 65536      |
//! | otherwise | legacy: byte is the cipher id, simple MD5 S2K, IV | sum mod 65536 |
//!
//! An integrity failure after decryption always means the passphrase was
//! wrong; it is reported as [`CryptoError::WrongPassphrase`].

use std::fmt::{Debug, Display, Formatter};

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher::{CfbDecryptor, CryptoError, HashAlgorithm, S2k, SymmetricAlgorithm};
use crate::config::{KEY_VERSION, WILDCARD_KEY_ID};
use crate::packet::{Mpi, Packet, PacketReader, armor, read_u8, read_u32, read_vec};
use crate::secret::{Passphrase, SecretBytes};

/// The low 64 bits of a v4 fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; 8]);

impl KeyId {
    pub const WILDCARD: Self = Self(WILDCARD_KEY_ID);

    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }
}

impl Display for KeyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl Debug for KeyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyId({self})")
    }
}

/// Public-key algorithms (RFC 4880 §9.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublicKeyAlgorithm {
    Rsa,
    RsaEncryptOnly,
    RsaSignOnly,
    ElGamal,
    Dsa,
    ElGamalEncryptSign,
}

impl PublicKeyAlgorithm {
    /// Looks up an algorithm id.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedScheme`] for elliptic-curve and
    /// experimental ids.
    pub fn from_id(id: u8) -> Result<Self, CryptoError> {
        match id {
            1 => Ok(Self::Rsa),
            2 => Ok(Self::RsaEncryptOnly),
            3 => Ok(Self::RsaSignOnly),
            16 => Ok(Self::ElGamal),
            17 => Ok(Self::Dsa),
            20 => Ok(Self::ElGamalEncryptSign),
            100..=110 => Err(CryptoError::UnsupportedScheme(format!("experimental public-key algorithm {id}"))),
            other => Err(CryptoError::UnsupportedScheme(format!("public-key algorithm {other}"))),
        }
    }

    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Rsa => 1,
            Self::RsaEncryptOnly => 2,
            Self::RsaSignOnly => 3,
            Self::ElGamal => 16,
            Self::Dsa => 17,
            Self::ElGamalEncryptSign => 20,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Rsa | Self::RsaEncryptOnly | Self::RsaSignOnly => "RSA",
            Self::ElGamal | Self::ElGamalEncryptSign => "ElGamal",
            Self::Dsa => "DSA",
        }
    }
}

/// The public MPIs of a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicParams {
    Rsa { n: Mpi, e: Mpi },
    Dsa { p: Mpi, q: Mpi, g: Mpi, y: Mpi },
    ElGamal { p: Mpi, g: Mpi, y: Mpi },
}

impl PublicParams {
    fn read(reader: &mut &[u8], algorithm: PublicKeyAlgorithm) -> Result<Self, CryptoError> {
        Ok(match algorithm {
            PublicKeyAlgorithm::Rsa | PublicKeyAlgorithm::RsaEncryptOnly | PublicKeyAlgorithm::RsaSignOnly => {
                Self::Rsa { n: Mpi::read(reader)?, e: Mpi::read(reader)? }
            }
            PublicKeyAlgorithm::Dsa => Self::Dsa { p: Mpi::read(reader)?, q: Mpi::read(reader)?, g: Mpi::read(reader)?, y: Mpi::read(reader)? },
            PublicKeyAlgorithm::ElGamal | PublicKeyAlgorithm::ElGamalEncryptSign => {
                Self::ElGamal { p: Mpi::read(reader)?, g: Mpi::read(reader)?, y: Mpi::read(reader)? }
            }
        })
    }
}

/// The public part of a v4 key packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    created: u32,
    algorithm: PublicKeyAlgorithm,
    params: PublicParams,
    fingerprint: [u8; 20],
    subkey: bool,
}

impl PublicKey {
    /// Parses a public-key (or public-subkey) packet body.
    pub fn parse(body: &[u8], subkey: bool) -> Result<Self, CryptoError> {
        let mut reader = body;
        Self::read(&mut reader, subkey)
    }

    /// Reads the public prefix from `reader`, leaving it positioned after the last public MPI.
    fn read(reader: &mut &[u8], subkey: bool) -> Result<Self, CryptoError> {
        let start = *reader;

        let version = read_u8(reader)?;
        if version != KEY_VERSION {
            return Err(CryptoError::UnsupportedScheme(format!("version {version} key packet")));
        }

        let created = read_u32(reader)?;
        let algorithm = PublicKeyAlgorithm::from_id(read_u8(reader)?)?;
        let params = PublicParams::read(reader, algorithm)?;

        let public = &start[..start.len() - reader.len()];
        let length = u16::try_from(public.len()).map_err(|_| CryptoError::InvalidKey("public key packet too large".into()))?;

        let mut hasher = Sha1::new();
        hasher.update([0x99]);
        hasher.update(length.to_be_bytes());
        hasher.update(public);

        Ok(Self { created, algorithm, params, fingerprint: hasher.finalize().into(), subkey })
    }

    #[inline]
    #[must_use]
    pub fn algorithm(&self) -> PublicKeyAlgorithm {
        self.algorithm
    }

    #[inline]
    #[must_use]
    pub fn params(&self) -> &PublicParams {
        &self.params
    }

    #[inline]
    #[must_use]
    pub fn created(&self) -> u32 {
        self.created
    }

    #[inline]
    #[must_use]
    pub fn is_subkey(&self) -> bool {
        self.subkey
    }

    #[inline]
    #[must_use]
    pub fn fingerprint(&self) -> &[u8; 20] {
        &self.fingerprint
    }

    /// Uppercase hex fingerprint, as printed by GnuPG without spaces.
    #[must_use]
    pub fn fingerprint_hex(&self) -> String {
        hex::encode_upper(self.fingerprint)
    }

    #[must_use]
    pub fn key_id(&self) -> KeyId {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.fingerprint[12..]);
        KeyId(id)
    }

    fn rsa(&self) -> Result<RsaPublicKey, CryptoError> {
        match &self.params {
            PublicParams::Rsa { n, e } => RsaPublicKey::new(BigUint::from_bytes_be(n.as_bytes()), BigUint::from_bytes_be(e.as_bytes()))
                .map_err(|e| CryptoError::InvalidKey(e.to_string())),
            _ => Err(CryptoError::UnsupportedScheme(format!("encryption to {} keys", self.algorithm.label()))),
        }
    }

    /// Encrypts `message` to this key with EME-PKCS1-v1_5, returning the ciphertext MPIs.
    ///
    /// Only RSA keys can be encrypted to.
    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<Mpi>, CryptoError> {
        if self.algorithm == PublicKeyAlgorithm::RsaSignOnly {
            return Err(CryptoError::UnsupportedScheme("encryption to a sign-only RSA key".into()));
        }

        let key = self.rsa()?;
        let ciphertext = key.encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, message).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(vec![Mpi::from_slice(&ciphertext)])
    }
}

/// How the private MPIs of a secret key are protected.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Protection {
    Clear,
    Encrypted { cipher: SymmetricAlgorithm, s2k: S2k, iv: Vec<u8>, integrity: Integrity },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Integrity {
    Sha1,
    Sum16,
}

impl Integrity {
    fn label(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sum16 => "checksum",
        }
    }

    /// Checks the trailer of `plain` and returns the private MPIs in front of it.
    fn verify(self, plain: &[u8]) -> Result<&[u8], CryptoError> {
        match self {
            Self::Sha1 => {
                let split = plain.len().checked_sub(20).ok_or(CryptoError::WrongPassphrase(self.label()))?;
                let (material, trailer) = plain.split_at(split);
                let digest = Sha1::digest(material);
                if bool::from(digest.as_slice().ct_eq(trailer)) { Ok(material) } else { Err(CryptoError::WrongPassphrase(self.label())) }
            }
            Self::Sum16 => {
                let split = plain.len().checked_sub(2).ok_or(CryptoError::WrongPassphrase(self.label()))?;
                let (material, trailer) = plain.split_at(split);
                let sum = material.iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
                if sum.to_be_bytes() == trailer { Ok(material) } else { Err(CryptoError::WrongPassphrase(self.label())) }
            }
        }
    }
}

/// A secret key packet whose private material may still be locked.
#[derive(Clone, Debug)]
pub struct SecretKey {
    public: PublicKey,
    protection: Protection,
    private: Vec<u8>,
}

impl SecretKey {
    /// Parses a secret-key (or secret-subkey) packet body.
    pub fn parse(body: &[u8], subkey: bool) -> Result<Self, CryptoError> {
        let mut reader = body;
        let public = PublicKey::read(&mut reader, subkey)?;

        let usage = read_u8(&mut reader)?;
        let protection = match usage {
            0 => Protection::Clear,
            254 | 255 => {
                let cipher = SymmetricAlgorithm::from_id(read_u8(&mut reader)?)?;
                let s2k = S2k::read(&mut reader)?;
                let iv = read_vec(&mut reader, cipher.block_size())?;
                let integrity = if usage == 254 { Integrity::Sha1 } else { Integrity::Sum16 };
                Protection::Encrypted { cipher, s2k, iv, integrity }
            }
            legacy => {
                let cipher = SymmetricAlgorithm::from_id(legacy)?;
                let iv = read_vec(&mut reader, cipher.block_size())?;
                Protection::Encrypted { cipher, s2k: S2k::Simple { hash: HashAlgorithm::Md5 }, iv, integrity: Integrity::Sum16 }
            }
        };

        Ok(Self { public, protection, private: reader.to_vec() })
    }

    #[inline]
    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    #[inline]
    #[must_use]
    pub fn key_id(&self) -> KeyId {
        self.public.key_id()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self.protection, Protection::Encrypted { .. })
    }

    /// Decrypts and validates the private material.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::WrongPassphrase`] when the integrity trailer does not match
    /// - [`CryptoError::InvalidKey`] when the private MPIs do not belong to the public key
    /// - [`CryptoError::UnsupportedScheme`] for S2K or cipher choices we do not implement
    pub fn unlock(&self, passphrase: &Passphrase) -> Result<UnlockedKey, CryptoError> {
        let (plain, integrity) = match &self.protection {
            Protection::Clear => (Zeroizing::new(self.private.clone()), Integrity::Sum16),
            Protection::Encrypted { cipher, s2k, iv, integrity } => {
                let key = s2k.derive_key(passphrase, cipher.key_len())?;
                let mut data = Zeroizing::new(self.private.clone());
                CfbDecryptor::new(*cipher, key.expose_secret(), iv)?.decrypt(&mut data);
                (data, *integrity)
            }
        };

        let material = integrity.verify(&plain)?;
        let private = PrivateKey::from_material(&self.public, material)?;
        debug!(key_id = %self.key_id(), algorithm = self.public.algorithm.label(), "unlocked private key");

        Ok(UnlockedKey { public: self.public.clone(), private })
    }
}

/// Validated private key material.
pub enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    Dsa { x: Mpi },
    ElGamal { x: Mpi },
}

impl PrivateKey {
    fn from_material(public: &PublicKey, material: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = material;
        let key = match public.params() {
            PublicParams::Rsa { n, e } => {
                let d = Zeroizing::new(Mpi::read(&mut reader)?);
                let p = Zeroizing::new(Mpi::read(&mut reader)?);
                let q = Zeroizing::new(Mpi::read(&mut reader)?);
                let _u = Zeroizing::new(Mpi::read(&mut reader)?);

                let key = RsaPrivateKey::from_components(
                    BigUint::from_bytes_be(n.as_bytes()),
                    BigUint::from_bytes_be(e.as_bytes()),
                    BigUint::from_bytes_be(d.as_bytes()),
                    vec![BigUint::from_bytes_be(p.as_bytes()), BigUint::from_bytes_be(q.as_bytes())],
                )
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                key.validate().map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                Self::Rsa(Box::new(key))
            }
            PublicParams::Dsa { p, g, y, .. } => {
                let x = Mpi::read(&mut reader)?;
                check_exponent(p, g, y, &x)?;
                Self::Dsa { x }
            }
            PublicParams::ElGamal { p, g, y } => {
                let x = Mpi::read(&mut reader)?;
                check_exponent(p, g, y, &x)?;
                Self::ElGamal { x }
            }
        };

        if !reader.is_empty() {
            return Err(CryptoError::InvalidKey(format!("{} trailing bytes after private key material", reader.len())));
        }
        Ok(key)
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa(_) => f.write_str("PrivateKey::Rsa([redacted])"),
            Self::Dsa { .. } => f.write_str("PrivateKey::Dsa([redacted])"),
            Self::ElGamal { .. } => f.write_str("PrivateKey::ElGamal([redacted])"),
        }
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        match self {
            Self::Dsa { x } | Self::ElGamal { x } => x.zeroize(),
            // RsaPrivateKey zeroizes itself on drop.
            Self::Rsa(_) => {}
        }
    }
}

/// Checks `y == g^x mod p`.
fn check_exponent(p: &Mpi, g: &Mpi, y: &Mpi, x: &Mpi) -> Result<(), CryptoError> {
    let p = BigUint::from_bytes_be(p.as_bytes());
    // modpow panics on a zero modulus.
    if p <= BigUint::from(1u8) {
        return Err(CryptoError::InvalidKey("group modulus must be greater than 1".into()));
    }
    let expected = BigUint::from_bytes_be(g.as_bytes()).modpow(&BigUint::from_bytes_be(x.as_bytes()), &p);
    if expected == BigUint::from_bytes_be(y.as_bytes()) { Ok(()) } else { Err(CryptoError::InvalidKey("private exponent does not match public value".into())) }
}

/// A secret key whose private material has been decrypted and validated.
pub struct UnlockedKey {
    public: PublicKey,
    private: PrivateKey,
}

impl UnlockedKey {
    #[inline]
    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    #[inline]
    #[must_use]
    pub fn private(&self) -> &PrivateKey {
        &self.private
    }

    #[inline]
    #[must_use]
    pub fn key_id(&self) -> KeyId {
        self.public.key_id()
    }

    /// Decrypts the ciphertext MPIs of a session key packet and removes the EME-PKCS1-v1_5 padding.
    ///
    /// # Errors
    ///
    /// DSA keys cannot decrypt; any padding or arithmetic failure is
    /// [`CryptoError::DecryptionFailed`].
    pub fn decrypt(&self, ciphertext: &[Mpi]) -> Result<SecretBytes, CryptoError> {
        match (&self.private, self.public.params(), ciphertext) {
            (PrivateKey::Rsa(key), _, [c]) => {
                let plain = key.decrypt(Pkcs1v15Encrypt, &c.to_padded(key.size())).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
                Ok(SecretBytes::from_vec(plain))
            }
            (PrivateKey::ElGamal { x }, PublicParams::ElGamal { p, .. }, [c1, c2]) => {
                let modulus = BigUint::from_bytes_be(p.as_bytes());
                let two = BigUint::from(2u8);
                if modulus <= two {
                    return Err(CryptoError::InvalidKey("ElGamal modulus too small".into()));
                }
                let shared = BigUint::from_bytes_be(c1.as_bytes()).modpow(&BigUint::from_bytes_be(x.as_bytes()), &modulus);
                let inverse = shared.modpow(&(&modulus - &two), &modulus);
                let m = (BigUint::from_bytes_be(c2.as_bytes()) * inverse) % &modulus;
                let encoded = Zeroizing::new(Mpi::from_slice(&m.to_bytes_be()).to_padded(p.as_bytes().len()));
                unpad_pkcs1(&encoded)
            }
            (PrivateKey::Dsa { .. }, ..) => Err(CryptoError::UnsupportedScheme("decryption with a DSA key".into())),
            _ => Err(CryptoError::DecryptionFailed(format!("{} ciphertext MPIs do not fit a {} key", ciphertext.len(), self.public.algorithm.label()))),
        }
    }
}

impl Debug for UnlockedKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedKey").field("key_id", &self.key_id()).field("algorithm", &self.public.algorithm).finish_non_exhaustive()
    }
}

/// Strips `0x00 0x02 PS 0x00` from an EME-PKCS1-v1_5 block.
fn unpad_pkcs1(encoded: &[u8]) -> Result<SecretBytes, CryptoError> {
    let invalid = || CryptoError::DecryptionFailed("invalid PKCS#1 padding".into());
    let rest = match encoded {
        [0x00, 0x02, rest @ ..] => rest,
        _ => return Err(invalid()),
    };
    let separator = rest.iter().position(|&b| b == 0).ok_or_else(invalid)?;
    if separator < 8 {
        return Err(invalid());
    }
    Ok(SecretBytes::new(&rest[separator + 1..]))
}

/// Reads every secret key and subkey of a transferable secret key, armored or binary.
///
/// # Errors
///
/// Fails on a malformed container, on an unsupported key packet, or when
/// the input holds no secret key at all.
pub fn load_secret_keys(data: &[u8]) -> Result<Vec<SecretKey>, CryptoError> {
    let binary = armor::unarmor(data)?;
    let mut keys = Vec::new();

    for packet in PacketReader::new(binary.as_slice()) {
        if let Packet::SecretKey { subkey, body } = packet? {
            keys.push(SecretKey::parse(&body, subkey)?);
        }
    }

    if keys.is_empty() {
        return Err(CryptoError::InvalidKey("no secret key packet found".into()));
    }
    Ok(keys)
}
