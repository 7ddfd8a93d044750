//! Public-key encrypted session keys (RFC 4880 §5.1).
//!
//! The decrypted block is `[cipher id][key bytes][u16 sum of key bytes]`.

use std::fmt::{Debug, Formatter};

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cipher::{CryptoError, KeyId, PublicKey, PublicKeyAlgorithm, SymmetricAlgorithm, UnlockedKey};
use crate::config::PKESK_VERSION;
use crate::packet::writer::write_packet;
use crate::packet::{Mpi, Tag, read_array, read_u8};
use crate::secret::SecretBytes;

/// A per-file symmetric key and the cipher it is used with.
#[derive(Clone)]
pub struct SessionKey {
    algorithm: SymmetricAlgorithm,
    key: SecretBytes,
}

impl SessionKey {
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] when the key length does not fit the cipher.
    pub fn new(algorithm: SymmetricAlgorithm, key: SecretBytes) -> Result<Self, CryptoError> {
        if key.len() != algorithm.key_len() {
            return Err(CryptoError::InvalidKey(format!("{algorithm} session key must be {} bytes, got {}", algorithm.key_len(), key.len())));
        }
        Ok(Self { algorithm, key })
    }

    /// Generates a fresh random key.
    pub fn generate(algorithm: SymmetricAlgorithm) -> Self {
        use rand::RngCore;

        let mut key = Zeroizing::new(vec![0u8; algorithm.key_len()]);
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { algorithm, key: SecretBytes::new(&key) }
    }

    #[inline]
    #[must_use]
    pub fn algorithm(&self) -> SymmetricAlgorithm {
        self.algorithm
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.key.expose_secret()
    }

    /// Hex SHA-256 of the key bytes, recorded to detect replayed submissions.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.key()))
    }

    fn checksum(key: &[u8]) -> u16 {
        key.iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
    }

    /// Serializes to the block that gets encrypted to a recipient.
    #[must_use]
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut block = Zeroizing::new(Vec::with_capacity(self.key.len() + 3));
        block.push(self.algorithm.id());
        block.extend_from_slice(self.key());
        block.extend_from_slice(&Self::checksum(self.key()).to_be_bytes());
        block
    }

    /// Parses a decrypted block.
    ///
    /// # Errors
    ///
    /// A bad checksum or a length that does not fit the cipher is
    /// [`CryptoError::DecryptionFailed`].
    pub fn decode(block: &[u8]) -> Result<Self, CryptoError> {
        let [id, rest @ ..] = block else {
            return Err(CryptoError::DecryptionFailed("empty session key block".into()));
        };
        let algorithm = SymmetricAlgorithm::from_id(*id)?;

        if rest.len() != algorithm.key_len() + 2 {
            return Err(CryptoError::DecryptionFailed(format!("session key block of {} bytes does not fit {algorithm}", block.len())));
        }

        let (key, trailer) = rest.split_at(algorithm.key_len());
        if Self::checksum(key).to_be_bytes() != trailer {
            return Err(CryptoError::DecryptionFailed("session key checksum mismatch".into()));
        }

        Ok(Self { algorithm, key: SecretBytes::new(key) })
    }
}

impl Debug for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({}, [redacted])", self.algorithm)
    }
}

/// A parsed public-key encrypted session key packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedSessionKey {
    key_id: KeyId,
    algorithm: PublicKeyAlgorithm,
    ciphertext: Vec<Mpi>,
}

impl EncryptedSessionKey {
    /// Parses a packet body.
    pub fn parse(body: &[u8]) -> Result<Self, CryptoError> {
        let mut reader = body;

        let version = read_u8(&mut reader)?;
        if version != PKESK_VERSION {
            return Err(CryptoError::UnsupportedScheme(format!("version {version} session key packet")));
        }

        let key_id = KeyId::from_bytes(read_array::<8, _>(&mut reader)?);
        let algorithm = PublicKeyAlgorithm::from_id(read_u8(&mut reader)?)?;
        let count = match algorithm {
            PublicKeyAlgorithm::Rsa | PublicKeyAlgorithm::RsaEncryptOnly => 1,
            PublicKeyAlgorithm::ElGamal | PublicKeyAlgorithm::ElGamalEncryptSign => 2,
            other => return Err(CryptoError::UnsupportedScheme(format!("session key encrypted with {}", other.label()))),
        };

        let ciphertext = (0..count).map(|_| Mpi::read(&mut reader)).collect::<Result<Vec<_>, _>>()?;
        if !reader.is_empty() {
            return Err(CryptoError::Packet(crate::packet::PacketError::malformed("trailing bytes in session key packet")));
        }

        Ok(Self { key_id, algorithm, ciphertext })
    }

    /// Encrypts `session` to `recipient`.
    pub fn wrap(session: &SessionKey, recipient: &PublicKey) -> Result<Self, CryptoError> {
        let ciphertext = recipient.encrypt(&session.encode())?;
        Ok(Self { key_id: recipient.key_id(), algorithm: recipient.algorithm(), ciphertext })
    }

    #[inline]
    #[must_use]
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    #[inline]
    #[must_use]
    pub fn algorithm(&self) -> PublicKeyAlgorithm {
        self.algorithm
    }

    /// Serializes the packet body.
    pub fn to_body(&self) -> Result<Vec<u8>, CryptoError> {
        let mut body = vec![PKESK_VERSION];
        body.extend_from_slice(self.key_id.as_bytes());
        body.push(self.algorithm.id());
        for mpi in &self.ciphertext {
            mpi.write(&mut body)?;
        }
        Ok(body)
    }

    /// Serializes the whole packet with new-format framing.
    pub fn to_packet(&self) -> Result<Vec<u8>, CryptoError> {
        let body = self.to_body()?;
        let mut packet = Vec::with_capacity(body.len() + 6);
        write_packet(&mut packet, Tag::PublicKeyEncryptedSessionKey, &body);
        Ok(packet)
    }

    /// Decrypts the session key with `key`, ignoring the recipient key id.
    pub fn decrypt(&self, key: &UnlockedKey) -> Result<SessionKey, CryptoError> {
        let block = key.decrypt(&self.ciphertext)?;
        SessionKey::decode(block.expose_secret())
    }
}

/// Recovers the session key of `packet` with `key`.
///
/// The packet must name `key` (or carry the wildcard id) unless `any_key_id` is set.
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] for a packet addressed to
/// another key, for a failed decryption and for a bad checksum.
pub fn resolve(packet: &EncryptedSessionKey, key: &UnlockedKey, any_key_id: bool) -> Result<SessionKey, CryptoError> {
    if !any_key_id && !packet.key_id.is_wildcard() && packet.key_id != key.key_id() {
        return Err(CryptoError::DecryptionFailed(format!("session key is addressed to {}, not {}", packet.key_id, key.key_id())));
    }
    packet.decrypt(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::packet::{Packet, PacketReader};

    fn fixture_packet() -> EncryptedSessionKey {
        let message = fixtures::message();
        let packet = PacketReader::new(message.as_slice()).next_packet().unwrap().unwrap();
        let Packet::EncryptedSessionKey(body) = packet else { panic!("expected a session key packet") };
        EncryptedSessionKey::parse(&body).unwrap()
    }

    #[test]
    fn test_resolve_fixture() {
        let packet = fixture_packet();
        assert_eq!(packet.key_id().to_string(), fixtures::KEY_ID);
        assert_eq!(packet.algorithm(), PublicKeyAlgorithm::Rsa);

        let session = resolve(&packet, fixtures::unlocked_key(), false).unwrap();
        assert_eq!(session.algorithm(), SymmetricAlgorithm::Aes256);
        assert_eq!(hex::encode(session.key()), fixtures::SESSION_KEY);
    }

    #[test]
    fn test_body_serialization_is_stable() {
        let message = fixtures::message();
        let mut reader = PacketReader::new(message.as_slice());
        let Some(Packet::EncryptedSessionKey(body)) = reader.next_packet().unwrap() else { panic!("expected a session key packet") };

        assert_eq!(EncryptedSessionKey::parse(&body).unwrap().to_body().unwrap(), body);
    }

    #[test]
    fn test_foreign_key_id_is_refused() {
        let mut packet = fixture_packet();
        packet.key_id = KeyId::from_bytes([0x11; 8]);

        assert!(matches!(resolve(&packet, fixtures::unlocked_key(), false), Err(CryptoError::DecryptionFailed(_))));
        assert!(resolve(&packet, fixtures::unlocked_key(), true).is_ok());

        packet.key_id = KeyId::WILDCARD;
        assert!(resolve(&packet, fixtures::unlocked_key(), false).is_ok());
    }

    #[test]
    fn test_wrap_then_resolve() {
        let key = fixtures::unlocked_key();
        let session = SessionKey::generate(SymmetricAlgorithm::Aes128);

        let wrapped = EncryptedSessionKey::wrap(&session, key.public()).unwrap();
        assert_eq!(wrapped.key_id(), key.key_id());

        let packet = wrapped.to_packet().unwrap();
        let Some(Packet::EncryptedSessionKey(body)) = PacketReader::new(packet.as_slice()).next_packet().unwrap() else {
            panic!("expected a session key packet")
        };
        let recovered = resolve(&EncryptedSessionKey::parse(&body).unwrap(), key, false).unwrap();
        assert_eq!(recovered.key(), session.key());
        assert_eq!(recovered.fingerprint(), session.fingerprint());
    }

    #[test]
    fn test_checksum_mismatch() {
        let session = SessionKey::new(SymmetricAlgorithm::Cast5, SecretBytes::new(&[7u8; 16])).unwrap();
        let mut block = session.encode().to_vec();
        assert_eq!(SessionKey::decode(&block).unwrap().key(), &[7u8; 16]);

        *block.last_mut().unwrap() ^= 0x01;
        assert!(matches!(SessionKey::decode(&block), Err(CryptoError::DecryptionFailed(_))));
        assert!(matches!(SessionKey::decode(&block[..10]), Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let session = SessionKey::new(SymmetricAlgorithm::Aes128, SecretBytes::new(&[1u8; 16])).unwrap();
        assert_eq!(format!("{session:?}"), "SessionKey(AES-128, [redacted])");
    }
}
