//! # OpenPGP Packet Decoder
//!
//! This module parses the self-describing packet stream of an OpenPGP
//! container (RFC 4880 §4). It knows how packets are framed and nothing
//! about what they mean: key material, session keys and encrypted data are
//! handed out as opaque bodies (or as streaming readers) and interpreted by
//! the [`crate::cipher`] and [`crate::engine`] modules.
//!
//! ## Framing
//!
//! - Every packet starts with a tag byte whose bit 7 is set.
//! - Bit 6 selects the new format (tag in the low six bits, one/two/five-byte
//!   or partial lengths) or the old format (tag in bits 5..2, length type in
//!   bits 1..0).
//! - Partial lengths chain power-of-two chunks until a non-partial chunk
//!   terminates the body. [`BodyReader`] walks such chains lazily so that a
//!   body is never materialized unless the caller asks for it.
//! - The old-format "indeterminate" length is rejected at the top level of a
//!   container and only accepted for packets nested inside decrypted data
//!   (see [`Framing`]).
//!
//! ## Components
//!
//! - [`PacketReader`]: iterates over packet headers and packets
//! - [`BodyReader`]: a [`std::io::Read`] over one packet body
//! - [`Mpi`]: multi-precision integers as stored in key packets
//! - [`armor`]: ASCII armor removal with CRC-24 verification
//! - [`writer`]: new-format packet serialization

use std::io::{self, Read};

pub mod armor;
mod body;
mod header;
mod mpi;
mod reader;
pub mod writer;

pub use body::BodyReader;
pub use header::{BodyLength, Framing, PacketHeader};
pub use mpi::Mpi;
pub use reader::PacketReader;

/// Failures of the packet decoder.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The stream does not follow the OpenPGP framing rules.
    #[error("malformed container: {0}")]
    Malformed(String),

    /// The stream ended inside a packet.
    #[error("malformed container: unexpected end of data")]
    Truncated,

    /// Valid framing we deliberately do not handle.
    #[error("unsupported container feature: {0}")]
    Unsupported(String),

    /// The underlying reader failed.
    #[error("failed to read container: {0}")]
    Io(io::Error),
}

impl PacketError {
    /// Shorthand for [`PacketError::Malformed`].
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    /// Converts the error into an [`io::Error`] so it can cross a [`Read`] boundary.
    ///
    /// [`PacketError::from`] recovers the original error on the other side.
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io(error) => error,
            Self::Truncated => io::Error::new(io::ErrorKind::UnexpectedEof, "packet body truncated"),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<io::Error> for PacketError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            return Self::Truncated;
        }

        if error.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            if let Some(Ok(inner)) = error.into_inner().map(|inner| inner.downcast::<Self>()) {
                return *inner;
            }
            return Self::malformed("unreadable framing error");
        }

        Self::Io(error)
    }
}

/// Packet tags (RFC 4880 §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    PublicKeyEncryptedSessionKey,
    Signature,
    SymmetricKeyEncryptedSessionKey,
    OnePassSignature,
    SecretKey,
    PublicKey,
    SecretSubkey,
    CompressedData,
    SymmetricallyEncryptedData,
    Marker,
    LiteralData,
    Trust,
    UserId,
    PublicSubkey,
    UserAttribute,
    SymEncryptedIntegrityProtectedData,
    ModificationDetectionCode,
    Unknown(u8),
}

impl Tag {
    #[must_use]
    pub fn from_id(id: u8) -> Self {
        match id {
            1 => Self::PublicKeyEncryptedSessionKey,
            2 => Self::Signature,
            3 => Self::SymmetricKeyEncryptedSessionKey,
            4 => Self::OnePassSignature,
            5 => Self::SecretKey,
            6 => Self::PublicKey,
            7 => Self::SecretSubkey,
            8 => Self::CompressedData,
            9 => Self::SymmetricallyEncryptedData,
            10 => Self::Marker,
            11 => Self::LiteralData,
            12 => Self::Trust,
            13 => Self::UserId,
            14 => Self::PublicSubkey,
            17 => Self::UserAttribute,
            18 => Self::SymEncryptedIntegrityProtectedData,
            19 => Self::ModificationDetectionCode,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::PublicKeyEncryptedSessionKey => 1,
            Self::Signature => 2,
            Self::SymmetricKeyEncryptedSessionKey => 3,
            Self::OnePassSignature => 4,
            Self::SecretKey => 5,
            Self::PublicKey => 6,
            Self::SecretSubkey => 7,
            Self::CompressedData => 8,
            Self::SymmetricallyEncryptedData => 9,
            Self::Marker => 10,
            Self::LiteralData => 11,
            Self::Trust => 12,
            Self::UserId => 13,
            Self::PublicSubkey => 14,
            Self::UserAttribute => 17,
            Self::SymEncryptedIntegrityProtectedData => 18,
            Self::ModificationDetectionCode => 19,
            Self::Unknown(other) => other,
        }
    }

    /// Returns whether this tag carries the encrypted payload of a message.
    #[inline]
    #[must_use]
    pub fn is_payload(self) -> bool {
        matches!(self, Self::SymmetricallyEncryptedData | Self::SymEncryptedIntegrityProtectedData)
    }

    /// Returns whether the body of this tag is consumed as a stream rather than read into memory.
    #[inline]
    #[must_use]
    pub fn is_streamed(self) -> bool {
        matches!(self, Self::SymmetricallyEncryptedData | Self::SymEncryptedIntegrityProtectedData | Self::CompressedData | Self::LiteralData)
    }
}

/// One decoded packet.
///
/// Small packets carry their body verbatim. Streamed packets (encrypted,
/// compressed and literal data) only report how many body bytes were walked
/// past, so that iterating over a container never buffers a payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet {
    PublicKey { subkey: bool, body: Vec<u8> },
    SecretKey { subkey: bool, body: Vec<u8> },
    UserId(Vec<u8>),
    EncryptedSessionKey(Vec<u8>),
    SymEncrypted { integrity_protected: bool, length: u64 },
    Compressed { length: u64 },
    Literal { length: u64 },
    Skip { tag: Tag, length: u64 },
}

impl Packet {
    #[must_use]
    pub fn tag(&self) -> Tag {
        match self {
            Self::PublicKey { subkey: false, .. } => Tag::PublicKey,
            Self::PublicKey { subkey: true, .. } => Tag::PublicSubkey,
            Self::SecretKey { subkey: false, .. } => Tag::SecretKey,
            Self::SecretKey { subkey: true, .. } => Tag::SecretSubkey,
            Self::UserId(_) => Tag::UserId,
            Self::EncryptedSessionKey(_) => Tag::PublicKeyEncryptedSessionKey,
            Self::SymEncrypted { integrity_protected: false, .. } => Tag::SymmetricallyEncryptedData,
            Self::SymEncrypted { integrity_protected: true, .. } => Tag::SymEncryptedIntegrityProtectedData,
            Self::Compressed { .. } => Tag::CompressedData,
            Self::Literal { .. } => Tag::LiteralData,
            Self::Skip { tag, .. } => *tag,
        }
    }
}

pub(crate) fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N], PacketError> {
    let mut buffer = [0u8; N];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

pub(crate) fn read_u8<R: Read>(reader: &mut R) -> Result<u8, PacketError> {
    Ok(read_array::<1, R>(reader)?[0])
}

pub(crate) fn read_u16<R: Read>(reader: &mut R) -> Result<u16, PacketError> {
    Ok(u16::from_be_bytes(read_array::<2, R>(reader)?))
}

pub(crate) fn read_u32<R: Read>(reader: &mut R) -> Result<u32, PacketError> {
    Ok(u32::from_be_bytes(read_array::<4, R>(reader)?))
}

pub(crate) fn read_vec<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, PacketError> {
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_ids_round_trip() {
        for id in 0..=63u8 {
            assert_eq!(Tag::from_id(id).id(), id);
        }
    }

    #[test]
    fn test_error_crosses_io_boundary() {
        let io = PacketError::malformed("bit 7 clear").into_io();
        assert!(matches!(PacketError::from(io), PacketError::Malformed(reason) if reason == "bit 7 clear"));

        let io = PacketError::Truncated.into_io();
        assert!(matches!(PacketError::from(io), PacketError::Truncated));
    }

    #[test]
    fn test_read_helpers() {
        let mut data: &[u8] = &[0x01, 0x02, 0x03, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(read_u8(&mut data).unwrap(), 1);
        assert_eq!(read_u16(&mut data).unwrap(), 0x0203);
        assert_eq!(read_u32(&mut data).unwrap(), 0x0000_0100);
        assert!(matches!(read_u8(&mut data), Err(PacketError::Truncated)));
    }
}
