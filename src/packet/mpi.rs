use std::io::Read;

use zeroize::Zeroize;

use crate::packet::{PacketError, read_u16, read_vec};

/// A multi-precision integer (RFC 4880 §3.2): big-endian magnitude bytes.
///
/// The bytes never carry leading zeros, so [`Mpi::bits`] is exact.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize)]
pub struct Mpi(Vec<u8>);

impl Mpi {
    /// Reads a two-byte bit count followed by `(bits + 7) / 8` bytes.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, PacketError> {
        let bits = read_u16(reader)?;
        let len = (usize::from(bits) + 7) / 8;
        let bytes = read_vec(reader, len)?;
        Ok(Self::from_slice(&bytes))
    }

    /// Builds an MPI from big-endian bytes, dropping leading zeros.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Self(bytes[start..].to_vec())
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of significant bits.
    #[must_use]
    pub fn bits(&self) -> usize {
        match self.0.first() {
            Some(&first) => (self.0.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
            None => 0,
        }
    }

    /// Appends the wire encoding (bit count + magnitude) to `out`.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
        let bits = u16::try_from(self.bits()).map_err(|_| PacketError::malformed("integer too large for an MPI"))?;
        out.extend_from_slice(&bits.to_be_bytes());
        out.extend_from_slice(&self.0);
        Ok(())
    }

    /// Returns the magnitude left-padded with zeros to `len` bytes.
    #[must_use]
    pub fn to_padded(&self, len: usize) -> Vec<u8> {
        let mut padded = vec![0u8; len.saturating_sub(self.0.len())];
        padded.extend_from_slice(&self.0);
        padded
    }
}
