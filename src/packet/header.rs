//! Packet header decoding (RFC 4880 §4.2).

use std::io::{ErrorKind, Read};

use crate::packet::{PacketError, Tag, read_array, read_u8};

/// Where a packet stream lives, which decides the accepted length encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Top level of a container: the old-format indeterminate length is rejected.
    Container,

    /// Packets inside decrypted or decompressed data, bounded by their
    /// enclosing stream: the indeterminate length runs to its end.
    Nested,
}

/// Declared length of a packet body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyLength {
    /// The whole body follows.
    Fixed(u32),

    /// A chunk of the body follows, then another length.
    Partial(u32),

    /// The body runs to the end of the enclosing stream.
    Indeterminate,
}

/// A decoded packet header together with the bytes it was decoded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet tag.
    pub tag: Tag,

    /// Declared body length.
    pub length: BodyLength,

    /// Whether the header used the new format.
    pub new_format: bool,

    raw: Vec<u8>,
}

impl PacketHeader {
    /// Returns the header bytes exactly as read from the stream.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Reads the next packet header, or `None` at a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Malformed`] when bit 7 of the tag byte is clear
    /// and [`PacketError::Unsupported`] for an indeterminate length in
    /// [`Framing::Container`].
    pub fn read<R: Read>(reader: &mut R, framing: Framing) -> Result<Option<Self>, PacketError> {
        let Some(first) = read_first_byte(reader)? else {
            return Ok(None);
        };

        if first & 0x80 == 0 {
            return Err(PacketError::malformed(format!("tag byte {first:#04x} does not have bit 7 set")));
        }

        let mut raw = vec![first];

        if first & 0x40 != 0 {
            let tag = Tag::from_id(first & 0x3f);
            let length = read_new_length(reader, &mut raw)?;
            return Ok(Some(Self { tag, length, new_format: true, raw }));
        }

        let tag = Tag::from_id((first & 0x3f) >> 2);
        let length = match first & 0x03 {
            0 => {
                let len = read_u8(reader)?;
                raw.push(len);
                BodyLength::Fixed(u32::from(len))
            }
            1 => {
                let bytes = read_array::<2, R>(reader)?;
                raw.extend_from_slice(&bytes);
                BodyLength::Fixed(u32::from(u16::from_be_bytes(bytes)))
            }
            2 => {
                let bytes = read_array::<4, R>(reader)?;
                raw.extend_from_slice(&bytes);
                BodyLength::Fixed(u32::from_be_bytes(bytes))
            }
            _ => match framing {
                Framing::Container => return Err(PacketError::Unsupported(format!("indeterminate length on top-level packet with tag {}", tag.id()))),
                Framing::Nested => BodyLength::Indeterminate,
            },
        };

        Ok(Some(Self { tag, length, new_format: false, raw }))
    }
}

/// Reads a new-format body length, appending the consumed bytes to `raw`.
///
/// Used both for packet headers and for the chunk lengths that follow a
/// partial chunk.
pub(crate) fn read_new_length<R: Read>(reader: &mut R, raw: &mut Vec<u8>) -> Result<BodyLength, PacketError> {
    let first = read_u8(reader)?;
    raw.push(first);

    match first {
        0..=191 => Ok(BodyLength::Fixed(u32::from(first))),
        192..=223 => {
            let second = read_u8(reader)?;
            raw.push(second);
            Ok(BodyLength::Fixed(((u32::from(first) - 192) << 8) + u32::from(second) + 192))
        }
        255 => {
            let bytes = read_array::<4, R>(reader)?;
            raw.extend_from_slice(&bytes);
            Ok(BodyLength::Fixed(u32::from_be_bytes(bytes)))
        }
        _ => Ok(BodyLength::Partial(1 << (first & 0x1f))),
    }
}

fn read_first_byte<R: Read>(reader: &mut R) -> Result<Option<u8>, PacketError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(bytes: &[u8], framing: Framing) -> Result<Option<PacketHeader>, PacketError> {
        let mut reader = bytes;
        PacketHeader::read(&mut reader, framing)
    }

    #[test]
    fn test_empty_stream_is_end() {
        assert!(header(&[], Framing::Container).unwrap().is_none());
    }

    #[test]
    fn test_bit_seven_must_be_set() {
        assert!(matches!(header(&[0x45, 0x00], Framing::Container), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn test_old_format_lengths() {
        // Secret key packet of the test key: tag 5, two-byte length 0x0746.
        let parsed = header(&[0x95, 0x07, 0x46], Framing::Container).unwrap().unwrap();
        assert_eq!(parsed.tag, Tag::SecretKey);
        assert_eq!(parsed.length, BodyLength::Fixed(0x0746));
        assert!(!parsed.new_format);
        assert_eq!(parsed.raw(), &[0x95, 0x07, 0x46]);

        let parsed = header(&[0x84, 0x10], Framing::Container).unwrap().unwrap();
        assert_eq!(parsed.tag, Tag::PublicKeyEncryptedSessionKey);
        assert_eq!(parsed.length, BodyLength::Fixed(16));

        let parsed = header(&[0x86, 0x00, 0x01, 0x00, 0x00], Framing::Container).unwrap().unwrap();
        assert_eq!(parsed.length, BodyLength::Fixed(65536));
    }

    #[test]
    fn test_old_format_indeterminate_depends_on_framing() {
        // Compressed packet with length type 3.
        assert!(matches!(header(&[0xa3], Framing::Container), Err(PacketError::Unsupported(_))));

        let parsed = header(&[0xa3], Framing::Nested).unwrap().unwrap();
        assert_eq!(parsed.tag, Tag::CompressedData);
        assert_eq!(parsed.length, BodyLength::Indeterminate);
    }

    #[test]
    fn test_new_format_lengths() {
        let parsed = header(&[0xd2, 0x52], Framing::Container).unwrap().unwrap();
        assert_eq!(parsed.tag, Tag::SymEncryptedIntegrityProtectedData);
        assert_eq!(parsed.length, BodyLength::Fixed(82));

        let parsed = header(&[0xcb, 0xc5, 0xfb], Framing::Container).unwrap().unwrap();
        assert_eq!(parsed.length, BodyLength::Fixed(1723));

        let parsed = header(&[0xcb, 0xff, 0x00, 0x01, 0x86, 0xa0], Framing::Container).unwrap().unwrap();
        assert_eq!(parsed.length, BodyLength::Fixed(100_000));

        let parsed = header(&[0xd2, 0xe9], Framing::Container).unwrap().unwrap();
        assert_eq!(parsed.length, BodyLength::Partial(512));
    }

    #[test]
    fn test_truncated_length() {
        assert!(matches!(header(&[0xcb, 0xc5], Framing::Container), Err(PacketError::Truncated)));
        assert!(matches!(header(&[0x95, 0x07], Framing::Container), Err(PacketError::Truncated)));
    }
}
