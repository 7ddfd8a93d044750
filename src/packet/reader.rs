use std::io::Read;

use tracing::debug;

use crate::config::MAX_PACKET_BODY;
use crate::packet::{BodyReader, Framing, Packet, PacketError, PacketHeader, Tag};

/// Iterates over the packets of a stream.
///
/// Two levels of access are offered: [`PacketReader::next_packet`] decodes
/// whole packets (reading small bodies, walking past streamed ones), while
/// [`PacketReader::next_header`] plus [`PacketReader::body`] let the caller
/// stream a body itself.
pub struct PacketReader<R> {
    inner: R,
    framing: Framing,
}

impl<R: Read> PacketReader<R> {
    /// Creates a reader for the top level of a container.
    #[inline]
    pub fn new(inner: R) -> Self {
        Self { inner, framing: Framing::Container }
    }

    /// Creates a reader for packets nested inside decrypted data.
    #[inline]
    pub fn nested(inner: R) -> Self {
        Self { inner, framing: Framing::Nested }
    }

    #[inline]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next packet header, or `None` at end of stream.
    pub fn next_header(&mut self) -> Result<Option<PacketHeader>, PacketError> {
        PacketHeader::read(&mut self.inner, self.framing)
    }

    /// Returns a reader over the body announced by `header`.
    ///
    /// The body must be consumed completely before the next header is read.
    pub fn body(&mut self, header: &PacketHeader) -> BodyReader<&mut R> {
        BodyReader::new(&mut self.inner, header.length)
    }

    /// Reads the body announced by `header` into memory.
    ///
    /// # Errors
    ///
    /// Bodies longer than [`MAX_PACKET_BODY`] are refused as malformed.
    pub fn read_body(&mut self, header: &PacketHeader) -> Result<Vec<u8>, PacketError> {
        self.body(header).read_to_vec(MAX_PACKET_BODY)
    }

    /// Decodes the next packet, or `None` at end of stream.
    ///
    /// Streamed packets are walked past one segment at a time and reported
    /// with the number of body bytes they held; unknown tags become
    /// [`Packet::Skip`].
    pub fn next_packet(&mut self) -> Result<Option<Packet>, PacketError> {
        let Some(header) = self.next_header()? else {
            return Ok(None);
        };

        let packet = if header.tag.is_streamed() {
            let length = self.body(&header).skip_to_end()?;
            match header.tag {
                Tag::SymmetricallyEncryptedData => Packet::SymEncrypted { integrity_protected: false, length },
                Tag::SymEncryptedIntegrityProtectedData => Packet::SymEncrypted { integrity_protected: true, length },
                Tag::CompressedData => Packet::Compressed { length },
                _ => Packet::Literal { length },
            }
        } else {
            match header.tag {
                Tag::PublicKey | Tag::PublicSubkey => Packet::PublicKey { subkey: header.tag == Tag::PublicSubkey, body: self.read_body(&header)? },
                Tag::SecretKey | Tag::SecretSubkey => Packet::SecretKey { subkey: header.tag == Tag::SecretSubkey, body: self.read_body(&header)? },
                Tag::UserId => Packet::UserId(self.read_body(&header)?),
                Tag::PublicKeyEncryptedSessionKey => Packet::EncryptedSessionKey(self.read_body(&header)?),
                tag => {
                    let length = self.body(&header).skip_to_end()?;
                    debug!(tag = tag.id(), length, "skipping packet");
                    Packet::Skip { tag, length }
                }
            }
        };

        Ok(Some(packet))
    }
}

impl<R: Read> Iterator for PacketReader<R> {
    type Item = Result<Packet, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}
