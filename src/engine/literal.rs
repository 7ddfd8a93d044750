//! Walks the packets inside decrypted data down to the literal data.
//!
//! GnuPG normally produces `Compressed(Literal)`; a bare literal packet is
//! accepted as well. Signatures, one-pass signatures and markers around the
//! literal are skipped.

use std::io::Read;

use flate2::read::{DeflateDecoder, ZlibDecoder};
use tracing::debug;

use crate::cipher::Digests;
use crate::config::SEGMENT_SIZE;
use crate::engine::EngineError;
use crate::packet::{PacketError, PacketReader, Tag, read_array, read_u8, read_vec};

/// Compressed packets nested deeper than this are refused.
const MAX_NESTING: usize = 8;

/// What the literal packet said about the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiteralInfo {
    /// `b'b'` binary, `b't'` text, `b'u'` UTF-8.
    pub format: u8,
    pub name: String,
    pub date: u32,
    pub size: u64,
}

/// Streams the literal data found in `reader` into `digests`.
///
/// # Errors
///
/// - [`EngineError::UnsupportedFeature`] for BZip2 or a second literal packet
/// - [`EngineError::Container`] when the nested packets are malformed or no literal is present
pub fn extract(reader: &mut dyn Read, digests: &mut Digests) -> Result<LiteralInfo, EngineError> {
    walk(reader, digests, 0)?.ok_or_else(|| PacketError::malformed("encrypted payload holds no literal data").into())
}

fn walk(reader: &mut dyn Read, digests: &mut Digests, depth: usize) -> Result<Option<LiteralInfo>, EngineError> {
    if depth > MAX_NESTING {
        return Err(PacketError::malformed(format!("compressed packets nested more than {MAX_NESTING} deep")).into());
    }

    let mut packets = PacketReader::nested(reader);
    let mut found = None;

    while let Some(header) = packets.next_header()? {
        let mut body = packets.body(&header);
        match header.tag {
            Tag::LiteralData => {
                if found.is_some() {
                    return Err(EngineError::UnsupportedFeature("more than one literal data packet".into()));
                }
                found = Some(read_literal(&mut body, digests)?);
            }
            Tag::CompressedData => {
                let algorithm = read_u8(&mut body)?;
                debug!(algorithm, depth, "decompressing payload");
                let inner = match algorithm {
                    0 => walk(&mut body, digests, depth + 1)?,
                    1 => walk(&mut DeflateDecoder::new(&mut body), digests, depth + 1)?,
                    2 => walk(&mut ZlibDecoder::new(&mut body), digests, depth + 1)?,
                    3 => return Err(EngineError::UnsupportedFeature("BZip2 compression".into())),
                    other => return Err(EngineError::UnsupportedFeature(format!("compression algorithm {other}"))),
                };
                body.skip_to_end()?;

                if let Some(info) = inner {
                    if found.is_some() {
                        return Err(EngineError::UnsupportedFeature("more than one literal data packet".into()));
                    }
                    found = Some(info);
                }
            }
            Tag::Signature | Tag::OnePassSignature | Tag::Marker => {
                let length = body.skip_to_end()?;
                debug!(tag = header.tag.id(), length, "skipping packet inside payload");
            }
            other => return Err(PacketError::malformed(format!("unexpected packet with tag {} inside payload", other.id())).into()),
        }
    }

    Ok(found)
}

fn read_literal<R: Read>(body: &mut R, digests: &mut Digests) -> Result<LiteralInfo, EngineError> {
    let format = read_u8(body)?;
    let name_len = read_u8(body)?;
    let name = String::from_utf8_lossy(&read_vec(body, usize::from(name_len))?).into_owned();
    let date = u32::from_be_bytes(read_array::<4, R>(body)?);

    let before = digests.size();
    let mut buffer = vec![0u8; SEGMENT_SIZE];
    loop {
        let n = body.read(&mut buffer).map_err(EngineError::from)?;
        if n == 0 {
            break;
        }
        digests.update(&buffer[..n]);
    }

    let size = digests.size() - before;
    debug!(format = %char::from(format), name = %name, size, "literal data");
    Ok(LiteralInfo { format, name, date, size })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::{DeflateEncoder, ZlibEncoder};

    use super::*;
    use crate::packet::writer::{write_header, write_packet};

    fn literal(data: &[u8]) -> Vec<u8> {
        let mut body = vec![b'b', 8];
        body.extend_from_slice(b"data.txt");
        body.extend_from_slice(&0x5abf_fd88u32.to_be_bytes());
        body.extend_from_slice(data);

        let mut packet = Vec::new();
        write_packet(&mut packet, Tag::LiteralData, &body);
        packet
    }

    fn compressed(algorithm: u8, inner: &[u8]) -> Vec<u8> {
        let mut body = vec![algorithm];
        match algorithm {
            1 => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(inner).unwrap();
                body.extend(encoder.finish().unwrap());
            }
            2 => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(inner).unwrap();
                body.extend(encoder.finish().unwrap());
            }
            _ => body.extend_from_slice(inner),
        }

        let mut packet = Vec::new();
        write_packet(&mut packet, Tag::CompressedData, &body);
        packet
    }

    fn run(data: &[u8]) -> Result<(LiteralInfo, String), EngineError> {
        let mut digests = Digests::new();
        let info = extract(&mut &data[..], &mut digests)?;
        Ok((info, digests.finalize().sha256_hex()))
    }

    #[test]
    fn test_bare_literal() {
        let (info, sha256) = run(&literal(b"Hello PyTest\n")).unwrap();
        assert_eq!(info, LiteralInfo { format: b'b', name: "data.txt".into(), date: 0x5abf_fd88, size: 13 });
        assert_eq!(sha256, crate::fixtures::ORIGINAL_SHA256);
    }

    #[test]
    fn test_every_compression_algorithm() {
        for algorithm in [0u8, 1, 2] {
            let (info, sha256) = run(&compressed(algorithm, &literal(b"Hello PyTest\n"))).unwrap();
            assert_eq!(info.size, 13, "algorithm {algorithm}");
            assert_eq!(sha256, crate::fixtures::ORIGINAL_SHA256);
        }
    }

    #[test]
    fn test_indeterminate_compressed_packet() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&literal(b"abc")).unwrap();

        let mut data = vec![0xa3, 0x02]; // old format, tag 8, runs to the end
        data.extend(encoder.finish().unwrap());
        assert_eq!(run(&data).unwrap().0.size, 3);
    }

    #[test]
    fn test_signatures_are_skipped() {
        let mut data = Vec::new();
        write_packet(&mut data, Tag::OnePassSignature, &[3, 0, 8, 1]);
        data.extend(literal(b"signed"));
        write_packet(&mut data, Tag::Signature, &[4; 40]);
        assert_eq!(run(&data).unwrap().0.size, 6);
    }

    #[test]
    fn test_bzip2_is_unsupported() {
        let data = compressed(3, b"BZh9");
        assert!(matches!(run(&data), Err(EngineError::UnsupportedFeature(reason)) if reason.contains("BZip2")));
    }

    #[test]
    fn test_two_literals_are_refused() {
        let mut data = literal(b"one");
        data.extend(literal(b"two"));
        assert!(matches!(run(&data), Err(EngineError::UnsupportedFeature(_))));
    }

    #[test]
    fn test_missing_literal() {
        let mut data = Vec::new();
        write_header(&mut data, Tag::Marker, 3);
        data.extend_from_slice(b"PGP");
        assert!(matches!(run(&data), Err(EngineError::Container(_))));
    }

    #[test]
    fn test_unexpected_packet() {
        let mut data = Vec::new();
        write_packet(&mut data, Tag::UserId, b"someone");
        assert!(matches!(run(&data), Err(EngineError::Container(_))));
    }

    #[test]
    fn test_corrupt_deflate_stream() {
        let mut packet = Vec::new();
        write_packet(&mut packet, Tag::CompressedData, &[1, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(run(&packet), Err(EngineError::Container(_))));
    }
}
