//! ASCII armor removal (RFC 4880 §6).
//!
//! Key files are commonly distributed armored. [`unarmor`] accepts either
//! form: binary input is returned unchanged, armored input is base64-decoded
//! and its CRC-24 checksum, when present, verified.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::packet::PacketError;

const CRC24_INIT: u32 = 0x00B7_04CE;
const CRC24_POLY: u32 = 0x0186_4CFB;

/// Computes the OpenPGP CRC-24 of `data`.
#[must_use]
pub fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for &byte in data {
        crc ^= u32::from(byte) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

/// Returns whether `data` starts with an armor header line.
#[must_use]
pub fn is_armored(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN PGP ")
}

/// Removes ASCII armor from `data`, or returns binary input as is.
///
/// # Errors
///
/// Returns [`PacketError::Malformed`] when the armor lines are incomplete,
/// the body is not valid base64, or the CRC-24 does not match.
pub fn unarmor(data: &[u8]) -> Result<Vec<u8>, PacketError> {
    if !is_armored(data) {
        return Ok(data.to_vec());
    }

    let text = std::str::from_utf8(data).map_err(|_| PacketError::malformed("armored data is not valid UTF-8"))?;
    let mut lines = text.lines().map(str::trim_end).skip_while(|line| line.trim().is_empty());

    let begin = lines.next().unwrap_or_default();
    let label = begin
        .strip_prefix("-----BEGIN PGP ")
        .and_then(|rest| rest.strip_suffix("-----"))
        .ok_or_else(|| PacketError::malformed("missing armor header line"))?;

    let mut body = String::new();
    let mut checksum = None;
    let mut in_headers = true;
    let mut ended = false;

    for line in lines {
        if let Some(rest) = line.strip_prefix("-----END PGP ") {
            if rest.strip_suffix("-----") != Some(label) {
                return Err(PacketError::malformed(format!("armor tail does not match header {label}")));
            }
            ended = true;
            break;
        }

        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if line.contains(": ") {
                continue;
            }
            in_headers = false;
        }

        if let Some(crc) = line.strip_prefix('=') {
            checksum = Some(crc.to_owned());
        } else {
            body.push_str(line.trim());
        }
    }

    if !ended {
        return Err(PacketError::malformed("missing armor tail line"));
    }

    let decoded = STANDARD.decode(body.as_bytes()).map_err(|e| PacketError::malformed(format!("invalid armor body: {e}")))?;

    if let Some(crc) = checksum {
        let bytes = STANDARD.decode(crc.as_bytes()).map_err(|e| PacketError::malformed(format!("invalid armor checksum: {e}")))?;
        let expected = match bytes.as_slice() {
            [a, b, c] => u32::from_be_bytes([0, *a, *b, *c]),
            _ => return Err(PacketError::malformed("armor checksum is not 3 bytes")),
        };
        let actual = crc24(&decoded);
        if actual != expected {
            return Err(PacketError::malformed(format!("armor checksum mismatch: expected {expected:06x}, got {actual:06x}")));
        }
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_crc24_vectors() {
        assert_eq!(crc24(b""), 0x00B7_04CE);
        assert_eq!(crc24(b"Hello PyTest\n"), 0x0090_DB69);
    }

    #[test]
    fn test_binary_passes_through() {
        let binary = fixtures::public_key();
        assert!(!is_armored(&binary));
        assert_eq!(unarmor(&binary).unwrap(), binary);
    }

    #[test]
    fn test_armored_public_key() {
        let decoded = unarmor(fixtures::PUBLIC_KEY_ARMORED.as_bytes()).unwrap();
        assert_eq!(decoded, fixtures::public_key());
        assert_eq!(crc24(&decoded), 0x00DC_CF9B);
    }

    #[test]
    fn test_armored_secret_key() {
        // Same key, exported with another S2K salt: identical up to the salt.
        let decoded = unarmor(fixtures::SECRET_KEY_ARMORED.as_bytes()).unwrap();
        let binary = fixtures::secret_key();
        assert_eq!(decoded.len(), binary.len());
        assert_eq!(decoded[..532], binary[..532]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let tampered = fixtures::PUBLIC_KEY_ARMORED.replace("=3M+b", "=3M+c");
        assert!(matches!(unarmor(tampered.as_bytes()), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn test_missing_tail() {
        let armored = "-----BEGIN PGP MESSAGE-----\n\nAAAA\n";
        assert!(matches!(unarmor(armored.as_bytes()), Err(PacketError::Malformed(_))));
    }
}
