//! New-format packet serialization.

use crate::packet::Tag;

/// Appends a new-format header for a body of `len` bytes.
pub fn write_header(out: &mut Vec<u8>, tag: Tag, len: usize) {
    out.push(0xc0 | tag.id());
    write_length(out, len);
}

/// Appends a new-format body length.
pub fn write_length(out: &mut Vec<u8>, len: usize) {
    match len {
        0..=191 => out.push(len as u8),
        192..=8383 => {
            let value = len - 192;
            out.push(((value >> 8) + 192) as u8);
            out.push((value & 0xff) as u8);
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
}

/// Appends a complete packet.
pub fn write_packet(out: &mut Vec<u8>, tag: Tag, body: &[u8]) {
    write_header(out, tag, body.len());
    out.extend_from_slice(body);
}
