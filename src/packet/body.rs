use std::io::{self, Read};

use crate::config::SEGMENT_SIZE;
use crate::packet::header::read_new_length;
use crate::packet::{BodyLength, PacketError};

/// Streams the body of one packet, following partial-length chains.
///
/// Chunk lengths are read only when the previous chunk is exhausted, so the
/// reader holds no body bytes of its own: memory use is bounded by the
/// caller's buffer.
pub struct BodyReader<R> {
    inner: R,
    remaining: u64,
    partial: bool,
    indeterminate: bool,
    consumed: u64,
}

impl<R: Read> BodyReader<R> {
    pub fn new(inner: R, length: BodyLength) -> Self {
        let (remaining, partial, indeterminate) = match length {
            BodyLength::Fixed(len) => (u64::from(len), false, false),
            BodyLength::Partial(len) => (u64::from(len), true, false),
            BodyLength::Indeterminate => (0, false, true),
        };

        Self { inner, remaining, partial, indeterminate, consumed: 0 }
    }

    /// Number of body bytes handed out so far, chunk length bytes excluded.
    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the whole body into memory, refusing bodies longer than `limit`.
    pub fn read_to_vec(&mut self, limit: usize) -> Result<Vec<u8>, PacketError> {
        let mut body = Vec::new();
        let read = self.by_ref().take(limit as u64 + 1).read_to_end(&mut body)?;
        if read > limit {
            return Err(PacketError::malformed(format!("packet body exceeds {limit} bytes")));
        }
        Ok(body)
    }

    /// Discards the rest of the body one segment at a time and returns the
    /// total number of body bytes consumed.
    pub fn skip_to_end(&mut self) -> Result<u64, PacketError> {
        let mut buffer = vec![0u8; SEGMENT_SIZE];
        while self.read(&mut buffer)? > 0 {}
        Ok(self.consumed)
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let mut raw = Vec::with_capacity(5);
        let (remaining, partial) = match read_new_length(&mut self.inner, &mut raw).map_err(PacketError::into_io)? {
            BodyLength::Fixed(len) => (len, false),
            BodyLength::Partial(len) => (len, true),
            BodyLength::Indeterminate => return Err(PacketError::malformed("indeterminate chunk length").into_io()),
        };

        self.remaining = u64::from(remaining);
        self.partial = partial;
        Ok(())
    }
}

impl<R: Read> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.indeterminate {
            let n = self.inner.read(buf)?;
            self.consumed += n as u64;
            return Ok(n);
        }

        while self.remaining == 0 {
            if !self.partial {
                return Ok(0);
            }
            self.next_chunk()?;
        }

        let want = usize::try_from(self.remaining).map_or(buf.len(), |remaining| remaining.min(buf.len()));
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(PacketError::Truncated.into_io());
        }

        self.remaining -= n as u64;
        self.consumed += n as u64;
        Ok(n)
    }
}
