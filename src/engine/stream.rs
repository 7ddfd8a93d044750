use std::io::{self, Read, Write};

use crate::cipher::{Digests, SessionKey};
use crate::config::SEGMENT_SIZE;
use crate::engine::EngineError;
use crate::engine::segment::SegmentDecryptor;

/// Hashes everything read through it.
pub struct HashingReader<R> {
    inner: R,
    digests: Digests,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, digests: Digests::new() }
    }

    /// Reads the rest of the stream so the digests cover all of it.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    pub fn into_digests(self) -> Digests {
        self.digests
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digests.update(&buf[..n]);
        Ok(n)
    }
}

/// Copies everything read through it to the primary and backup targets.
///
/// Write failures surface as read errors carrying [`EngineError::Storage`].
pub struct TeeReader<'a, R> {
    inner: R,
    primary: &'a mut dyn Write,
    backup: &'a mut dyn Write,
    digests: Digests,
}

impl<'a, R: Read> TeeReader<'a, R> {
    pub fn new(inner: R, primary: &'a mut dyn Write, backup: &'a mut dyn Write) -> Self {
        Self { inner, primary, backup, digests: Digests::new() }
    }

    /// Writes bytes that were read elsewhere, such as an already parsed packet header.
    pub fn write_through(&mut self, data: &[u8]) -> io::Result<()> {
        self.primary.write_all(data).map_err(storage_error)?;
        self.backup.write_all(data).map_err(storage_error)?;
        self.digests.update(data);
        Ok(())
    }

    pub fn into_digests(self) -> Digests {
        self.digests
    }
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.write_through(&buf[..n])?;
        Ok(n)
    }
}

fn storage_error(error: io::Error) -> io::Error {
    EngineError::Storage(format!("failed to write archive copy: {error}")).into_io()
}

/// Decrypts an encrypted data packet body one segment at a time.
///
/// The end of the body triggers [`SegmentDecryptor::finish`], so a bad
/// modification detection code surfaces as a read error before the reader
/// reports end of stream.
pub struct DecryptingReader<R> {
    inner: R,
    decryptor: SegmentDecryptor,
    segment: Vec<u8>,
    clear: Vec<u8>,
    position: usize,
    done: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(inner: R, decryptor: SegmentDecryptor) -> Self {
        Self { inner, decryptor, segment: vec![0u8; SEGMENT_SIZE], clear: Vec::new(), position: 0, done: false }
    }

    /// The session key that matched the payload prefix.
    pub fn selected(&self) -> Option<&SessionKey> {
        self.decryptor.selected()
    }

    /// Reads to the end of the body, verifying the trailer, and returns the number of bytes discarded.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    fn fill(&mut self) -> io::Result<()> {
        while self.position == self.clear.len() && !self.done {
            let n = self.inner.read(&mut self.segment)?;
            self.clear = if n == 0 {
                self.done = true;
                self.decryptor.finish().map_err(EngineError::into_io)?
            } else {
                self.decryptor.feed(&self.segment[..n]).map_err(EngineError::into_io)?
            };
            self.position = 0;
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.fill()?;
        let available = &self.clear[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}
