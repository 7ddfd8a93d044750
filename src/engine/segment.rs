//! Incremental decryption of an encrypted data packet body.
//!
//! [`SegmentDecryptor`] is fed ciphertext in chunks of any size and hands
//! back the cleartext that is safe to release:
//!
//! - The first `block_size + 2` bytes are the random prefix. They select the
//!   session key: the last two prefix bytes repeat the two before them.
//! - With integrity protection (tag 18) the last 22 cleartext bytes are the
//!   MDC packet, so that many bytes are always held back until
//!   [`SegmentDecryptor::finish`] checks the SHA-1 over prefix, cleartext and
//!   the MDC header.
//! - Without it (tag 9) the cipher is resynchronised after the prefix, the
//!   IV being ciphertext bytes `2..block_size + 2`.

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::cipher::{CfbDecryptor, SessionKey, SymmetricAlgorithm};
use crate::config::{MDC_HEADER, MDC_PACKET_LEN};
use crate::engine::EngineError;

enum State {
    /// Collecting the random prefix.
    Prefix { ciphertext: Vec<u8> },
    /// Streaming the body with the selected key.
    Body { cfb: Box<CfbDecryptor>, mdc: Option<Sha1>, held: Vec<u8> },
    Finished,
}

/// Streaming decryption of one encrypted data packet body.
pub struct SegmentDecryptor {
    candidates: Vec<SessionKey>,
    integrity_protected: bool,
    selected: Option<usize>,
    state: State,
}

impl SegmentDecryptor {
    /// Creates a decryptor that tries each candidate key on the prefix.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HeaderDecryption`] when there is no candidate.
    pub fn new(candidates: Vec<SessionKey>, integrity_protected: bool) -> Result<Self, EngineError> {
        if candidates.is_empty() {
            return Err(EngineError::HeaderDecryption("no session key to decrypt the payload with".into()));
        }
        Ok(Self { candidates, integrity_protected, selected: None, state: State::Prefix { ciphertext: Vec::new() } })
    }

    /// The session key that matched the prefix, once it is known.
    #[must_use]
    pub fn selected(&self) -> Option<&SessionKey> {
        self.selected.map(|index| &self.candidates[index])
    }

    /// Decrypts `chunk` and returns the cleartext that can be released.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PayloadDecryption`] when no candidate key
    /// decrypts the prefix.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<u8>, EngineError> {
        let needed = self.prefix_len();
        match &mut self.state {
            State::Prefix { ciphertext } => {
                ciphertext.extend_from_slice(chunk);
                if ciphertext.len() < needed {
                    return Ok(Vec::new());
                }

                let buffered = std::mem::take(ciphertext);
                let consumed = self.select(&buffered)?;
                self.release(buffered[consumed..].to_vec())
            }
            State::Body { .. } => self.release(chunk.to_vec()),
            State::Finished => Err(EngineError::PayloadDecryption("data fed after the end of the payload".into())),
        }
    }

    /// Ends the stream and returns the remaining cleartext.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PayloadDecryption`] when the payload is
    /// truncated or its modification detection code does not match.
    pub fn finish(&mut self) -> Result<Vec<u8>, EngineError> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Prefix { .. } => Err(EngineError::PayloadDecryption("payload ends inside the random prefix".into())),
            State::Finished => Ok(Vec::new()),
            State::Body { mdc: None, held, .. } => Ok(held),
            State::Body { mdc: Some(mut sha1), held, .. } => {
                if held.len() != MDC_PACKET_LEN || held[..2] != MDC_HEADER {
                    return Err(EngineError::PayloadDecryption("payload ends without a modification detection code".into()));
                }

                sha1.update(MDC_HEADER);
                let digest = sha1.finalize();
                if !bool::from(digest.as_slice().ct_eq(&held[2..])) {
                    return Err(EngineError::PayloadDecryption("modification detection code mismatch".into()));
                }

                debug!("modification detection code verified");
                Ok(Vec::new())
            }
        }
    }

    /// Bytes to buffer before every candidate can be tried on its prefix.
    fn prefix_len(&self) -> usize {
        self.candidates.iter().map(|candidate| candidate.algorithm().block_size() + 2).max().unwrap_or_default()
    }

    /// Picks the candidate whose prefix checks out and returns the prefix length.
    fn select(&mut self, ciphertext: &[u8]) -> Result<usize, EngineError> {
        for (index, candidate) in self.candidates.iter().enumerate() {
            let algorithm = candidate.algorithm();
            let block_size = algorithm.block_size();
            let prefix = &ciphertext[..block_size + 2];

            let mut cfb = CfbDecryptor::with_zero_iv(algorithm, candidate.key())?;
            let mut clear = prefix.to_vec();
            cfb.decrypt(&mut clear);
            if clear[block_size - 2..block_size] != clear[block_size..] {
                continue;
            }

            let (cfb, mdc) = if self.integrity_protected {
                let mut sha1 = Sha1::new();
                sha1.update(&clear);
                (cfb, Some(sha1))
            } else {
                (resync(algorithm, candidate.key(), prefix)?, None)
            };

            debug!(cipher = %algorithm, candidate = index, "session key matches payload prefix");
            self.selected = Some(index);
            self.state = State::Body { cfb: Box::new(cfb), mdc, held: Vec::new() };
            return Ok(block_size + 2);
        }

        Err(EngineError::PayloadDecryption("no session key decrypts the payload prefix".into()))
    }

    fn release(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, EngineError> {
        let State::Body { cfb, mdc, held } = &mut self.state else {
            return Err(EngineError::PayloadDecryption("payload decrypted before a key was selected".into()));
        };

        cfb.decrypt(&mut data);

        let Some(sha1) = mdc else {
            return Ok(data);
        };

        // The MDC packet is only recognisable once the input ends, so the
        // trailing MDC_PACKET_LEN bytes never leave until `finish`.
        held.extend_from_slice(&data);
        let ready = held.len().saturating_sub(MDC_PACKET_LEN);
        let out: Vec<u8> = held.drain(..ready).collect();
        sha1.update(&out);
        Ok(out)
    }
}

/// Tag 9 restarts CFB after the prefix check: the new IV is the last
/// `block_size` ciphertext bytes of the prefix, not a continuation of the stream.
fn resync(algorithm: SymmetricAlgorithm, key: &[u8], prefix: &[u8]) -> Result<CfbDecryptor, EngineError> {
    Ok(CfbDecryptor::new(algorithm, key, &prefix[2..])?)
}

/// Builds an encrypted data packet body the way GnuPG does.
#[cfg(test)]
pub(crate) fn seal(session: &SessionKey, cleartext: &[u8], integrity_protected: bool) -> Vec<u8> {
    use crate::cipher::CfbEncryptor;

    let algorithm = session.algorithm();
    let block_size = algorithm.block_size();
    let mut prefix: Vec<u8> = (0..block_size as u8).map(|i| i.wrapping_mul(37).wrapping_add(11)).collect();
    let repeated = prefix[block_size - 2..].to_vec();
    prefix.extend_from_slice(&repeated);

    if integrity_protected {
        let mut plain = prefix;
        plain.extend_from_slice(cleartext);
        plain.extend_from_slice(&MDC_HEADER);
        let digest = Sha1::digest(&plain);
        plain.extend_from_slice(&digest);

        CfbEncryptor::with_zero_iv(algorithm, session.key()).unwrap().encrypt(&mut plain);
        plain
    } else {
        let mut sealed = prefix;
        CfbEncryptor::with_zero_iv(algorithm, session.key()).unwrap().encrypt(&mut sealed);

        let mut body = cleartext.to_vec();
        CfbEncryptor::new(algorithm, session.key(), &sealed[2..]).unwrap().encrypt(&mut body);
        sealed.extend_from_slice(&body);
        sealed
    }
}
