//! Cipher feedback mode over the supported block ciphers.
//!
//! OpenPGP uses plain CFB in two places: private-key protection (with the
//! IV stored in the packet) and encrypted data (with an all-zero IV, the
//! random prefix playing the role of the IV). Both are served by the same
//! stream-oriented types: input may be fed in chunks of any length.

use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use cast5::Cast5;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use des::TdesEde3;

use crate::cipher::{CryptoError, SymmetricAlgorithm};

macro_rules! cfb_state {
    ($name:ident, $mode:ident, $method:ident) => {
        enum $name {
            TripleDes($mode<TdesEde3>),
            Cast5($mode<Cast5>),
            Blowfish($mode<Blowfish>),
            Aes128($mode<Aes128>),
            Aes192($mode<Aes192>),
            Aes256($mode<Aes256>),
        }

        impl $name {
            fn new(algorithm: SymmetricAlgorithm, key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
                let invalid = |_| CryptoError::InvalidKey(format!("{algorithm} needs a {}-byte key and a {}-byte IV", algorithm.key_len(), algorithm.block_size()));
                if key.len() != algorithm.key_len() {
                    return Err(invalid(()));
                }

                Ok(match algorithm {
                    SymmetricAlgorithm::TripleDes => Self::TripleDes($mode::new_from_slices(key, iv).map_err(|_| invalid(()))?),
                    SymmetricAlgorithm::Cast5 => Self::Cast5($mode::new_from_slices(key, iv).map_err(|_| invalid(()))?),
                    SymmetricAlgorithm::Blowfish => Self::Blowfish($mode::new_from_slices(key, iv).map_err(|_| invalid(()))?),
                    SymmetricAlgorithm::Aes128 => Self::Aes128($mode::new_from_slices(key, iv).map_err(|_| invalid(()))?),
                    SymmetricAlgorithm::Aes192 => Self::Aes192($mode::new_from_slices(key, iv).map_err(|_| invalid(()))?),
                    SymmetricAlgorithm::Aes256 => Self::Aes256($mode::new_from_slices(key, iv).map_err(|_| invalid(()))?),
                })
            }

            fn apply(&mut self, data: &mut [u8]) {
                match self {
                    Self::TripleDes(state) => state.$method(data),
                    Self::Cast5(state) => state.$method(data),
                    Self::Blowfish(state) => state.$method(data),
                    Self::Aes128(state) => state.$method(data),
                    Self::Aes192(state) => state.$method(data),
                    Self::Aes256(state) => state.$method(data),
                }
            }
        }
    };
}

cfb_state!(DecryptState, BufDecryptor, decrypt);
cfb_state!(EncryptState, BufEncryptor, encrypt);

/// Streaming CFB decryption.
pub struct CfbDecryptor {
    state: DecryptState,
}

impl CfbDecryptor {
    /// Creates a decryptor with an explicit IV.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] when the key or IV length does not
    /// match the algorithm.
    pub fn new(algorithm: SymmetricAlgorithm, key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self { state: DecryptState::new(algorithm, key, iv)? })
    }

    /// Creates a decryptor with the all-zero IV used for encrypted data packets.
    pub fn with_zero_iv(algorithm: SymmetricAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        Self::new(algorithm, key, &vec![0u8; algorithm.block_size()])
    }

    /// Decrypts `data` in place, continuing where the previous call stopped.
    #[inline]
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.state.apply(data);
    }
}

/// Streaming CFB encryption.
pub struct CfbEncryptor {
    state: EncryptState,
}

impl CfbEncryptor {
    pub fn new(algorithm: SymmetricAlgorithm, key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self { state: EncryptState::new(algorithm, key, iv)? })
    }

    pub fn with_zero_iv(algorithm: SymmetricAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        Self::new(algorithm, key, &vec![0u8; algorithm.block_size()])
    }

    #[inline]
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.state.apply(data);
    }
}
