//! Payload cipher.
//!
//! Wire bodies are `base64(iv || ciphertext)`, where the ciphertext is AES-192
//! in CFB mode keyed by the 24 byte shared secret and `iv` is 16 random bytes
//! drawn for every message. There is no integrity tag: decrypting with the
//! wrong secret yields garbage rather than an error, only a malformed encoding
//! is rejected.

use std::fmt;

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use rand::RngCore;
use thiserror::Error;

use ebus_conf::SECRET_LEN;

type Aes192CfbEnc = cfb_mode::Encryptor<aes::Aes192>;
type Aes192CfbDec = cfb_mode::Decryptor<aes::Aes192>;

/// AES block size, also the IV length.
pub const IV_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("invalid secret length {0}, expected {}", SECRET_LEN)]
    KeyLength(usize),
    #[error("malformed ciphertext encoding, {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("ciphertext too short, {0} bytes")]
    Truncated(usize),
}

/// Symmetric encrypt/decrypt over byte payloads.
pub trait Cipher: Send + Sync {
    /// Encrypts `plaintext` into its text-encoded wire form.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Bytes, CipherError>;

    /// Reverses [`Cipher::encrypt`].
    fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>, CipherError>;
}

#[derive(Clone)]
pub struct AesCfb {
    key: [u8; SECRET_LEN],
}

impl fmt::Debug for AesCfb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCfb").finish_non_exhaustive()
    }
}

impl AesCfb {
    #[inline]
    pub fn new(secret: &[u8]) -> Result<Self, CipherError> {
        let key = secret.try_into().map_err(|_| CipherError::KeyLength(secret.len()))?;
        Ok(Self { key })
    }

    /// Encrypts and returns the encoding as a string.
    pub fn encrypt_to_string(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let mut buf = Vec::with_capacity(IV_LEN + plaintext.len());
        buf.extend_from_slice(&iv);
        buf.extend_from_slice(plaintext);
        Aes192CfbEnc::new_from_slices(&self.key, &iv)
            .map_err(|_| CipherError::KeyLength(self.key.len()))?
            .encrypt(&mut buf[IV_LEN..]);

        Ok(STANDARD.encode(buf))
    }

    pub fn decrypt_str(&self, encoded: &str) -> Result<Vec<u8>, CipherError> {
        self.decrypt(encoded.as_bytes())
    }
}

impl Cipher for AesCfb {
    #[inline]
    fn encrypt(&self, plaintext: &[u8]) -> Result<Bytes, CipherError> {
        self.encrypt_to_string(plaintext).map(Bytes::from)
    }

    fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>, CipherError> {
        let raw = STANDARD.decode(body)?;
        if raw.len() < IV_LEN {
            return Err(CipherError::Truncated(raw.len()));
        }
        let (iv, data) = raw.split_at(IV_LEN);
        let mut plaintext = data.to_vec();
        Aes192CfbDec::new_from_slices(&self.key, iv)
            .map_err(|_| CipherError::KeyLength(self.key.len()))?
            .decrypt(&mut plaintext);
        Ok(plaintext)
    }
}
