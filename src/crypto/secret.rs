//! At-rest encryption for stored credentials.
//!
//! AES-256-CBC with a random IV per call. The envelope format is
//! `hex(iv) ':' hex(ciphertext)` so two encryptions of the same plaintext
//! never compare equal while decryption stays deterministic.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Secret cipher errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption key must not be empty")]
    EmptyKey,

    #[error("Ciphertext envelope is malformed")]
    InvalidEnvelope,

    #[error("Invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptFailed,

    #[error("Decrypted data is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type for secret cipher operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Symmetric cipher for secrets stored in the database.
///
/// The key is derived by padding the configured passphrase with `'0'` to 32
/// bytes (or truncating). Weak on purpose: existing rows were encrypted this
/// way, so the derivation is frozen behind this type until a keyed migration
/// exists.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Create a cipher from a passphrase.
    pub fn new(passphrase: &str) -> CryptoResult<Self> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyKey);
        }
        let mut key = [b'0'; KEY_LEN];
        let bytes = passphrase.as_bytes();
        let n = bytes.len().min(KEY_LEN);
        key[..n].copy_from_slice(&bytes[..n]);
        Ok(Self { key })
    }

    /// Encrypt a plaintext into an `iv:ciphertext` hex envelope.
    ///
    /// Non-deterministic: a fresh IV is drawn for every call.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt an `iv:ciphertext` hex envelope back into the plaintext.
    pub fn decrypt(&self, envelope: &str) -> CryptoResult<String> {
        let (iv_hex, ct_hex) = envelope
            .split_once(':')
            .ok_or(CryptoError::InvalidEnvelope)?;
        if ct_hex.contains(':') {
            return Err(CryptoError::InvalidEnvelope);
        }

        let iv = hex::decode(iv_hex)?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidEnvelope);
        }
        let ciphertext = hex::decode(ct_hex)?;

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|_| CryptoError::DecryptFailed)?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}
