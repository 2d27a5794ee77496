//! Frame ciphers
//!
//! A [`FrameCipher`] transforms the bytes of one wire frame after its length
//! prefix. Both ends of a connection must use the same cipher.

use std::fmt;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Nonce length for AES-256-GCM
pub const NONCE_LEN: usize = 12;

/// Cryptography errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

/// Encrypt/decrypt step around one raw frame body
pub trait FrameCipher: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// True when `seal` and `open` return their input unchanged
    fn is_identity(&self) -> bool {
        false
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Frames travel unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

impl FrameCipher for PlaintextCipher {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn is_identity(&self) -> bool {
        true
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(sealed.to_vec())
    }
}

/// AES-256-GCM with a fresh random nonce prefixed to every frame
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::InvalidKey(
                "Frame key must be 32 bytes (256 bits)".into(),
            ));
        }

        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(Self { cipher })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let key = hex::decode(hex_key)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid hex: {}", e)))?;
        Self::new(&key)
    }

    /// Derive the key from a passphrase using SHA-256
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let key = hasher.finalize();
        Self::new(&key)
    }
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl FrameCipher for AesGcmCipher {
    fn name(&self) -> &'static str {
        "aes256gcm"
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::DecryptionFailed(format!(
                "Sealed frame of {} bytes is shorter than the nonce",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_is_identity() {
        let cipher = PlaintextCipher;
        assert!(cipher.is_identity());
        assert_eq!(cipher.seal(b"frame").unwrap(), b"frame");
        assert_eq!(cipher.open(b"frame").unwrap(), b"frame");
    }

    #[test]
    fn test_aes_gcm_seal_open() {
        let cipher = AesGcmCipher::from_passphrase("mesh-key").unwrap();

        let data = b"frame body bytes";
        let sealed = cipher.seal(data).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + data.len() + 16);
        assert_ne!(&sealed[NONCE_LEN..NONCE_LEN + data.len()], data);

        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened.as_slice(), data);
    }

    #[test]
    fn test_nonce_differs_per_frame() {
        let cipher = AesGcmCipher::from_passphrase("mesh-key").unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = AesGcmCipher::from_passphrase("one").unwrap();
        let b = AesGcmCipher::from_passphrase("two").unwrap();
        let sealed = a.seal(b"secret").unwrap();
        assert!(matches!(
            b.open(&sealed),
            Err(CryptoError::DecryptionFailed(_))
        ));
        assert!(a.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(AesGcmCipher::new(&[0u8; 16]).is_err());
        assert!(AesGcmCipher::from_hex("not-hex").is_err());
        assert!(AesGcmCipher::from_hex(&"ab".repeat(32)).is_ok());
    }
}
