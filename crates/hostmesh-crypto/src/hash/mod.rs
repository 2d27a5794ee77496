//! Hash and signature utilities

use digest::Digest;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> Result<String, CryptoError> {
    Ok(hex::encode(hmac_sha256(key, data)?))
}

/// Canonical byte string covered by a request signature.
/// Fields are newline separated so that shifting text between
/// adjacent fields changes the signed bytes.
fn canonical_fields(fields: &[&str]) -> Vec<u8> {
    fields.join("\n").into_bytes()
}

/// Sign an ordered list of request fields, hex encoded
pub fn sign_fields(secret: &[u8], fields: &[&str]) -> Result<String, CryptoError> {
    hmac_sha256_hex(secret, &canonical_fields(fields))
}

/// Verify a hex signature produced by [`sign_fields`] in constant time
pub fn verify_fields(secret: &[u8], fields: &[&str], signature: &str) -> Result<(), CryptoError> {
    let expected = hex::decode(signature)
        .map_err(|e| CryptoError::InvalidSignature(format!("Invalid hex: {}", e)))?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(&canonical_fields(fields));
    mac.verify_slice(&expected)
        .map_err(|_| CryptoError::InvalidSignature("Signature mismatch".into()))
}
