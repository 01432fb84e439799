//! Password-based symmetric encryption.
//!
//! Exam clients self-encrypt their app signature with the connection token;
//! registered trusted keys are encrypted with one shared internal secret.
//! Both sides use HKDF-SHA256 key derivation and ChaCha20Poly1305 with a
//! random nonce, hex-armored so ciphertexts travel as opaque strings.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

/// Domain separation for key derivation.
const KDF_INFO: &[u8] = b"proctor/ask-cipher/v1";

/// Nonce length of ChaCha20Poly1305.
const NONCE_LEN: usize = 12;

/// Error type for cipher operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("invalid ciphertext: too short")]
    InvalidCiphertext,
    #[error("RNG failed")]
    RngError,
}

/// Derive a 32-byte AEAD key from a secret string.
fn derive_key(secret: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());
    let mut key = [0u8; 32];
    // Only fails for absurd output lengths.
    hk.expand(KDF_INFO, &mut key)
        .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF-SHA256 output length"));
    key
}

/// Encrypt `text` with a secret string.
///
/// Returns hex(nonce(12) || ciphertext+tag). A `None` secret is identity:
/// the text passes through unchanged in both directions.
pub fn encrypt(text: &str, secret: Option<&str>) -> Result<String, CryptoError> {
    let secret = match secret {
        Some(s) => s,
        None => return Ok(text.to_string()),
    };

    let mut key = derive_key(secret);
    let aead = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::RngError)?;

    let ct = aead
        .encrypt(Nonce::from_slice(&nonce), text.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    key.zeroize();

    let mut blob = Vec::with_capacity(NONCE_LEN + ct.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ct);
    Ok(hex::encode(blob))
}

/// Decrypt a hex-armored ciphertext produced by [`encrypt`].
///
/// Fails with [`CryptoError::DecryptionFailed`] on malformed hex, short
/// blobs, or an AEAD tag mismatch; never panics. A `None` secret is
/// identity, matching [`encrypt`].
pub fn decrypt(cipher: &str, secret: Option<&str>) -> Result<String, CryptoError> {
    let secret = match secret {
        Some(s) => s,
        None => return Ok(cipher.to_string()),
    };

    let blob = hex::decode(cipher).map_err(|_| CryptoError::DecryptionFailed)?;
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::InvalidCiphertext);
    }
    let (nonce, ct) = blob.split_at(NONCE_LEN);

    let mut key = derive_key(secret);
    let aead = ChaCha20Poly1305::new(Key::from_slice(&key));
    let pt = aead
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    key.zeroize();

    String::from_utf8(pt).map_err(|_| CryptoError::DecryptionFailed)
}
