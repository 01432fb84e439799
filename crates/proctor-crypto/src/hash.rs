//! Signature hashing and comparison.

use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Canonical comparison form of a decrypted app signature: lowercase hex
/// SHA-256 of the plaintext.
pub fn signature_hash(plaintext: &str) -> String {
    hex::encode(sha256(plaintext.as_bytes()))
}

/// Compare two signature hashes in constant time.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}
