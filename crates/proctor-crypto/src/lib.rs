//! Cryptographic primitives for the exam proctoring core.
//!
//! This crate implements:
//! - Password-based symmetric encryption for self-encrypted app signatures
//!   and the internally encrypted key registry
//! - SHA-256 signature hashing and constant-time hash comparison

#![forbid(unsafe_code)]

pub mod cipher;
pub mod hash;

#[cfg(test)]
mod proptests;

pub use cipher::{decrypt, encrypt, CryptoError};
pub use hash::{hashes_equal, sha256, signature_hash};
