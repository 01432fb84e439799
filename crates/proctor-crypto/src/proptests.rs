use proptest::prelude::*;

use crate::cipher::{decrypt, encrypt, CryptoError};
use crate::hash::signature_hash;

proptest! {
    // Round-trip: decrypt(encrypt(x, s), s) == x for all x and non-empty s.
    #[test]
    fn cipher_round_trip(text in ".*", secret in ".+") {
        let ct = encrypt(&text, Some(&secret)).unwrap();
        let pt = decrypt(&ct, Some(&secret)).unwrap();
        prop_assert_eq!(pt, text);
    }

    // A None secret is identity in both directions.
    #[test]
    fn none_secret_round_trip(text in ".*") {
        prop_assert_eq!(encrypt(&text, None).unwrap(), text.clone());
        prop_assert_eq!(decrypt(&text, None).unwrap(), text);
    }

    // Decryption under a different secret must not yield the plaintext.
    #[test]
    fn wrong_secret_never_decrypts(text in ".+", secret in "a.+", other in "b.+") {
        let ct = encrypt(&text, Some(&secret)).unwrap();
        prop_assert_eq!(decrypt(&ct, Some(&other)), Err(CryptoError::DecryptionFailed));
    }

    // Flipping any ciphertext byte breaks authentication.
    #[test]
    fn tampered_ciphertext_rejected(text in ".+", secret in ".+", pos in 0usize..24) {
        let ct = encrypt(&text, Some(&secret)).unwrap();
        let mut bytes = ct.into_bytes();
        let idx = pos % bytes.len();
        bytes[idx] = if bytes[idx] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(bytes).unwrap();
        prop_assert!(decrypt(&tampered, Some(&secret)).is_err());
    }

    #[test]
    fn signature_hash_deterministic(text in ".*") {
        prop_assert_eq!(signature_hash(&text), signature_hash(&text));
    }
}
