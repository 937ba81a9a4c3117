//! Cryptographic primitives for Bifrost.
//!
//! This module provides:
//! - Key generation and management (NIST P-256 for ECDH and ECDSA)
//! - Session key derivation (HKDF-SHA256)
//! - Symmetric encryption (AES-256-GCM)

mod kdf;
mod keys;
mod symmetric;

pub use kdf::{KeySchedule, SALT_LEN, SESSION_INFO, SESSION_KEY_LEN};
pub use keys::{
    KeyPair, PublicKey, RootKeyPair, RootPublicKey, SecretKey, COMPRESSED_PUBKEY_LEN,
    SIGNATURE_LEN,
};
pub use symmetric::{open, seal, SessionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq::constant_time_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let r1: [u8; 32] = random_bytes();
        let r2: [u8; 32] = random_bytes();
        assert_ne!(r1, r2);
    }

    #[test]
    fn test_secure_compare() {
        let a = [1u8, 2, 3, 4];
        let b = [1u8, 2, 3, 4];
        let c = [1u8, 2, 3, 5];

        assert!(secure_compare(&a, &b));
        assert!(!secure_compare(&a, &c));
        assert!(!secure_compare(&a, &b[..3]));
    }
}
