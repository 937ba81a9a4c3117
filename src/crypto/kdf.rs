//! Session key derivation.
//!
//! A fresh ECDH shared secret plus the 16-byte salt from SERVER_HELLO are
//! expanded with HKDF-SHA256 into the per-connection AES-256-GCM key.

use hkdf::Hkdf;
use sha2::Sha256;

use super::symmetric::SessionKey;

/// Domain-separation info string for session key derivation.
pub const SESSION_INFO: &[u8] = b"mpgs/session/v1";

/// Derived session key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Length of the handshake salt carried in SERVER_HELLO.
pub const SALT_LEN: usize = 16;

/// Key schedule for deriving all cryptographic keys.
pub struct KeySchedule;

impl KeySchedule {
    /// Derive the session key from an ECDH shared secret and handshake salt.
    pub fn session_key(shared_secret: &[u8], salt: &[u8; SALT_LEN]) -> SessionKey {
        let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), shared_secret);
        let mut okm = [0u8; SESSION_KEY_LEN];
        hk.expand(SESSION_INFO, &mut okm)
            .expect("32-byte HKDF output should be valid");
        SessionKey::new(okm)
    }

    /// Derive an arbitrary-length key using HKDF-SHA256.
    pub fn derive(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], length: usize) -> Vec<u8> {
        let hk = Hkdf::<Sha256>::new(salt, ikm);
        let mut okm = vec![0u8; length];
        hk.expand(info, &mut okm)
            .expect("HKDF output length should be valid");
        okm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    #[test]
    fn test_session_key_deterministic() {
        let secret: [u8; 32] = random_bytes();
        let salt: [u8; SALT_LEN] = random_bytes();

        let k1 = KeySchedule::session_key(&secret, &salt);
        let k2 = KeySchedule::session_key(&secret, &salt);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_salt_changes_key() {
        let secret: [u8; 32] = random_bytes();
        let salt1: [u8; SALT_LEN] = random_bytes();
        let salt2: [u8; SALT_LEN] = random_bytes();

        let k1 = KeySchedule::session_key(&secret, &salt1);
        let k2 = KeySchedule::session_key(&secret, &salt2);
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_derive() {
        let ikm = b"input key material";

        let k1 = KeySchedule::derive(ikm, Some(b"salt".as_slice()), b"context", 42);
        let k2 = KeySchedule::derive(ikm, Some(b"salt".as_slice()), b"context", 42);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 42);

        let k3 = KeySchedule::derive(ikm, Some(b"salt".as_slice()), b"different", 42);
        assert_ne!(k1, k3);
    }
}
