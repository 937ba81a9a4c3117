//! Key management for Bifrost.
//!
//! Two kinds of P-256 key material exist on the wire:
//! - Ephemeral exchange keys ([`KeyPair`]), one per connection, used for
//!   ECDH. Public halves travel compressed (33 bytes, ANSI X9.62 §4.3.6).
//! - The long-lived server root signing key ([`RootKeyPair`]), whose public
//!   half ([`RootPublicKey`]) is pre-shared with clients and pins the server
//!   identity via ECDSA over SERVER_HELLO.

use std::fmt;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of a compressed P-256 public key point.
pub const COMPRESSED_PUBKEY_LEN: usize = 33;

/// Length of a fixed-width (r || s) ECDSA P-256 signature.
pub const SIGNATURE_LEN: usize = 64;

/// P-256 public key for key exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: p256::PublicKey,
}

impl PublicKey {
    /// Parse from SEC1 bytes (compressed or uncompressed point).
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, CryptoError> {
        let inner = p256::PublicKey::from_sec1_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("invalid point: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode as a compressed SEC1 point.
    pub fn to_compressed(&self) -> [u8; COMPRESSED_PUBKEY_LEN] {
        let point = self.inner.to_encoded_point(true);
        let mut out = [0u8; COMPRESSED_PUBKEY_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Encode as SubjectPublicKeyInfo PEM.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.inner
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem encode: {e}")))
    }

    /// Parse from SubjectPublicKeyInfo PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = p256::PublicKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem decode: {e}")))?;
        Ok(Self { inner })
    }

    pub(crate) fn as_inner(&self) -> &p256::PublicKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.to_compressed()[..8]))
    }
}

/// P-256 secret key for key exchange.
#[derive(Clone)]
pub struct SecretKey {
    inner: p256::SecretKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        Self {
            inner: p256::SecretKey::random(&mut OsRng),
        }
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.public_key(),
        }
    }

    /// Perform Diffie-Hellman key exchange, returning the raw shared secret.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> Zeroizing<[u8; 32]> {
        let shared = p256::ecdh::diffie_hellman(
            self.inner.to_nonzero_scalar(),
            their_public.as_inner().as_affine(),
        );
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes());
        out
    }

    /// Encode as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.inner
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem encode: {e}")))
    }

    /// Parse from PKCS#8 PEM.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = p256::SecretKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem decode: {e}")))?;
        Ok(Self { inner })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Ephemeral key pair for key exchange.
#[derive(Clone)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Create from a secret key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Long-lived server root key pair for ECDSA signatures.
#[derive(Clone)]
pub struct RootKeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl RootKeyPair {
    /// Generate a new random root key pair.
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let verifying = signing.verifying_key().clone();
        Self { signing, verifying }
    }

    /// Parse from PKCS#8 PEM.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let signing = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem decode: {e}")))?;
        let verifying = signing.verifying_key().clone();
        Ok(Self { signing, verifying })
    }

    /// Encode as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, CryptoError> {
        self.signing
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem encode: {e}")))
    }

    /// Get the public half for distribution to clients.
    pub fn public(&self) -> RootPublicKey {
        RootPublicKey {
            inner: self.verifying.clone(),
        }
    }

    /// Sign a message, producing a fixed-width (r || s) signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let sig: Signature = self.signing.sign(message);
        let mut out = [0u8; SIGNATURE_LEN];
        out.copy_from_slice(&sig.to_bytes());
        out
    }
}

impl fmt::Debug for RootKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Pre-shared root public key used by clients to authenticate the server.
#[derive(Clone)]
pub struct RootPublicKey {
    inner: VerifyingKey,
}

impl RootPublicKey {
    /// Parse from SubjectPublicKeyInfo PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = VerifyingKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem decode: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode as SubjectPublicKeyInfo PEM.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.inner
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKeyEncoding(format!("pem encode: {e}")))
    }

    /// Verify a fixed-width signature over a message.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<(), CryptoError> {
        let sig = Signature::from_slice(signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;
        self.inner
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl fmt::Debug for RootPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let point = self.inner.to_encoded_point(true);
        write!(f, "RootPublicKey({})", hex::encode(&point.as_bytes()[..8]))
    }
}
