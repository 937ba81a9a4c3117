//! Handshake message bodies.
//!
//! Three messages establish a connection:
//!
//! 1. `CLIENT_HELLO` — protocol version and the client's ephemeral public
//!    key, padded with random bytes so the datagram is never smaller than
//!    the SERVER_HELLO it elicits (a reflector cannot use the server as an
//!    amplifier).
//! 2. `SERVER_HELLO` — the server's ephemeral public key, the HKDF salt and
//!    the challenge token, signed by the server root key over both sides'
//!    ephemeral keys.
//! 3. `CHALLENGE_RESP` — the token echoed under the freshly derived session
//!    key, proving both sides agree on it.

use rand::RngCore;

use crate::crypto::{
    PublicKey, RootKeyPair, RootPublicKey, COMPRESSED_PUBKEY_LEN, SALT_LEN, SIGNATURE_LEN,
};
use crate::error::{CryptoError, Error, ProtocolError, Result};
use crate::types::ConnectionToken;

use super::header::HEADER_SIZE;
use super::packet::{CRC_SIZE, MESSAGE_OVERHEAD_1};

/// Challenge token length.
pub const TOKEN_LEN: usize = 16;

/// Fixed CLIENT_HELLO body length after padding.
pub const CLIENT_HELLO_LEN: usize = 160;

/// SERVER_HELLO body length.
pub const SERVER_HELLO_LEN: usize =
    COMPRESSED_PUBKEY_LEN + SALT_LEN + TOKEN_LEN + SIGNATURE_LEN;

/// Wire size of a SERVER_HELLO datagram.
///
/// A CLIENT_HELLO datagram smaller than this is dropped unanswered.
pub const SERVER_HELLO_WIRE_LEN: usize =
    HEADER_SIZE + MESSAGE_OVERHEAD_1 + SERVER_HELLO_LEN + CRC_SIZE;

/// Handshake step 1 body.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub version: u32,
    pub client_pubkey: PublicKey,
}

impl ClientHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CLIENT_HELLO_LEN);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.client_pubkey.to_compressed());

        let mut padding = vec![0u8; CLIENT_HELLO_LEN - buf.len()];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        buf.extend_from_slice(&padding);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < CLIENT_HELLO_LEN {
            return Err(ProtocolError::MalformedPacket("short client hello".into()).into());
        }
        let version = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let client_pubkey = PublicKey::from_sec1(&body[4..4 + COMPRESSED_PUBKEY_LEN])?;
        Ok(Self {
            version,
            client_pubkey,
        })
    }
}

/// Handshake step 2 body.
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub server_pubkey: PublicKey,
    pub salt: [u8; SALT_LEN],
    pub token: ConnectionToken,
}

impl ServerHello {
    /// The byte string covered by the root signature.
    ///
    /// Binding the client's ephemeral key into the signature stops a
    /// middleman from replaying a captured SERVER_HELLO at another client.
    fn signed_region(&self, client_pubkey: &PublicKey) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(2 * COMPRESSED_PUBKEY_LEN + SALT_LEN + TOKEN_LEN);
        buf.extend_from_slice(&self.server_pubkey.to_compressed());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(self.token.as_bytes());
        buf.extend_from_slice(&client_pubkey.to_compressed());
        buf
    }

    /// Encode and sign with the server root key.
    pub fn encode_signed(&self, client_pubkey: &PublicKey, root: &RootKeyPair) -> Vec<u8> {
        let signature = root.sign(&self.signed_region(client_pubkey));

        let mut buf = Vec::with_capacity(SERVER_HELLO_LEN);
        buf.extend_from_slice(&self.server_pubkey.to_compressed());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(self.token.as_bytes());
        buf.extend_from_slice(&signature);
        buf
    }

    /// Decode and verify the root signature against the pinned public key.
    pub fn decode_verified(
        body: &[u8],
        client_pubkey: &PublicKey,
        root: &RootPublicKey,
    ) -> Result<Self> {
        if body.len() < SERVER_HELLO_LEN {
            return Err(ProtocolError::MalformedPacket("short server hello".into()).into());
        }

        let server_pubkey = PublicKey::from_sec1(&body[..COMPRESSED_PUBKEY_LEN])?;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&body[COMPRESSED_PUBKEY_LEN..COMPRESSED_PUBKEY_LEN + SALT_LEN]);

        let mut token = [0u8; TOKEN_LEN];
        let token_start = COMPRESSED_PUBKEY_LEN + SALT_LEN;
        token.copy_from_slice(&body[token_start..token_start + TOKEN_LEN]);

        let mut signature = [0u8; SIGNATURE_LEN];
        let sig_start = token_start + TOKEN_LEN;
        signature.copy_from_slice(&body[sig_start..sig_start + SIGNATURE_LEN]);

        let hello = Self {
            server_pubkey,
            salt,
            token: ConnectionToken::from_bytes(token),
        };

        root.verify(&hello.signed_region(client_pubkey), &signature)
            .map_err(|_| Error::Crypto(CryptoError::SignatureVerificationFailed))?;

        Ok(hello)
    }
}

/// Handshake step 3 body.
#[derive(Debug, Clone)]
pub struct ChallengeResponse {
    pub token: ConnectionToken,
}

impl ChallengeResponse {
    pub fn encode(&self) -> Vec<u8> {
        self.token.as_bytes().to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < TOKEN_LEN {
            return Err(
                ProtocolError::MalformedPacket("short challenge response".into()).into(),
            );
        }
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&body[..TOKEN_LEN]);
        Ok(Self {
            token: ConnectionToken::from_bytes(token),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_bytes, KeyPair};

    #[test]
    fn test_client_hello_roundtrip() {
        let kp = KeyPair::generate();
        let hello = ClientHello {
            version: 3,
            client_pubkey: kp.public.clone(),
        };

        let body = hello.encode();
        assert_eq!(body.len(), CLIENT_HELLO_LEN);

        let decoded = ClientHello::decode(&body).unwrap();
        assert_eq!(decoded.version, 3);
        assert_eq!(decoded.client_pubkey, kp.public);
    }

    #[test]
    fn test_client_hello_padding_is_random() {
        let kp = KeyPair::generate();
        let hello = ClientHello {
            version: 1,
            client_pubkey: kp.public.clone(),
        };
        assert_ne!(hello.encode()[40..], hello.encode()[40..]);
    }

    #[test]
    fn test_client_hello_covers_server_hello() {
        // the padded hello keeps the request at least as large as the reply
        let wire = HEADER_SIZE + MESSAGE_OVERHEAD_1 + CLIENT_HELLO_LEN + CRC_SIZE;
        assert!(wire >= SERVER_HELLO_WIRE_LEN);
    }

    #[test]
    fn test_server_hello_roundtrip() {
        let root = RootKeyPair::generate();
        let client = KeyPair::generate();
        let server = KeyPair::generate();

        let hello = ServerHello {
            server_pubkey: server.public.clone(),
            salt: random_bytes(),
            token: ConnectionToken::generate(),
        };

        let body = hello.encode_signed(&client.public, &root);
        assert_eq!(body.len(), SERVER_HELLO_LEN);

        let decoded =
            ServerHello::decode_verified(&body, &client.public, &root.public()).unwrap();
        assert_eq!(decoded.server_pubkey, server.public);
        assert_eq!(decoded.salt, hello.salt);
        assert_eq!(decoded.token, hello.token);
    }

    #[test]
    fn test_server_hello_tamper_rejected() {
        let root = RootKeyPair::generate();
        let client = KeyPair::generate();
        let server = KeyPair::generate();

        let hello = ServerHello {
            server_pubkey: server.public.clone(),
            salt: random_bytes(),
            token: ConnectionToken::generate(),
        };
        let good = hello.encode_signed(&client.public, &root);

        // any byte of the signed region or signature invalidates it
        for idx in [34usize, 50, 70, SERVER_HELLO_LEN - 1] {
            let mut bad = good.clone();
            bad[idx] ^= 0x01;
            assert!(
                ServerHello::decode_verified(&bad, &client.public, &root.public()).is_err(),
                "tamper at {idx} accepted"
            );
        }
    }

    #[test]
    fn test_server_hello_wrong_root_rejected() {
        let root = RootKeyPair::generate();
        let other_root = RootKeyPair::generate();
        let client = KeyPair::generate();
        let server = KeyPair::generate();

        let hello = ServerHello {
            server_pubkey: server.public.clone(),
            salt: random_bytes(),
            token: ConnectionToken::generate(),
        };
        let body = hello.encode_signed(&client.public, &root);

        assert!(
            ServerHello::decode_verified(&body, &client.public, &other_root.public()).is_err()
        );
    }

    #[test]
    fn test_server_hello_binds_client_key() {
        let root = RootKeyPair::generate();
        let client = KeyPair::generate();
        let other_client = KeyPair::generate();
        let server = KeyPair::generate();

        let hello = ServerHello {
            server_pubkey: server.public.clone(),
            salt: random_bytes(),
            token: ConnectionToken::generate(),
        };
        let body = hello.encode_signed(&client.public, &root);

        assert!(
            ServerHello::decode_verified(&body, &other_client.public, &root.public()).is_err()
        );
    }

    #[test]
    fn test_challenge_response_roundtrip() {
        let token = ConnectionToken::generate();
        let body = ChallengeResponse { token }.encode();
        assert_eq!(body.len(), TOKEN_LEN);
        assert_eq!(ChallengeResponse::decode(&body).unwrap().token, token);
    }
}
