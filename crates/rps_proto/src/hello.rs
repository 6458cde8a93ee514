//! Plaintext handshake messages.
//!
//! The first record each peer writes on a fresh TCP connection is a `Hello`
//! carrying its long-lived public key, a fresh X25519 ephemeral, and an
//! Ed25519 signature over the handshake transcript (label, role, ephemeral,
//! nonce). Everything after the two hellos is encrypted under the derived
//! record keys.
//!
//! On first pairing the host does not yet know the satellite's long-lived
//! key; the token's `satPub` vouches for it until the user confirms. On
//! reconnect both sides check the peer key against the registry pin.

use serde::{Deserialize, Serialize};

use rps_crypto::{
    error::CryptoError,
    handshake::{self, EphemeralKeys, Role},
    identity::{BindingKeyPair, PublicKeyBytes},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

pub const HELLO_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelloRole {
    Host,
    Satellite,
}

impl From<HelloRole> for Role {
    fn from(r: HelloRole) -> Role {
        match r {
            HelloRole::Host => Role::Host,
            HelloRole::Satellite => Role::Satellite,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub v: u8,
    pub role: HelloRole,
    /// Long-lived Ed25519 binding key (base64url).
    pub identity_pub: String,
    /// Fresh X25519 ephemeral (base64url).
    pub eph_pub: String,
    /// Ed25519 signature over the handshake transcript (base64url).
    pub sig: String,
    /// Echo of the pairing-token nonce this connection answers.
    pub nonce: String,
}

impl Hello {
    /// Build and sign a hello for this side of the connection.
    pub fn build(
        role: HelloRole,
        identity: &BindingKeyPair,
        eph: &EphemeralKeys,
        nonce: &[u8],
    ) -> Self {
        let eph_pub = eph.public_bytes();
        let sig = handshake::sign_ephemeral(identity, role.into(), &eph_pub, nonce);
        Self {
            v: HELLO_VERSION,
            role,
            identity_pub: identity.public_b64(),
            eph_pub: URL_SAFE_NO_PAD.encode(eph_pub),
            sig: URL_SAFE_NO_PAD.encode(sig),
            nonce: URL_SAFE_NO_PAD.encode(nonce),
        }
    }

    /// Verify the signature and return (identity key, ephemeral public).
    pub fn verify(&self, expected_role: HelloRole) -> Result<(PublicKeyBytes, [u8; 32]), CryptoError> {
        if self.role != expected_role {
            return Err(CryptoError::InvalidKey("unexpected handshake role".into()));
        }
        let identity = PublicKeyBytes::from_b64(&self.identity_pub)?;
        let eph_bytes = URL_SAFE_NO_PAD.decode(&self.eph_pub)?;
        let eph_pub: [u8; 32] = eph_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ephemeral must be 32 bytes".into()))?;
        let sig = URL_SAFE_NO_PAD.decode(&self.sig)?;
        let nonce = URL_SAFE_NO_PAD.decode(&self.nonce)?;
        handshake::verify_ephemeral(&identity, self.role.into(), &eph_pub, &nonce, &sig)?;
        Ok((identity, eph_pub))
    }

    pub fn nonce_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.nonce)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_own_signature() {
        let identity = BindingKeyPair::generate();
        let eph = EphemeralKeys::generate();
        let hello = Hello::build(HelloRole::Satellite, &identity, &eph, b"nonce");
        let (key, eph_pub) = hello.verify(HelloRole::Satellite).unwrap();
        assert_eq!(key, identity.public);
        assert_eq!(eph_pub, eph.public_bytes());
    }

    #[test]
    fn verify_rejects_role_mismatch() {
        let identity = BindingKeyPair::generate();
        let eph = EphemeralKeys::generate();
        let hello = Hello::build(HelloRole::Satellite, &identity, &eph, b"nonce");
        assert!(hello.verify(HelloRole::Host).is_err());
    }

    #[test]
    fn verify_rejects_swapped_identity() {
        let identity = BindingKeyPair::generate();
        let eph = EphemeralKeys::generate();
        let mut hello = Hello::build(HelloRole::Host, &identity, &eph, b"nonce");
        hello.identity_pub = BindingKeyPair::generate().public_b64();
        assert!(hello.verify(HelloRole::Host).is_err());
    }
}
