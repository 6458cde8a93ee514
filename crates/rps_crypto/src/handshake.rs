//! Connection handshake: ephemeral X25519 agreement with signed ephemerals.
//!
//! Both peers generate a fresh X25519 keypair per connection and sign the
//! public half (plus the pairing nonce) with their long-lived binding key.
//! The DH output, salted with the nonce and bound to both ephemerals, yields
//! the session root; per-direction record keys come off the root with fixed
//! labels. Reconnects run the same flow — the long-lived keys alone
//! authenticate, and the fresh DH gives a new root every time.
//!
//! Signature transcript:
//!   "rps-handshake-v1" || role byte || ephemeral public || nonce
//!
//! Key schedule:
//!   root     = HKDF(ikm = DH, salt = nonce, info = "rps-root-v1" || eph_host || eph_sat)
//!   host→sat = HKDF(root, "rps-host-to-sat")
//!   sat→host = HKDF(root, "rps-sat-to-host")

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{BindingKeyPair, PublicKeyBytes},
    kdf,
    record::RecordKey,
};

const TRANSCRIPT_LABEL: &[u8] = b"rps-handshake-v1";
const ROOT_INFO: &[u8] = b"rps-root-v1";
const HOST_TO_SAT: &[u8] = b"rps-host-to-sat";
const SAT_TO_HOST: &[u8] = b"rps-sat-to-host";

/// Which end of the link this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Satellite,
}

impl Role {
    fn transcript_byte(self) -> u8 {
        match self {
            Role::Host => 0x48,      // 'H'
            Role::Satellite => 0x53, // 'S'
        }
    }
}

/// Fresh per-connection X25519 keypair. The secret is consumed by the DH.
pub struct EphemeralKeys {
    secret: EphemeralSecret,
    pub public: X25519Public,
}

impl EphemeralKeys {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

fn transcript(role: Role, eph_pub: &[u8; 32], nonce: &[u8]) -> Vec<u8> {
    let mut t = Vec::with_capacity(TRANSCRIPT_LABEL.len() + 1 + 32 + nonce.len());
    t.extend_from_slice(TRANSCRIPT_LABEL);
    t.push(role.transcript_byte());
    t.extend_from_slice(eph_pub);
    t.extend_from_slice(nonce);
    t
}

/// Sign our ephemeral public half with the long-lived binding key.
pub fn sign_ephemeral(
    identity: &BindingKeyPair,
    role: Role,
    eph_pub: &[u8; 32],
    nonce: &[u8],
) -> Vec<u8> {
    identity.sign(&transcript(role, eph_pub, nonce))
}

/// Verify the peer's signature over its ephemeral half.
pub fn verify_ephemeral(
    identity_pub: &PublicKeyBytes,
    role: Role,
    eph_pub: &[u8; 32],
    nonce: &[u8],
    sig: &[u8],
) -> Result<(), CryptoError> {
    BindingKeyPair::verify(&identity_pub.0, &transcript(role, eph_pub, nonce), sig)
}

/// Per-direction record keys, from this peer's point of view.
pub struct TransportKeys {
    pub send: RecordKey,
    pub recv: RecordKey,
}

/// Complete the agreement: consume our ephemeral secret, mix in the peer's
/// ephemeral, and derive both direction keys oriented for `role`.
pub fn derive_transport_keys(
    role: Role,
    ours: EphemeralKeys,
    peer_pub: &[u8; 32],
    nonce: &[u8],
) -> Result<TransportKeys, CryptoError> {
    let peer = X25519Public::from(*peer_pub);
    let shared = ours.secret.diffie_hellman(&peer);

    // Bind the root to both ephemerals in a fixed order (host first).
    let our_pub = ours.public.to_bytes();
    let (eph_host, eph_sat) = match role {
        Role::Host => (&our_pub, peer_pub),
        Role::Satellite => (peer_pub, &our_pub),
    };
    let mut info = Vec::with_capacity(ROOT_INFO.len() + 64);
    info.extend_from_slice(ROOT_INFO);
    info.extend_from_slice(eph_host);
    info.extend_from_slice(eph_sat);

    let mut root = [0u8; 32];
    kdf::hkdf_expand(shared.as_bytes(), Some(nonce), &info, &mut root)?;

    let h2s = kdf::derive_subkey(&root, HOST_TO_SAT)?;
    let s2h = kdf::derive_subkey(&root, SAT_TO_HOST)?;
    root.zeroize();

    let (send, recv) = match role {
        Role::Host => (h2s, s2h),
        Role::Satellite => (s2h, h2s),
    };
    Ok(TransportKeys {
        send: RecordKey::new(send),
        recv: RecordKey::new(recv),
    })
}
