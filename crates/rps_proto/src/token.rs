//! Out-of-band pairing token.
//!
//! A single-line URL-safe string, typically rendered as a QR code:
//!
//!   rp1:<base64url(json payload)>
//!
//! Payload: { v:1, satPub, hostHint, addr?, nonce, expiresAt }
//!
//! Tokens are single-use. The host records each consumed nonce and rejects
//! replays inside a sliding window (see the discovery layer); `expiresAt`
//! bounds the pairing deadline from the moment of generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use rps_crypto::identity::PublicKeyBytes;

use crate::codec::ProtoError;

pub const TOKEN_PREFIX: &str = "rp1:";
pub const TOKEN_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingToken {
    pub v: u8,
    /// Satellite's long-lived device public key (base64url).
    pub sat_pub: String,
    /// Which host this token is meant for — free text shown during approval.
    pub host_hint: String,
    /// Network endpoint, meaning depends on the discovery mode: the
    /// satellite's listening address, or a rendezvous address. Absent in
    /// host-listens mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    /// Random 16-byte nonce (base64url) — single-use marker, also bound
    /// into the handshake transcript.
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

impl PairingToken {
    pub fn generate(
        sat_pub: &PublicKeyBytes,
        host_hint: &str,
        addr: Option<String>,
        ttl: Duration,
    ) -> Self {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Self {
            v: TOKEN_VERSION,
            sat_pub: sat_pub.to_b64(),
            host_hint: host_hint.to_string(),
            addr,
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("token payload always serializes");
        format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(s: &str) -> Result<Self, ProtoError> {
        let body = s
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| ProtoError::TokenFormat("missing rp1: prefix".into()))?;
        let bytes = URL_SAFE_NO_PAD.decode(body.trim())?;
        let token: PairingToken = serde_json::from_slice(&bytes)
            .map_err(|e| ProtoError::TokenFormat(e.to_string()))?;
        if token.v != TOKEN_VERSION {
            return Err(ProtoError::TokenFormat(format!(
                "unsupported token version {}",
                token.v
            )));
        }
        Ok(token)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn sat_public_key(&self) -> Result<PublicKeyBytes, ProtoError> {
        PublicKeyBytes::from_b64(&self.sat_pub)
            .map_err(|e| ProtoError::TokenFormat(e.to_string()))
    }

    pub fn nonce_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.nonce)?)
    }
}
