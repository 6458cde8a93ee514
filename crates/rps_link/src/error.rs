//! The satellite error umbrella.
//!
//! Every failure this subsystem surfaces to the chat engine's clients is one
//! of these kinds, serialised as a `chatErrorSatellite` response so callers
//! can distinguish it from the store/agent/database error families.

use serde_json::json;
use thiserror::Error;

use rps_crypto::CryptoError;
use rps_proto::{Frame, ProtoError};
use rps_store::StoreError;

use crate::session::SessionPhase;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Pairing token expired")]
    PairingExpired,

    #[error("Pairing token already used")]
    PairingReplay,

    #[error("Handshake rejected: {0}")]
    HandshakeReject(String),

    #[error("Peer authentication failed")]
    AuthFail,

    #[error("Record replay detected")]
    ReplayDetected,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Command `{tag}` is not permitted over a remote session")]
    DeniedCommand { tag: String },

    #[error("Command timed out")]
    Timeout,

    #[error("Session is suspended")]
    SessionSuspended,

    #[error("Session is disposed")]
    SessionDisposed,

    #[error("Unknown remote device")]
    DeviceUnknown,

    #[error("Remote device is revoked")]
    DeviceRevoked,

    #[error("Channel broken")]
    ChannelBroken,

    #[error("Channel closed")]
    Closed,

    #[error("Illegal session transition {from} -> {to}")]
    IllegalTransition { from: SessionPhase, to: SessionPhase },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Stable kind tag used in error replies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::PairingExpired => "pairingExpired",
            LinkError::PairingReplay => "pairingReplay",
            LinkError::HandshakeReject(_) => "handshakeReject",
            LinkError::AuthFail => "authFail",
            LinkError::ReplayDetected => "replayDetected",
            LinkError::FrameTooLarge { .. } => "frameTooLarge",
            LinkError::DecodeError(_) => "decodeError",
            LinkError::DeniedCommand { .. } => "deniedCommand",
            LinkError::Timeout => "timeout",
            LinkError::SessionSuspended => "sessionSuspended",
            LinkError::SessionDisposed => "sessionDisposed",
            LinkError::DeviceUnknown => "deviceUnknown",
            LinkError::DeviceRevoked => "deviceRevoked",
            LinkError::ChannelBroken => "channelBroken",
            LinkError::Closed => "closed",
            LinkError::IllegalTransition { .. } => "illegalTransition",
            LinkError::Store(_) => "store",
            LinkError::Io(_) => "io",
        }
    }

    /// Render as an error reply frame echoing the offending correlation id.
    pub fn to_reply(&self, id: u64) -> Frame {
        Frame::Reply {
            id,
            resp: json!({
                "type": "chatErrorSatellite",
                "kind": self.kind(),
                "message": self.to_string(),
            }),
        }
    }

    /// Channel-fatal errors force the session to Suspended and a reconnect
    /// that re-authenticates from long-lived keys.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::AuthFail
                | LinkError::ReplayDetected
                | LinkError::FrameTooLarge { .. }
                | LinkError::DecodeError(_)
        )
    }
}

impl From<CryptoError> for LinkError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::CounterRegression { .. } => LinkError::ReplayDetected,
            CryptoError::RecordOpen | CryptoError::SignatureVerification => LinkError::AuthFail,
            CryptoError::RecordTruncated(_) => LinkError::DecodeError(e.to_string()),
            CryptoError::Base64Decode(_) => LinkError::DecodeError(e.to_string()),
            CryptoError::InvalidKey(m) => LinkError::HandshakeReject(m),
            CryptoError::RecordSeal
            | CryptoError::CounterExhausted
            | CryptoError::KeyDerivation(_) => LinkError::ChannelBroken,
        }
    }
}

impl From<ProtoError> for LinkError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::FrameTooLarge { size, max } => LinkError::FrameTooLarge { size, max },
            ProtoError::TokenExpired => LinkError::PairingExpired,
            ProtoError::Decode(m) | ProtoError::TokenFormat(m) => LinkError::DecodeError(m),
            ProtoError::Serialisation(e) => LinkError::DecodeError(e.to_string()),
            ProtoError::Base64Decode(e) => LinkError::DecodeError(e.to_string()),
        }
    }
}

impl From<StoreError> for LinkError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DeviceRevoked(_) => LinkError::DeviceRevoked,
            other => LinkError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_carries_kind_and_corr_id() {
        let err = LinkError::DeniedCommand { tag: "apiDeleteStorage".into() };
        match err.to_reply(1) {
            Frame::Reply { id, resp } => {
                assert_eq!(id, 1);
                assert_eq!(resp["type"], "chatErrorSatellite");
                assert_eq!(resp["kind"], "deniedCommand");
            }
            other => panic!("expected reply frame, got {other:?}"),
        }
    }

    #[test]
    fn counter_regression_maps_to_replay() {
        let e: LinkError = CryptoError::CounterRegression { last: 4, got: 2 }.into();
        assert!(matches!(e, LinkError::ReplayDetected));
        assert!(e.is_channel_fatal());
    }
}
