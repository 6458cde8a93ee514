//! Pairing wire messages and controller-surfaced responses.
//!
//! These ride the normal channel as `cmd`/`reply`/`event` frames, tagged the
//! same way as chat-engine commands, so the router can pick them out of the
//! stream by tag and handle them locally instead of forwarding to the engine.

use serde::{Deserialize, Serialize};

/// Messages exchanged on the channel to drive pairing and session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PairingMsg {
    /// Satellite → Host. Carries the OOB token text the satellite generated;
    /// the host validates nonce/expiry and answers with an identity record.
    #[serde(rename_all = "camelCase")]
    SatRequestIdentity { identity: String },

    /// Host → Satellite. The pending identity, surfaced to the host UI for
    /// user approval in parallel.
    #[serde(rename_all = "camelCase")]
    SatIdentityRecord { sat_identity_id: i64, identity: String },

    /// Host UI decision, emitted onto the channel.
    #[serde(rename_all = "camelCase")]
    SatIdentityConfirm { sat_identity_id: i64 },

    #[serde(rename_all = "camelCase")]
    SatIdentityReject { sat_identity_id: i64 },

    /// Host → Satellite. The host's own UI wants the foreground; the
    /// satellite must stop issuing commands.
    SatTakeover,

    /// Host → Satellite. The host UI returned the foreground to the
    /// satellite; queued commands may flush again.
    #[serde(rename_all = "camelCase")]
    SatResumed { sat_identity_id: i64 },

    /// Satellite-initiated dispose. The device row stays `active`; only the
    /// channel is torn down.
    SatTerminateIdentity,

    /// Host-initiated dispose; additionally moves the device row to
    /// `revoked`.
    #[serde(rename_all = "camelCase")]
    SatIdentityDeregister { sat_identity_id: i64 },
}

impl PairingMsg {
    /// Tag as it appears on the wire — used by the router to recognise
    /// pairing traffic inside ordinary cmd frames.
    pub fn is_pairing_tag(tag: &str) -> bool {
        matches!(
            tag,
            "satRequestIdentity"
                | "satIdentityRecord"
                | "satIdentityConfirm"
                | "satIdentityReject"
                | "satTakeover"
                | "satResumed"
                | "satTerminateIdentity"
                | "satIdentityDeregister"
        )
    }
}

/// Where a satellite identity stands in its lifecycle — mirrors the pairing
/// wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityStatus {
    Requested,
    Recorded,
    Confirmed,
    Rejected,
    TookOver,
    Disposed,
}

/// Responses the controller emits on the chat output queue so both UIs can
/// follow the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SatEvent {
    #[serde(rename_all = "camelCase")]
    SatRequestIdentity { identity: String },

    #[serde(rename_all = "camelCase")]
    SatIdentityRecord { sat_identity_id: i64, identity: String },

    #[serde(rename_all = "camelCase")]
    SatIdentityConfirmed { sat_identity_id: i64 },

    #[serde(rename_all = "camelCase")]
    SatIdentityRejected { sat_identity_id: i64 },

    #[serde(rename_all = "camelCase")]
    SatTookOver { sat_identity_id: i64 },

    #[serde(rename_all = "camelCase")]
    SatIdentityDisposed { sat_identity_id: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tags_are_camel_case() {
        let msg = PairingMsg::SatRequestIdentity { identity: "rp1:AAAA".into() };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "satRequestIdentity", "identity": "rp1:AAAA"})
        );

        let msg = PairingMsg::SatIdentityConfirm { sat_identity_id: 7 };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "satIdentityConfirm", "satIdentityId": 7})
        );
    }

    #[test]
    fn pairing_tags_are_recognised() {
        assert!(PairingMsg::is_pairing_tag("satTakeover"));
        assert!(PairingMsg::is_pairing_tag("satTerminateIdentity"));
        assert!(!PairingMsg::is_pairing_tag("apiSendMessage"));
    }

    #[test]
    fn event_wire_shape() {
        let ev = SatEvent::SatTookOver { sat_identity_id: 7 };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "satTookOver", "satIdentityId": 7})
        );
    }
}
