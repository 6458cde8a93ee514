//! Channel frames — every record on the secure channel is one of these.
//!
//! Wire shape (JSON, inside the encrypted record):
//!   { "k":"cmd",   "id":<u64>, "cmd": <chat-command-json> }
//!   { "k":"reply", "id":<u64>, "resp": <chat-response-json> }
//!   { "k":"event", "resp": <chat-response-json> }
//!   { "k":"ping" } / { "k":"pong" } / { "k":"bye", "reason": <string> }
//!
//! `id` is the correlation id: present on cmd/reply, absent on events and
//! control frames. Payloads stay opaque JSON — the router inspects only the
//! command tag, never the body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k", rename_all = "lowercase")]
pub enum Frame {
    Cmd { id: u64, cmd: Value },
    Reply { id: u64, resp: Value },
    Event { resp: Value },
    Ping,
    Pong,
    Bye { reason: String },
}

impl Frame {
    /// Correlation id, for the two frame kinds that carry one.
    pub fn corr_id(&self) -> Option<u64> {
        match self {
            Frame::Cmd { id, .. } | Frame::Reply { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Control frames keep the channel alive but carry no session payload.
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Ping | Frame::Pong | Frame::Bye { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cmd_wire_shape() {
        let frame = Frame::Cmd { id: 42, cmd: json!({"type": "apiSendMessage"}) };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire, json!({"k": "cmd", "id": 42, "cmd": {"type": "apiSendMessage"}}));
    }

    #[test]
    fn control_wire_shape() {
        assert_eq!(serde_json::to_value(Frame::Ping).unwrap(), json!({"k": "ping"}));
        let bye = Frame::Bye { reason: "takeover".into() };
        assert_eq!(
            serde_json::to_value(bye).unwrap(),
            json!({"k": "bye", "reason": "takeover"})
        );
    }

    #[test]
    fn event_has_no_corr_id() {
        let frame = Frame::Event { resp: json!({"type": "newChatItem"}) };
        assert_eq!(frame.corr_id(), None);
        let frame: Frame =
            serde_json::from_value(json!({"k": "event", "resp": {"type": "x"}})).unwrap();
        assert!(!frame.is_control());
    }
}
