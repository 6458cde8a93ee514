//! Command policy — which chat commands a satellite may run on the host.
//!
//! Classification is total: every tag maps to exactly forward or denied,
//! with denial reasons grouped by category. The payload is never inspected,
//! only the tag.

use serde_json::Value;

/// Why a command is refused over a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedCategory {
    /// Stopping or suspending the engine would kill the session itself.
    ProcessLifecycle,
    /// Storage import/export/erase and raw SQL stay on the host.
    StorageAdmin,
    /// Deleting or hiding users could orphan the satellite mid-session.
    Credentials,
    /// Network reconfiguration belongs to the host operator.
    Network,
    /// Push-token management is bound to the host platform.
    NotificationTokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Forward,
    Denied(DeniedCategory),
}

/// Classify a command tag.
pub fn classify(tag: &str) -> CommandClass {
    use CommandClass::Denied;
    use DeniedCategory::*;
    match tag {
        "apiStopChat" | "apiSuspendChat" | "apiActivateChat" => Denied(ProcessLifecycle),

        "apiExportArchive"
        | "apiImportArchive"
        | "apiDeleteStorage"
        | "apiStorageEncryption"
        | "apiExecChatStoreSql"
        | "apiExecAgentStoreSql"
        | "getSlowSqlQueries" => Denied(StorageAdmin),

        "apiDeleteUser" | "apiHideUser" | "apiUnhideUser" => Denied(Credentials),

        "apiSetNetworkConfig" | "reconnectAllServers" => Denied(Network),

        "apiRegisterToken" | "apiVerifyToken" | "apiDeleteToken" => Denied(NotificationTokens),

        _ => CommandClass::Forward,
    }
}

/// Commands whose effect must also be applied to the host's own chat view,
/// so both UIs stay consistent.
pub fn needs_host_mirror(tag: &str) -> bool {
    matches!(tag, "apiChatRead" | "apiChatItemReaction")
}

/// Extract the command tag from an opaque chat-command payload.
pub fn command_tag(cmd: &Value) -> Option<&str> {
    cmd.get("type").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DENIED: &[&str] = &[
        "apiStopChat",
        "apiSuspendChat",
        "apiActivateChat",
        "apiExportArchive",
        "apiImportArchive",
        "apiDeleteStorage",
        "apiStorageEncryption",
        "apiExecChatStoreSql",
        "apiExecAgentStoreSql",
        "getSlowSqlQueries",
        "apiDeleteUser",
        "apiHideUser",
        "apiUnhideUser",
        "apiSetNetworkConfig",
        "reconnectAllServers",
        "apiRegisterToken",
        "apiVerifyToken",
        "apiDeleteToken",
    ];

    #[test]
    fn denied_tags_are_denied() {
        for tag in DENIED {
            assert!(
                matches!(classify(tag), CommandClass::Denied(_)),
                "{tag} must be denied"
            );
        }
    }

    #[test]
    fn everything_else_forwards() {
        for tag in ["apiSendMessage", "apiChatRead", "apiGetChats", "showActiveUser", ""] {
            assert_eq!(classify(tag), CommandClass::Forward);
        }
    }

    #[test]
    fn classification_is_exhaustive_over_arbitrary_tags() {
        // Any tag lands in exactly one class; no panic, no third outcome.
        for tag in ["unknownFutureCommand", "apiStopChat", "x"] {
            match classify(tag) {
                CommandClass::Forward | CommandClass::Denied(_) => {}
            }
        }
    }

    #[test]
    fn mirror_tags() {
        assert!(needs_host_mirror("apiChatRead"));
        assert!(needs_host_mirror("apiChatItemReaction"));
        assert!(!needs_host_mirror("apiSendMessage"));
    }

    #[test]
    fn tag_extraction() {
        assert_eq!(command_tag(&json!({"type": "apiSendMessage"})), Some("apiSendMessage"));
        assert_eq!(command_tag(&json!({"body": 1})), None);
    }
}
