//! The CLI ↔ daemon request/response envelope.
//!
//! A request names a dot-namespaced command (`session.open`, `cell.set`,
//! `table.append`, ...), optionally a session token, and an arbitrary JSON
//! args object. The response carries `success` plus either a
//! command-specific `result` or an `error_message`, never both.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single request from a CLI process to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Dot-namespaced command, e.g. `session.open` or `table.append`.
    pub command: String,
    /// Session token. Absent for session-creating and daemon-level commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Command-specific arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Caller-supplied bound for the operation, in milliseconds. The daemon
    /// falls back to its configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Request {
    /// A command with no session and no args (e.g. `daemon.ping`).
    pub fn bare(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            session_id: None,
            args: None,
            timeout_ms: None,
        }
    }

    /// A session-scoped command.
    pub fn scoped(command: impl Into<String>, session_id: impl Into<String>, args: Value) -> Self {
        Self {
            command: command.into(),
            session_id: Some(session_id.into()),
            args: Some(args),
            timeout_ms: None,
        }
    }
}

/// The daemon's reply to one [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    /// Present on success when the command produced data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present iff `!success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_message: None,
        }
    }

    /// Success with no payload.
    pub fn ok_empty() -> Self {
        Self {
            success: true,
            result: None,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error_message: Some(message.into()),
        }
    }
}

/// Built-in daemon command names. Feature commands (`cell.*`, `sheet.*`,
/// `table.*`, `workbook.*`) are registered by the dispatch layer and are
/// deliberately not enumerated here.
pub mod commands {
    pub const SESSION_OPEN: &str = "session.open";
    pub const SESSION_CLOSE: &str = "session.close";
    pub const SESSION_LIST: &str = "session.list";
    pub const WORKBOOK_SAVE: &str = "workbook.save";
    pub const DAEMON_PING: &str = "daemon.ping";
    pub const DAEMON_SHUTDOWN: &str = "daemon.shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_roundtrip_with_args() {
        let req = Request::scoped("cell.set", "abc123", json!({"cell": "A1", "value": 42.0}));
        let wire = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.command, "cell.set");
        assert_eq!(back.session_id.as_deref(), Some("abc123"));
        assert_eq!(back.args.unwrap()["cell"], "A1");
    }

    #[test]
    fn bare_request_omits_optional_fields() {
        let wire = serde_json::to_string(&Request::bare("daemon.ping")).unwrap();
        assert_eq!(wire, r#"{"command":"daemon.ping"}"#);
    }

    #[test]
    fn error_response_shape() {
        let wire = serde_json::to_string(&Response::error("unknown session")).unwrap();
        let back: Response = serde_json::from_str(&wire).unwrap();
        assert!(!back.success);
        assert_eq!(back.error_message.as_deref(), Some("unknown session"));
        assert!(back.result.is_none());
    }

    #[test]
    fn missing_optional_fields_parse_as_none() {
        let back: Request = serde_json::from_str(r#"{"command":"session.list"}"#).unwrap();
        assert!(back.session_id.is_none());
        assert!(back.args.is_none());
    }
}
