//! Control message schema for the session handshake.
//!
//! Control messages travel as UTF-8 JSON inside control frames, tagged by a
//! `type` field. Credential material and connection-type arguments are opaque
//! to this crate: unrecognized object members are preserved verbatim so the
//! authenticator and handler factory can interpret them.

use serde::{Deserialize, Serialize};

/// Opaque JSON object members carried alongside a tagged message.
pub type OpaqueFields = serde_json::Map<String, serde_json::Value>;

/// A handshake control message.
///
/// The `auth` and `connectionType` variants flow client to server, `sign`
/// and `error` server to client, `disconnect` either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Credential material. Interpreted only by the authenticator.
    Auth {
        #[serde(flatten)]
        fields: OpaqueFields,
    },

    /// Challenge from the server, sent at handshake start and re-sent after
    /// each `auth`.
    Sign {
        /// Opaque challenge string.
        data: String,
    },

    /// The client's declaration of the payload channel kind. Terminal
    /// success message of the handshake.
    ConnectionType {
        /// Channel kind, e.g. `"terminal"`.
        value: String,
        #[serde(flatten)]
        fields: OpaqueFields,
    },

    /// Failure notice sent to the peer before a forced teardown.
    Error {
        /// Human-readable cause.
        reason: String,
    },

    /// Best-effort notice that the sender is terminating the logical
    /// session.
    Disconnect,
}

impl ControlMessage {
    /// Build a `sign` challenge message.
    pub fn sign(data: impl Into<String>) -> Self {
        ControlMessage::Sign { data: data.into() }
    }

    /// Build an `error` notice.
    pub fn error(reason: impl Into<String>) -> Self {
        ControlMessage::Error {
            reason: reason.into(),
        }
    }

    /// The wire value of this message's `type` tag.
    pub fn message_type(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::Sign { .. } => "sign",
            ControlMessage::ConnectionType { .. } => "connectionType",
            ControlMessage::Error { .. } => "error",
            ControlMessage::Disconnect => "disconnect",
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ============================================================================
// Raw-mode connect header
// ============================================================================

/// Options header sent as one newline-terminated JSON line by clients that
/// connect without a WebSocket upgrade. Framed clients supply the same
/// values as upgrade-request query parameters instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectHeader {
    /// Token correlating physical connections into one logical session.
    pub reconnection_token: String,
    /// True when resuming an existing session rather than starting fresh.
    #[serde(default)]
    pub reconnection: bool,
}

impl ConnectHeader {
    /// Parse a header line (trailing newline tolerated).
    pub fn from_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_serializes_tagged() {
        let msg = ControlMessage::sign("a1b2c3");
        let json = serde_json::to_string(&msg).expect("serialization failed");
        assert_eq!(json, r#"{"type":"sign","data":"a1b2c3"}"#);
    }

    #[test]
    fn test_disconnect_serializes_bare() {
        let json =
            serde_json::to_string(&ControlMessage::Disconnect).expect("serialization failed");
        assert_eq!(json, r#"{"type":"disconnect"}"#);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = ControlMessage::error("server shutting down");
        let bytes = msg.to_json().expect("serialization failed");
        let decoded = ControlMessage::from_json(&bytes).expect("deserialization failed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_connection_type_terminal() {
        let decoded = ControlMessage::from_json(br#"{"type":"connectionType","value":"terminal"}"#)
            .expect("deserialization failed");
        match decoded {
            ControlMessage::ConnectionType { value, fields } => {
                assert_eq!(value, "terminal");
                assert!(fields.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_connection_type_requires_value() {
        let result = ControlMessage::from_json(br#"{"type":"connectionType"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_connection_type_preserves_extra_fields() {
        let decoded = ControlMessage::from_json(
            br#"{"type":"connectionType","value":"tunnel","port":8080,"host":"localhost"}"#,
        )
        .expect("deserialization failed");
        match decoded {
            ControlMessage::ConnectionType { value, fields } => {
                assert_eq!(value, "tunnel");
                assert_eq!(fields.get("port"), Some(&serde_json::json!(8080)));
                assert_eq!(fields.get("host"), Some(&serde_json::json!("localhost")));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_auth_preserves_opaque_fields() {
        let decoded =
            ControlMessage::from_json(br#"{"type":"auth","user":"alice","secret":"hunter2"}"#)
                .expect("deserialization failed");
        let ControlMessage::Auth { fields } = &decoded else {
            panic!("unexpected message: {decoded:?}");
        };
        assert_eq!(fields.get("user"), Some(&serde_json::json!("alice")));

        // Opaque members survive a reserialize.
        let json = serde_json::to_string(&decoded).expect("serialization failed");
        assert!(json.contains(r#""type":"auth""#));
        assert!(json.contains(r#""secret":"hunter2""#));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ControlMessage::from_json(br#"{"type":"bogus"}"#).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(ControlMessage::from_json(b"not json at all").is_err());
    }

    #[test]
    fn test_missing_type_rejected() {
        assert!(ControlMessage::from_json(br#"{"value":"terminal"}"#).is_err());
    }

    #[test]
    fn test_message_type_matches_wire_tag() {
        let messages = [
            ControlMessage::Auth {
                fields: OpaqueFields::new(),
            },
            ControlMessage::sign("x"),
            ControlMessage::ConnectionType {
                value: "terminal".to_string(),
                fields: OpaqueFields::new(),
            },
            ControlMessage::error("x"),
            ControlMessage::Disconnect,
        ];
        for msg in &messages {
            let json: serde_json::Value =
                serde_json::from_slice(&msg.to_json().expect("serialization failed"))
                    .expect("reparse failed");
            assert_eq!(json["type"], msg.message_type());
        }
    }

    // Connect header tests

    #[test]
    fn test_connect_header_parses() {
        let header =
            ConnectHeader::from_line(br#"{"reconnectionToken":"tok-1","reconnection":true}"#)
                .expect("parse failed");
        assert_eq!(header.reconnection_token, "tok-1");
        assert!(header.reconnection);
    }

    #[test]
    fn test_connect_header_reconnection_defaults_false() {
        let header = ConnectHeader::from_line(br#"{"reconnectionToken":"tok-2"}"#)
            .expect("parse failed");
        assert!(!header.reconnection);
    }

    #[test]
    fn test_connect_header_requires_token() {
        assert!(ConnectHeader::from_line(br#"{"reconnection":true}"#).is_err());
    }

    #[test]
    fn test_connect_header_uses_camel_case() {
        let header = ConnectHeader {
            reconnection_token: "tok-3".to_string(),
            reconnection: false,
        };
        let json = serde_json::to_string(&header).expect("serialization failed");
        assert!(json.contains(r#""reconnectionToken":"tok-3""#));
    }
}
