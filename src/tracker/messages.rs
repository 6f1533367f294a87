//! Tracker wire messages
//!
//! Every tracker request is a `Message { command, payload }` and yields
//! exactly one reply: `ACK`, a named success variant, or `ERROR` with a
//! human-readable payload.

use crate::crypto::Fingerprint;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request commands accepted by the tracker.
pub const HANDSHAKE: &str = "HANDSHAKE";
pub const ANNOUNCE_FILE: &str = "ANNOUNCE_FILE";
pub const LIST_FILES: &str = "LIST_FILES";
pub const GET_PEERS_FOR_FILE: &str = "GET_PEERS_FOR_FILE";
pub const GET_PEER_INFO: &str = "GET_PEER_INFO";
pub const LIST_PEERS: &str = "LIST_PEERS";

/// Reply commands.
pub const ACK: &str = "ACK";
pub const ERROR: &str = "ERROR";
pub const WELCOME: &str = "WELCOME";
pub const FILE_LIST: &str = "FILE_LIST";
pub const PEER_LIST: &str = "PEER_LIST";
pub const PEER_INFO: &str = "PEER_INFO";
pub const PEER_LIST_ALL: &str = "PEER_LIST_ALL";

/// Envelope for every tracker request and reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    /// Message with no payload.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            payload: None,
        }
    }

    /// Message carrying a serialized payload.
    pub fn with_payload<T: Serialize>(command: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            command: command.to_string(),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// `ERROR` reply with a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            command: ERROR.to_string(),
            payload: Some(serde_json::Value::String(message.into())),
        }
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let value = self.payload.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value)
    }

    /// Human-readable form of an `ERROR` payload.
    pub fn error_text(&self) -> String {
        match &self.payload {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "unspecified tracker error".to_string(),
        }
    }
}

/// First (and only first) message on a tracker session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub name: String,
    pub listen_addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceFilePayload {
    pub fingerprint: Fingerprint,
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceAckPayload {
    pub file_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersForFilePayload {
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfoPayload {
    pub peer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_without_payload_omits_field() {
        let msg = Message::new(LIST_FILES);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"command":"LIST_FILES"}"#);

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command, LIST_FILES);
        assert!(back.payload.is_none());
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = AnnounceFilePayload {
            fingerprint: Fingerprint::hash(b"bytes"),
            filename: "bytes.bin".to_string(),
            size: 5,
        };
        let msg = Message::with_payload(ANNOUNCE_FILE, &payload).unwrap();

        let decoded: AnnounceFilePayload = msg.payload_as().unwrap();
        assert_eq!(decoded.fingerprint, payload.fingerprint);
        assert_eq!(decoded.filename, "bytes.bin");
    }

    #[test]
    fn test_error_text() {
        let msg = Message::error("no such file");
        assert_eq!(msg.command, ERROR);
        assert_eq!(msg.error_text(), "no such file");
    }
}
