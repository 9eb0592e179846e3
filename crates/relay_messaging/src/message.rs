//! Wire envelopes: the JSON text frames exchanged between hubs.
//!
//! Two shapes travel over a connection:
//!
//! - handshake: `{"fromIdentity": "...", "type": "identity"}`
//! - application: `{"fromIdentity": "...", "to": "...", "message": <any>}`
//!
//! Other JSON is handed to subscribers as parsed. Text that is not JSON
//! at all surfaces as an "unknown" message carrying the raw frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `type` tag of a handshake frame.
pub const IDENTITY_TYPE: &str = "identity";

/// `type` tag reported for frames that are not valid envelopes.
pub const UNKNOWN_TYPE: &str = "unknown";

/// An addressed application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Identity of the sending hub.
    pub from_identity: String,
    /// Target identity as given by the sender (may be a short name).
    pub to: String,
    /// Opaque payload.
    pub message: Value,
}

impl Envelope {
    pub fn new(from_identity: impl Into<String>, to: impl Into<String>, message: Value) -> Self {
        Self {
            from_identity: from_identity.into(),
            to: to.into(),
            message,
        }
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFrame<'a> {
    from_identity: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// JSON text of the handshake frame announcing `identity`.
pub fn identity_frame(identity: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&IdentityFrame {
        from_identity: identity,
        kind: IDENTITY_TYPE,
    })
}

/// A message delivered to hub subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A well-formed application envelope.
    Envelope(Envelope),
    /// Valid JSON that is neither a handshake nor an envelope.
    Other(Value),
    /// A frame that is not JSON.
    Unknown { message: String },
}

impl InboundMessage {
    /// The envelope, if this is a well-formed application message.
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Envelope(envelope) => Some(envelope),
            Self::Other(_) | Self::Unknown { .. } => None,
        }
    }

    /// Render as the JSON object subscribers of the wire format expect.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Envelope(envelope) => serde_json::to_value(envelope).unwrap_or(Value::Null),
            Self::Other(value) => value.clone(),
            Self::Unknown { message } => serde_json::json!({
                "type": UNKNOWN_TYPE,
                "message": message,
            }),
        }
    }
}

/// A decoded incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The peer announced its identity.
    Identity(String),
    /// Anything destined for subscribers.
    Message(InboundMessage),
}

impl Frame {
    /// Decode a text frame. Never fails: non-JSON input becomes
    /// [`InboundMessage::Unknown`], and only an identity frame with a
    /// string `fromIdentity` counts as a handshake.
    pub fn parse(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Self::Message(InboundMessage::Unknown {
                message: text.to_string(),
            });
        };

        if value.get("type").and_then(Value::as_str) == Some(IDENTITY_TYPE) {
            if let Some(identity) = value.get("fromIdentity").and_then(Value::as_str) {
                return Self::Identity(identity.to_string());
            }
            return Self::Message(InboundMessage::Other(value));
        }

        match Envelope::deserialize(&value) {
            Ok(envelope) => Self::Message(InboundMessage::Envelope(envelope)),
            Err(_) => Self::Message(InboundMessage::Other(value)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
