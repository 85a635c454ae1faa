use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names inbound frames are republished under.
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_REGISTERED: &str = "registered";
pub const EVENT_MESSAGE_SENT: &str = "messageSent";
pub const EVENT_MESSAGE_ERROR: &str = "messageError";

/// Frames this client sends to the relay, JSON-encoded as
/// `{"type": ..., "data": ...}` (keepalive pings carry a bare timestamp).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "register")]
    Register { data: RegisterData },
    #[serde(rename = "message")]
    Message { data: MessageData },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RegisterData {
    pub address: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MessageData {
    pub from: String,
    pub to: String,
    pub text: String,
}

impl OutboundFrame {
    pub fn register(address: &str) -> OutboundFrame {
        OutboundFrame::Register {
            data: RegisterData {
                address: address.to_string(),
            },
        }
    }

    pub fn message(from: &str, to: &str, text: &str) -> OutboundFrame {
        OutboundFrame::Message {
            data: MessageData {
                from: from.to_string(),
                to: to.to_string(),
                text: text.to_string(),
            },
        }
    }

    pub fn ping(timestamp: u64) -> OutboundFrame {
        OutboundFrame::Ping { timestamp }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("outbound frames serialize to json")
    }
}

/// An application-level inbound `message` payload. The wire carries
/// seconds-since-epoch; conversion to milliseconds happens at the store
/// bridge.
#[derive(Deserialize, Debug, Clone)]
pub struct InboundMessage {
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: u64,
}

/// Splits an inbound frame into its `(type, payload)` pair for dispatch.
/// Returns `None` for anything malformed; the session drops those.
pub fn decode_frame(raw: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let kind = value.get("type")?.as_str()?.to_string();
    let payload = value.get("data").cloned().unwrap_or(Value::Null);
    Some((kind, payload))
}
