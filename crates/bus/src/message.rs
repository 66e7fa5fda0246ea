use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire unit on the bus. `done == true` is a stream terminator: after it is
/// published no further messages should be expected on the topic, though
/// late subscribers may still drain earlier cached messages first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub done: bool,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            done: false,
            timestamp: Utc::now(),
        }
    }

    /// Stream terminator.
    pub fn done() -> Self {
        Self {
            payload: serde_json::Value::Null,
            done: true,
            timestamp: Utc::now(),
        }
    }
}

/// Typed packet handed to consumers by the channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportPacket {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub done: bool,
}

impl From<BusMessage> for TransportPacket {
    fn from(msg: BusMessage) -> Self {
        Self {
            payload: msg.payload,
            done: msg.done,
        }
    }
}
