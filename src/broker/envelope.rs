//! Cross-thread message envelopes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::{BrokerError, Role};

/// Buffer whose ownership moves to the receiving thread.
pub type Transferable = Vec<u8>;

/// Envelope kind, tagging both the direction and purpose of a message.
#[derive(Serialize, Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    MainSend,
    MainReply,
    WorkerSend,
    WorkerReply,
}

impl Kind {
    /// Kind used for calls originating from `role`.
    pub fn send(role: Role) -> Self {
        match role {
            Role::Main => Self::MainSend,
            Role::Worker(_) => Self::WorkerSend,
        }
    }

    /// Kind used for replies originating from `role`.
    pub fn reply(role: Role) -> Self {
        match role {
            Role::Main => Self::MainReply,
            Role::Worker(_) => Self::WorkerReply,
        }
    }

    /// Check if the envelope was sent by the other side of `role`.
    pub fn addressed_to(self, role: Role) -> bool {
        match role {
            Role::Main => matches!(self, Self::WorkerSend | Self::WorkerReply),
            Role::Worker(_) => matches!(self, Self::MainSend | Self::MainReply),
        }
    }

    pub fn is_reply(self) -> bool {
        matches!(self, Self::MainReply | Self::WorkerReply)
    }
}

/// Message envelope shared by calls and replies in both directions.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(rename = "message_id")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub transferables: Vec<Transferable>,
}

impl Envelope {
    pub fn call(role: Role, id: u64, method: &str, payload: Payload) -> Self {
        Self {
            kind: Kind::send(role),
            method: Some(method.into()),
            message: payload.value,
            transferables: payload.transferables,
            error: None,
            id,
        }
    }

    pub fn reply(role: Role, id: u64, result: Result<Payload, String>) -> Self {
        let (payload, error) = match result {
            Ok(payload) => (payload, None),
            Err(error) => (Payload::default(), Some(error)),
        };

        Self {
            kind: Kind::reply(role),
            message: payload.value,
            transferables: payload.transferables,
            method: None,
            error,
            id,
        }
    }

    /// Split the envelope into its payload.
    pub fn into_payload(self) -> Payload {
        Payload { value: self.message, transferables: self.transferables }
    }
}

/// Wire representation of an envelope.
#[derive(Debug)]
pub enum Packet {
    Envelope(Envelope),
    /// Envelope serialized as a JSON string, with its buffers carried alongside.
    Json(String, Vec<Transferable>),
}

impl Packet {
    /// Wrap an envelope, optionally serializing it to a string.
    pub fn new(mut envelope: Envelope, stringify: bool) -> Result<Self, BrokerError> {
        if !stringify {
            return Ok(Self::Envelope(envelope));
        }

        let transferables = std::mem::take(&mut envelope.transferables);
        let json = serde_json::to_string(&envelope)
            .map_err(|err| BrokerError::Malformed(err.to_string()))?;
        Ok(Self::Json(json, transferables))
    }

    /// Recover the structured envelope.
    pub fn into_envelope(self) -> Result<Envelope, BrokerError> {
        match self {
            Self::Envelope(envelope) => Ok(envelope),
            Self::Json(json, transferables) => {
                let mut envelope: Envelope = serde_json::from_str(&json)
                    .map_err(|err| BrokerError::Malformed(err.to_string()))?;
                envelope.transferables = transferables;
                Ok(envelope)
            },
        }
    }
}

/// Structured message payload with optional transferable buffers.
#[derive(PartialEq, Clone, Default, Debug)]
pub struct Payload {
    pub value: Value,
    pub transferables: Vec<Transferable>,
}

impl Payload {
    pub fn new(value: impl Into<Value>) -> Self {
        Self { value: value.into(), transferables: Default::default() }
    }

    /// Create a payload that hands ownership of `transferables` to the receiver.
    pub fn with_transferables(value: impl Into<Value>, transferables: Vec<Transferable>) -> Self {
        Self { value: value.into(), transferables }
    }

    /// Deserialize one positional call argument.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, BrokerError> {
        let value = self.value.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|err| BrokerError::InvalidArgument(index, err.to_string()))
    }

    /// Deserialize the entire payload value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        serde_json::from_value(self.value.clone())
            .map_err(|err| BrokerError::Malformed(err.to_string()))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::broker::WorkerId;

    #[test]
    fn envelope_wire_format() {
        let envelope = Envelope::call(Role::Main, 7, "self.square", Payload::new(json!([5])));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            json!({ "type": "main_send", "message_id": 7, "method": "self.square", "message": [5] })
        );

        let reply = Envelope::reply(Role::Worker(WorkerId(0)), 7, Err("broken".into()));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            json,
            json!({ "type": "worker_reply", "message_id": 7, "message": null, "error": "broken" })
        );
    }

    #[test]
    fn stringified_packet_keeps_transferables() {
        let payload = Payload::with_transferables(json!({ "mesh": 0 }), vec![vec![1, 2, 3]]);
        let envelope = Envelope::call(Role::Worker(WorkerId(1)), 3, "tiles.mesh", payload);

        let packet = Packet::new(envelope.clone(), true).unwrap();
        assert!(matches!(packet, Packet::Json(..)));
        assert_eq!(packet.into_envelope().unwrap(), envelope);
    }

    #[test]
    fn addressed_kinds() {
        let worker = Role::Worker(WorkerId(0));
        assert!(Kind::MainSend.addressed_to(worker));
        assert!(Kind::MainReply.addressed_to(worker));
        assert!(!Kind::WorkerSend.addressed_to(worker));
        assert!(Kind::WorkerReply.addressed_to(Role::Main));
        assert!(!Kind::MainReply.addressed_to(Role::Main));
    }

    #[test]
    fn positional_arguments() {
        let payload = Payload::new(json!([4, "tile"]));
        assert_eq!(payload.arg::<u32>(0).unwrap(), 4);
        assert_eq!(payload.arg::<String>(1).unwrap(), "tile");
        assert!(matches!(payload.arg::<u32>(1), Err(BrokerError::InvalidArgument(1, _))));
    }
}
