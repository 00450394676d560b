// Decoded form of one broker datagram. Lives only for the duration of dispatch.
use crate::Result;
use bytes::Bytes;
use courier_broker::BrokerMessage;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: String,
    pub raw: Bytes,
    pub payload: Value,
}

impl Envelope {
    /// Parse `raw` as JSON; anything that does not parse is kept as a JSON string.
    pub fn decode(channel: impl Into<String>, raw: Bytes) -> Self {
        let payload = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(_) => Value::String(String::from_utf8_lossy(&raw).into_owned()),
        };
        Self {
            channel: channel.into(),
            raw,
            payload,
        }
    }

    pub fn from_message(message: BrokerMessage) -> Self {
        Self::decode(message.channel, message.payload)
    }
}

/// Broker wire form of an outgoing payload: strings go out verbatim, everything
/// else as compact JSON.
pub fn encode_payload(payload: &Value) -> Result<Bytes> {
    match payload {
        Value::String(text) => Ok(Bytes::from(text.clone())),
        other => Ok(Bytes::from(serde_json::to_vec(other)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_payload_is_structured() {
        let envelope = Envelope::decode("room.5", Bytes::from_static(br#"{"type":"ping"}"#));
        assert_eq!(envelope.payload, json!({"type": "ping"}));
        assert_eq!(envelope.channel, "room.5");
    }

    #[test]
    fn malformed_payload_passes_through_as_string() {
        let envelope = Envelope::decode("c", Bytes::from_static(b"{not json"));
        assert_eq!(envelope.payload, Value::String("{not json".into()));
        assert_eq!(envelope.raw, Bytes::from_static(b"{not json"));
    }

    #[test]
    fn strings_are_published_raw() {
        let raw = encode_payload(&json!("hello")).expect("encode");
        assert_eq!(raw, Bytes::from_static(b"hello"));
        let raw = encode_payload(&json!({"n": 1})).expect("encode");
        assert_eq!(raw, Bytes::from_static(br#"{"n":1}"#));
    }
}
