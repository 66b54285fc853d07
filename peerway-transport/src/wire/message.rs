use anyhow::Context;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// The opaque application payload of a data frame.
///
/// The transport never interprets `method` or `params`; they are carried
/// verbatim to the remote handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl MessagePayload {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Serialized size, as counted against the per-message size cap.
    pub fn encoded_len(&self) -> anyhow::Result<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// One frame on the wire.
///
/// `seq == 0` marks a frame with no data payload (a pure acknowledgment).
/// Data frames carry `seq >= 1` plus the payload, and piggyback the highest
/// contiguous sequence received from the remote in `ack` (absent while
/// nothing has been received yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub payload: Option<MessagePayload>,
}

impl WireMessage {
    pub fn data(seq: u64, ack: Option<u64>, payload: MessagePayload) -> Self {
        Self {
            seq,
            ack,
            payload: Some(payload),
        }
    }

    pub fn pure_ack(ack: u64) -> Self {
        Self {
            seq: 0,
            ack: Some(ack),
            payload: None,
        }
    }

    pub fn is_data(&self) -> bool {
        self.seq > 0
    }

    pub fn encode(&self) -> anyhow::Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn decode(frame: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(frame).context("malformed wire message")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_frame_roundtrip() {
        let msg = WireMessage::data(
            7,
            Some(3),
            MessagePayload::new("deliver", vec![json!(1), json!("x")]),
        );
        let encoded = msg.encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn absent_ack_is_omitted() {
        let msg = WireMessage::data(1, None, MessagePayload::new("deliver", vec![]));
        let text = String::from_utf8(msg.encode().unwrap().to_vec()).unwrap();
        assert!(!text.contains("ack"), "unexpected ack field in {text}");
        let decoded = WireMessage::decode(text.as_bytes()).unwrap();
        assert_eq!(decoded.ack, None);
    }

    #[test]
    fn pure_ack_has_no_payload() {
        let encoded = WireMessage::pure_ack(12).encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();
        assert!(!decoded.is_data());
        assert_eq!(decoded.ack, Some(12));
        assert_eq!(decoded.payload, None);
    }

    #[test]
    fn missing_params_defaults_to_empty() {
        let decoded = WireMessage::decode(br#"{"seq":4,"method":"ping"}"#).unwrap();
        let payload = decoded.payload.expect("payload");
        assert_eq!(payload.method, "ping");
        assert!(payload.params.is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(WireMessage::decode(b"not json").is_err());
        assert!(WireMessage::decode(br#"{"method":"no-seq"}"#).is_err());
    }
}
