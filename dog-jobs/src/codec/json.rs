use serde_json::Value;

use crate::{codec::JobCodec, QueueError, QueueResult};

/// JSON codec for command blobs
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl JobCodec for JsonCodec {
    fn encode(&self, command: &Value) -> QueueResult<String> {
        serde_json::to_string(command).map_err(|e| QueueError::InvalidPayload(e.to_string()))
    }

    fn decode(&self, blob: &str) -> QueueResult<Value> {
        serde_json::from_str(blob).map_err(|e| QueueError::InvalidPayload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SendInvoice {
        id: u32,
        email: String,
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec;
        let command = SendInvoice {
            id: 42,
            email: "billing@example.com".to_string(),
        };

        let blob = codec.encode(&serde_json::to_value(&command).unwrap()).unwrap();
        assert!(blob.contains("billing@example.com"));

        let decoded: SendInvoice = serde_json::from_value(codec.decode(&blob).unwrap()).unwrap();
        assert_eq!(command, decoded);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = JsonCodec.decode("not json");
        assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
    }
}
