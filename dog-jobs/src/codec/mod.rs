pub mod json;

use serde_json::Value;

use crate::QueueResult;

/// Serializer for the opaque `command` blob carried by object payloads.
///
/// The queue never looks inside the blob; it only needs the value to survive
/// a trip through a string.
pub trait JobCodec: Send + Sync {
    /// Turn a serialized command into its blob form
    fn encode(&self, command: &Value) -> QueueResult<String>;

    /// Recover the serialized command from its blob form
    fn decode(&self, blob: &str) -> QueueResult<Value>;
}
