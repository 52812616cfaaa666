//! Wire envelope for queued work.
//!
//! ```json
//! { "job": "CallQueuedHandler@call",
//!   "maxTries": 3, "timeout": 60,
//!   "data": { "commandName": "send_invoice", "command": "{\"id\":42}" },
//!   "attempts": 0, "id": "5b2c..." }
//! ```
//!
//! The raw string is what the store keeps, both as list element and as sorted
//! set member. Changing `attempts` therefore means rewriting the whole string.

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    bus::Command,
    codec::{json::JsonCodec, JobCodec},
    types::JobId,
    QueueError, QueueResult,
};

/// Locator of the generic handler that fires object payloads
pub const CALL_QUEUED_HANDLER: &str = "CallQueuedHandler@call";

/// Decoded payload envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Handler locator
    pub job: String,

    #[serde(default)]
    pub max_tries: Option<u32>,

    /// Advisory execution timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub id: String,
}

impl Payload {
    /// Copy of this payload with a different attempt count; the id is kept
    pub fn with_attempts(&self, attempts: u32) -> Self {
        Self {
            attempts,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this payload carries a serialized command
    pub fn is_object(&self) -> bool {
        self.job == CALL_QUEUED_HANDLER
    }

    /// Command name for object payloads, the locator otherwise
    pub fn display_name(&self) -> &str {
        self.data
            .get("commandName")
            .and_then(Value::as_str)
            .unwrap_or(&self.job)
    }

    /// Batch this payload was dispatched with, if any
    pub fn batch_id(&self) -> Option<&str> {
        self.data.get("batchId").and_then(Value::as_str)
    }
}

/// `data` section of an object payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandData {
    pub command_name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

/// A command already serialized and detached from its Rust type.
///
/// Lets commands of different types travel together, e.g. in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub name: String,
    pub command: Value,
    pub tries: Option<u32>,
    pub timeout: Option<u64>,
    pub queue: Option<String>,
    pub connection: Option<String>,
}

impl QueuedCommand {
    pub fn new<C: Command>(command: &C) -> QueueResult<Self> {
        let value = serde_json::to_value(command).map_err(|e| {
            QueueError::InvalidPayload(format!("unable to serialize command [{}]: {}", C::NAME, e))
        })?;

        Ok(Self {
            name: C::NAME.to_string(),
            command: value,
            tries: command.tries(),
            timeout: command.timeout(),
            queue: command.queue().map(str::to_string),
            connection: command.connection().map(str::to_string),
        })
    }
}

/// A freshly encoded payload and the id assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub id: String,
    pub raw: String,
}

/// Builds and reads payload strings
#[derive(Clone)]
pub struct PayloadCodec {
    codec: Arc<dyn JobCodec>,
}

impl PayloadCodec {
    pub fn new(codec: Arc<dyn JobCodec>) -> Self {
        Self { codec }
    }

    /// Encode a command as an object payload
    pub fn encode_command<C: Command>(&self, command: &C, batch_id: Option<&str>) -> QueueResult<EncodedPayload> {
        self.encode_queued(&QueuedCommand::new(command)?, batch_id)
    }

    /// Encode an already-serialized command as an object payload
    pub fn encode_queued(&self, queued: &QueuedCommand, batch_id: Option<&str>) -> QueueResult<EncodedPayload> {
        let data = CommandData {
            command_name: queued.name.clone(),
            command: self.codec.encode(&queued.command)?,
            batch_id: batch_id.map(str::to_string),
        };

        self.finish(Payload {
            job: CALL_QUEUED_HANDLER.to_string(),
            max_tries: queued.tries,
            timeout: queued.timeout,
            data: serde_json::to_value(data)?,
            attempts: 0,
            id: JobId::new().0,
        })
    }

    /// Encode a plain `locator + data` payload
    pub fn encode_plain(&self, job: &str, data: Value) -> QueueResult<EncodedPayload> {
        self.finish(Payload {
            job: job.to_string(),
            max_tries: None,
            timeout: None,
            data,
            attempts: 0,
            id: JobId::new().0,
        })
    }

    pub fn decode(&self, raw: &str) -> QueueResult<Payload> {
        decode(raw)
    }

    /// Extract the command section of an object payload
    pub fn decode_command(&self, payload: &Payload) -> QueueResult<(CommandData, Value)> {
        let data: CommandData = serde_json::from_value(payload.data.clone()).map_err(|e| {
            QueueError::InvalidPayload(format!("payload {} has no command section: {}", payload.id, e))
        })?;
        let command = self.codec.decode(&data.command)?;
        Ok((data, command))
    }

    fn finish(&self, payload: Payload) -> QueueResult<EncodedPayload> {
        let raw = payload.to_json()?;

        // The string must come back out of the store intact.
        let check: Payload = serde_json::from_str(&raw)?;
        if check != payload {
            return Err(QueueError::InvalidPayload(format!(
                "payload {} does not survive a round trip",
                payload.id
            )));
        }

        Ok(EncodedPayload { id: payload.id, raw })
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(Arc::new(JsonCodec))
    }
}

/// Decode a raw payload string
pub fn decode(raw: &str) -> QueueResult<Payload> {
    serde_json::from_str(raw).map_err(|e| QueueError::InvalidPayload(e.to_string()))
}

/// Rewrite the `attempts` field of a raw payload.
///
/// Only the digits of the top-level `attempts` member change; every other
/// byte is kept, so key order and wide integers in `data` come back as they
/// went in. A payload without the member gets it inserted first.
pub fn rewrite_attempts(raw: &str, attempts: u32) -> QueueResult<String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| QueueError::InvalidPayload("payload is not a JSON object".to_string()))?;

    if let Some(span) = attempts_span(raw) {
        return Ok(format!("{}{}{}", &raw[..span.start], attempts, &raw[span.end..]));
    }
    if object.contains_key("attempts") {
        return Err(QueueError::InvalidPayload("attempts is not a whole number".to_string()));
    }

    // Objects start with `{` once leading whitespace is skipped.
    let open = raw.len() - raw.trim_start().len() + 1;
    let rest = &raw[open..];
    let separator = if object.is_empty() { "" } else { "," };
    Ok(format!("{}\"attempts\":{}{}{}", &raw[..open], attempts, separator, rest))
}

/// Byte range of the digits of the top-level `"attempts"` member
fn attempts_span(raw: &str) -> Option<Range<usize>> {
    let bytes = raw.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }

                if depth == 1 && bytes.get(start..=i) == Some(&b"\"attempts\""[..]) {
                    let mut j = skip_whitespace(bytes, i + 1);
                    if bytes.get(j) == Some(&b':') {
                        j = skip_whitespace(bytes, j + 1);
                        let digits = j;
                        while bytes.get(j).is_some_and(|b| b.is_ascii_digit()) {
                            j += 1;
                        }
                        let ends_number = !matches!(bytes.get(j), Some(b'.' | b'e' | b'E'));
                        return (j > digits && ends_number).then_some(digits..j);
                    }
                }
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }

    None
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while bytes.get(i).is_some_and(|b| b.is_ascii_whitespace()) {
        i += 1;
    }
    i
}

/// Read the `attempts` field of a raw payload
pub fn attempts_of(raw: &str) -> QueueResult<u32> {
    Ok(decode(raw)?.attempts)
}
