//! Stream messages

use crate::error::QueueError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Field name used by the JSON payload helpers.
pub const DATA_FIELD: &str = "data";

/// A single message on a stream.
///
/// Messages published with an empty `id` are assigned a server-generated
/// `<ms>-<seq>` ID; [`crate::Publisher::publish`] writes it back into the
/// message.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Stream entry ID (`<ms>-<seq>`). Empty until published.
    pub id: String,

    /// Name of the stream this message belongs to.
    pub stream: String,

    /// Field/value pairs carried by the entry.
    pub values: HashMap<String, String>,

    /// Deliveries of this message to any consumer before the current one.
    pub(crate) retry_count: i64,
}

impl Message {
    /// Create a message ready for publishing.
    pub fn new(stream: impl Into<String>, values: HashMap<String, String>) -> Self {
        Self {
            id: String::new(),
            stream: stream.into(),
            values,
            retry_count: 0,
        }
    }

    /// Create a message carrying `payload` as JSON under the
    /// [`DATA_FIELD`] field.
    pub fn json<T: Serialize>(stream: impl Into<String>, payload: &T) -> Result<Self, QueueError> {
        let encoded = serde_json::to_string(payload)?;
        let mut values = HashMap::new();
        values.insert(DATA_FIELD.to_string(), encoded);
        Ok(Self::new(stream, values))
    }

    /// Decode the JSON payload stored under the [`DATA_FIELD`] field.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        let raw = self.values.get(DATA_FIELD).ok_or_else(|| {
            QueueError::Internal(format!(
                "message {} has no '{DATA_FIELD}' field",
                self.id
            ))
        })?;
        Ok(serde_json::from_str(raw)?)
    }

    /// How many times this message was delivered to any consumer before the
    /// current delivery. Zero for a fresh message.
    pub fn retry_count(&self) -> i64 {
        self.retry_count
    }

    /// Creation time encoded in the entry ID, if the ID is well-formed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let millis = self.id.split('-').next()?.parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    #[test]
    fn test_json_round_trip() {
        let payload = Reading {
            sensor: "kitchen".to_string(),
            value: 21.5,
        };

        let message = Message::json("sensor.updated", &payload).unwrap();
        assert_eq!(message.stream, "sensor.updated");
        assert!(message.id.is_empty());
        assert!(message.values.contains_key(DATA_FIELD));

        let decoded: Reading = message.decode().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_without_data_field() {
        let message = Message::new("sensor.updated", HashMap::new());
        assert!(message.decode::<Reading>().is_err());
    }

    #[test]
    fn test_timestamp_from_id() {
        let mut message = Message::new("sensor.updated", HashMap::new());
        message.id = "1564886140363-0".to_string();

        let ts = message.timestamp().unwrap();
        assert_eq!(ts.timestamp_millis(), 1_564_886_140_363);
    }

    #[test]
    fn test_timestamp_with_bad_id() {
        let mut message = Message::new("sensor.updated", HashMap::new());
        message.id = "not-an-id".to_string();
        assert!(message.timestamp().is_none());
    }
}
