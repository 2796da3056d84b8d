//! CloudEvent Envelope
//!
//! Every message crossing the bridge is framed as a CloudEvents 1.0 event in
//! JSON structured mode. The same encoding is used on the UDP and the MQTT
//! side, so an envelope decoded from one transport is re-encoded unchanged for
//! the other.
//!
//! ```json
//! {
//!   "specversion": "1.0",
//!   "id": "5e0c...",
//!   "type": "com.bosch-engineering.ping",
//!   "source": "https://bosch-engineering.com",
//!   "datacontenttype": "text/plain",
//!   "data": "ping"
//! }
//! ```

mod error;

#[cfg(test)]
mod tests;

pub use error::{CreationError, DecodeError, EncodeError};

use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// CloudEvents specification version produced by this crate
pub const SPEC_VERSION: &str = "1.0";

/// Event payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// JSON value carried in `data` (plain strings included)
    Json(Value),
    /// Raw bytes carried base64-encoded in `data_base64`
    Binary(Bytes),
}

impl From<&str> for EventData {
    fn from(text: &str) -> Self {
        EventData::Json(Value::String(text.to_string()))
    }
}

impl From<String> for EventData {
    fn from(text: String) -> Self {
        EventData::Json(Value::String(text))
    }
}

impl From<Bytes> for EventData {
    fn from(bytes: Bytes) -> Self {
        EventData::Binary(bytes)
    }
}

/// A CloudEvent
///
/// Envelopes are immutable values; accessors hand out borrowed views only.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    spec_version: String,
    id: String,
    event_type: String,
    source: String,
    subject: Option<String>,
    time: Option<String>,
    data_content_type: Option<String>,
    data_schema: Option<String>,
    data: Option<EventData>,
    extensions: Map<String, Value>,
}

/// JSON shape of a structured-mode event
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(default = "default_spec_version")]
    specversion: String,
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    datacontenttype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dataschema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_base64: Option<String>,
    #[serde(flatten)]
    extensions: Map<String, Value>,
}

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

impl Envelope {
    /// Build a new event with a fresh UUID v4 id and the current time
    pub fn create(
        event_type: &str,
        source: &str,
        data: Option<EventData>,
    ) -> Result<Self, CreationError> {
        if event_type.is_empty() {
            return Err(CreationError::EmptyAttribute("type"));
        }
        if source.is_empty() {
            return Err(CreationError::EmptyAttribute("source"));
        }

        let data_content_type = match &data {
            Some(EventData::Json(Value::String(_))) => Some("text/plain".to_string()),
            Some(EventData::Json(_)) => Some("application/json".to_string()),
            Some(EventData::Binary(_)) => Some("application/octet-stream".to_string()),
            None => None,
        };

        Ok(Self {
            spec_version: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            subject: None,
            time: Some(humantime::format_rfc3339_millis(SystemTime::now()).to_string()),
            data_content_type,
            data_schema: None,
            data,
            extensions: Map::new(),
        })
    }

    /// Parse a wire payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireEvent = serde_json::from_slice(payload)?;

        if wire.id.is_empty() {
            return Err(DecodeError::MissingAttribute("id"));
        }
        if wire.event_type.is_empty() {
            return Err(DecodeError::MissingAttribute("type"));
        }

        let data = match (wire.data, wire.data_base64) {
            (Some(_), Some(_)) => return Err(DecodeError::ConflictingData),
            (Some(value), None) => Some(EventData::Json(value)),
            (None, Some(encoded)) => Some(EventData::Binary(Bytes::from(
                BASE64.decode(encoded.as_bytes())?,
            ))),
            (None, None) => None,
        };

        Ok(Self {
            spec_version: wire.specversion,
            id: wire.id,
            event_type: wire.event_type,
            source: wire.source,
            subject: wire.subject,
            time: wire.time,
            data_content_type: wire.datacontenttype,
            data_schema: wire.dataschema,
            data,
            extensions: wire.extensions,
        })
    }

    /// Serialize to a wire payload
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let (data, data_base64) = match &self.data {
            Some(EventData::Json(value)) => (Some(value.clone()), None),
            Some(EventData::Binary(bytes)) => (None, Some(BASE64.encode(bytes))),
            None => (None, None),
        };

        let wire = WireEvent {
            specversion: self.spec_version.clone(),
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            source: self.source.clone(),
            subject: self.subject.clone(),
            time: self.time.clone(),
            datacontenttype: self.data_content_type.clone(),
            dataschema: self.data_schema.clone(),
            data,
            data_base64,
            extensions: self.extensions.clone(),
        };

        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn spec_version(&self) -> &str {
        &self.spec_version
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn time(&self) -> Option<&str> {
        self.time.as_deref()
    }

    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    pub fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }

    /// Extension attributes
    pub fn extensions(&self) -> &Map<String, Value> {
        &self.extensions
    }
}
