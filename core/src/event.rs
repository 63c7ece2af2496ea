//! The CloudEvents envelope that flows through the broker
//!
//! VIRTA treats events as opaque except for their context attributes: the
//! required CloudEvents attributes, the optional ones triggers filter on, and
//! the extension map. The payload is carried verbatim and never interpreted.
//!
//! Events serialize to the CloudEvents v1.0 JSON format. That is also the
//! wire representation at every backend boundary: Redis stream entries and
//! Kafka record values both hold one JSON document per event.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventError;

/// The only CloudEvents version the broker speaks.
pub const SPEC_VERSION: &str = "1.0";

/// A CloudEvents v1.0 envelope.
///
/// Unknown top-level JSON members are collected into `extensions`, which is a
/// `BTreeMap` so that serialization is key-sorted and byte-stable.
///
/// # Example
///
/// ```
/// use virta_core::Event;
///
/// let event = Event::new("e1", "/sensors/door", "door.opened")
///     .with_extension("zone", "warehouse");
///
/// assert_eq!(event.attribute("type").as_deref(), Some("door.opened"));
/// assert_eq!(event.attribute("zone").as_deref(), Some("warehouse"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub specversion: String,

    /// Producer-assigned identifier, unique per source.
    pub id: String,

    /// Context in which the event happened (URI-reference).
    pub source: String,

    /// Kind of occurrence, e.g. `com.example.order.placed`.
    #[serde(rename = "type")]
    pub ty: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Media type of `data`, e.g. `application/json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// JSON payload. Mutually exclusive with `data_base64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Base64-encoded binary payload.
    #[serde(
        default,
        rename = "data_base64",
        skip_serializing_if = "Option::is_none"
    )]
    pub data_base64: Option<String>,

    /// Extension attributes, flattened into the JSON document.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl Event {
    /// Create an event with the required context attributes and the current
    /// timestamp.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        ty: impl Into<String>,
    ) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            id: id.into(),
            source: source.into(),
            ty: ty.into(),
            subject: None,
            datacontenttype: None,
            time: Some(Utc::now()),
            data: None,
            data_base64: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Attach a JSON payload and its content type.
    pub fn with_json_data(mut self, data: Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self
    }

    /// Attach an opaque binary payload, stored base64-encoded.
    pub fn with_binary_data(mut self, content_type: impl Into<String>, data: &[u8]) -> Self {
        self.datacontenttype = Some(content_type.into());
        self.data_base64 = Some(base64::engine::general_purpose::STANDARD.encode(data));
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_extension(name, value);
        self
    }

    /// Set an extension attribute, replacing any previous value.
    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extensions
            .insert(name.into(), Value::String(value.into()));
    }

    /// Look up a context attribute by name.
    ///
    /// Core CloudEvents attributes take precedence over extensions with the
    /// same name. Non-string extension values are rendered in their canonical
    /// string form, which is what filter expressions compare against.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "specversion" => Some(self.specversion.clone()),
            "id" => Some(self.id.clone()),
            "source" => Some(self.source.clone()),
            "type" => Some(self.ty.clone()),
            "subject" => self.subject.clone(),
            "datacontenttype" => self.datacontenttype.clone(),
            "time" => self.time.map(|t| t.to_rfc3339()),
            _ => self.extensions.get(name).and_then(canonical_string),
        }
    }

    /// Check the envelope against the CloudEvents contract.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.specversion != SPEC_VERSION {
            return Err(EventError::Validation(format!(
                "unsupported specversion {:?}",
                self.specversion
            )));
        }
        if self.id.is_empty() {
            return Err(EventError::Validation("id must not be empty".to_string()));
        }
        if self.source.is_empty() {
            return Err(EventError::Validation(
                "source must not be empty".to_string(),
            ));
        }
        if self.ty.is_empty() {
            return Err(EventError::Validation("type must not be empty".to_string()));
        }
        Ok(())
    }

    /// Serialize to the CloudEvents JSON format.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Malformed(e.to_string()))
    }

    /// Deserialize from the CloudEvents JSON format.
    ///
    /// The returned event is decoded but not yet validated; callers that
    /// accept untrusted input should run [`Event::validate`] as well.
    pub fn from_json(data: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(data).map_err(|e| EventError::Malformed(e.to_string()))
    }

    /// Decode the binary payload if `data_base64` is set.
    pub fn binary_data(&self) -> Result<Option<Vec<u8>>, EventError> {
        match &self.data_base64 {
            None => Ok(None),
            Some(b64) => base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map(Some)
                .map_err(|e| EventError::Malformed(format!("data_base64: {e}"))),
        }
    }
}

fn canonical_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
