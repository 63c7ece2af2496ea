//! CloudEvents HTTP protocol binding
//!
//! Decodes CloudEvents from HTTP messages in both binding modes:
//!
//! - structured: `Content-Type: application/cloudevents+json`, the whole
//!   event is the body.
//! - binary: context attributes travel as `ce-*` headers, the body is the
//!   payload and `Content-Type` maps to `datacontenttype`.
//!
//! Used by the ingest server for requests and by the delivery client for
//! replies carried in sink responses.

use base64::Engine;
use http::HeaderMap;
use serde_json::Value;

use virta_core::{Event, EventError, SPEC_VERSION};

/// Content type of structured-mode CloudEvents.
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Header prefix for binary-mode context attributes.
const CE_PREFIX: &str = "ce-";

/// Headers that map to named envelope fields rather than extensions.
const CORE_HEADERS: &[&str] = &[
    "ce-specversion",
    "ce-id",
    "ce-source",
    "ce-type",
    "ce-subject",
    "ce-time",
];

/// True when the message looks like a CloudEvent in either binding mode.
pub fn is_cloudevent(headers: &HeaderMap) -> bool {
    headers.contains_key("ce-specversion")
        || content_type(headers)
            .map(|ct| ct.starts_with(STRUCTURED_CONTENT_TYPE))
            .unwrap_or(false)
}

/// Decode an HTTP message into a validated CloudEvent.
pub fn event_from_http(headers: &HeaderMap, body: &[u8]) -> Result<Event, EventError> {
    let event = if let Some(ct) = content_type(headers) {
        if ct.starts_with(STRUCTURED_CONTENT_TYPE) {
            Event::from_json(body)?
        } else {
            binary_event(headers, body)?
        }
    } else {
        binary_event(headers, body)?
    };

    event.validate()?;
    Ok(event)
}

fn binary_event(headers: &HeaderMap, body: &[u8]) -> Result<Event, EventError> {
    if !headers.contains_key("ce-specversion") {
        return Err(EventError::Malformed(
            "neither binary nor structured CloudEvent".to_string(),
        ));
    }

    let specversion = header(headers, "ce-specversion")?.unwrap_or_default();
    if specversion != SPEC_VERSION {
        return Err(EventError::Validation(format!(
            "unsupported specversion {specversion:?}"
        )));
    }

    let mut event = Event::new(
        header(headers, "ce-id")?.unwrap_or_default(),
        header(headers, "ce-source")?.unwrap_or_default(),
        header(headers, "ce-type")?.unwrap_or_default(),
    );
    event.time = None;

    event.subject = header(headers, "ce-subject")?;
    if let Some(time) = header(headers, "ce-time")? {
        let parsed = chrono::DateTime::parse_from_rfc3339(&time)
            .map_err(|e| EventError::Malformed(format!("ce-time: {e}")))?;
        event.time = Some(parsed.with_timezone(&chrono::Utc));
    }

    for (name, value) in headers {
        let name = name.as_str();
        if !name.starts_with(CE_PREFIX) || CORE_HEADERS.contains(&name) {
            continue;
        }
        let value = value
            .to_str()
            .map_err(|e| EventError::Malformed(format!("{name}: {e}")))?;
        event.set_extension(&name[CE_PREFIX.len()..], value);
    }

    if !body.is_empty() {
        let ct = content_type(headers).unwrap_or_default();
        event.datacontenttype = Some(ct.clone()).filter(|c| !c.is_empty());
        if ct.contains("json") {
            event.data = Some(
                serde_json::from_slice::<Value>(body)
                    .map_err(|e| EventError::Malformed(format!("body: {e}")))?,
            );
        } else {
            event.data_base64 =
                Some(base64::engine::general_purpose::STANDARD.encode(body));
        }
    }

    Ok(event)
}

fn header(headers: &HeaderMap, name: &str) -> Result<Option<String>, EventError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|e| EventError::Malformed(format!("{name}: {e}")))
        })
        .transpose()
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
