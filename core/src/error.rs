//! Error types for the VIRTA event envelope

use thiserror::Error;

/// Errors produced while decoding or validating CloudEvents.
///
/// These surface at the codec seams: HTTP ingest, backend deserialization and
/// reply parsing. Transport-level failures live in the broker crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The payload could not be decoded into a CloudEvent.
    ///
    /// Examples: invalid JSON, a missing required attribute, a `data_base64`
    /// field that is not valid base64.
    #[error("malformed CloudEvent: {0}")]
    Malformed(String),

    /// The event decoded but violates the CloudEvents contract.
    ///
    /// Examples: empty `id` or `source`, an unsupported `specversion`.
    #[error("invalid CloudEvent: {0}")]
    Validation(String),
}
