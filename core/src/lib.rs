//! VIRTA core types
//!
//! Shared leaf crate for the VIRTA CloudEvents broker. It owns the event
//! envelope that every other component passes around, so that backends,
//! delivery clients and tests can depend on it without pulling in the broker
//! itself.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod error;
pub mod event;

pub use error::EventError;
pub use event::{Event, SPEC_VERSION};
