//! Observable broker state
//!
//! The broker aggregates ingest state plus one entry per subscription into a
//! [`Status`] snapshot. Snapshots are pushed to pluggable [`StatusBackend`]s
//! by the [`StatusManager`] reconciler, which debounces writes so that bursty
//! subscription churn produces an amortized-constant write rate.

mod file;
mod manager;

pub use file::FileStatusBackend;
pub use manager::{StatusManager, StatusManagerConfig};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Ingest endpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestState {
    Ready,
    Running,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestStatus {
    pub status: IngestState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Time of the last event accepted into the broker.
    #[serde(
        default,
        rename = "lastIngested",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_ingested: Option<DateTime<Utc>>,
}

impl IngestStatus {
    pub fn new(status: IngestState) -> Self {
        Self {
            status,
            message: None,
            last_ingested: None,
        }
    }
}

/// Per-subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Ready,
    Running,
    Failed,
    /// A bounded subscription reached its end bound.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub status: SubscriptionState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Time of the last event handed to this subscription's dispatcher.
    #[serde(
        default,
        rename = "lastProcessed",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_processed: Option<DateTime<Utc>>,
}

impl SubscriptionStatus {
    pub fn new(status: SubscriptionState) -> Self {
        Self {
            status,
            message: None,
            last_processed: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A full status snapshot for one broker instance.
///
/// Subscriptions are kept in a `BTreeMap` so serialization is key-sorted: the
/// serialized form is a function of the in-memory state only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,

    pub ingest: IngestStatus,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subscriptions: BTreeMap<String, SubscriptionStatus>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            last_updated: Utc::now(),
            ingest: IngestStatus::new(IngestState::Ready),
            subscriptions: BTreeMap::new(),
        }
    }
}

/// Destination for status snapshots, e.g. a file shared between instances.
#[async_trait]
pub trait StatusBackend: Send + Sync {
    /// Short identifier for logging.
    fn name(&self) -> &str;

    /// Persist the snapshot. Failures are retried on the next reconcile
    /// cycle, so implementations should not retry internally.
    async fn update_status(&self, status: &Status) -> Result<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn serialization_is_key_sorted() {
        let mut status = Status::default();
        for name in ["zeta", "alpha", "mid"] {
            status.subscriptions.insert(
                name.to_string(),
                SubscriptionStatus::new(SubscriptionState::Ready),
            );
        }

        let json = serde_json::to_string(&status).unwrap();
        let alpha = json.find("\"alpha\"").unwrap();
        let mid = json.find("\"mid\"").unwrap();
        let zeta = json.find("\"zeta\"").unwrap();
        assert!(alpha < mid && mid < zeta);
    }

    #[test]
    fn states_serialize_as_bare_strings() {
        let json = serde_json::to_string(&SubscriptionState::Complete).unwrap();
        assert_eq!(json, "\"Complete\"");
        let json = serde_json::to_string(&IngestState::Running).unwrap();
        assert_eq!(json, "\"Running\"");
    }

    #[test]
    fn status_round_trips() {
        let mut status = Status::default();
        status.subscriptions.insert(
            "t1".to_string(),
            SubscriptionStatus::new(SubscriptionState::Failed).with_message("boom"),
        );

        let json = serde_json::to_vec(&status).unwrap();
        let back: Status = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, status);
    }
}
