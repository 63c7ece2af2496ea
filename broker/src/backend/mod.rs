//! Event-log backends
//!
//! A backend owns the durable (or in-memory) event log: it appends produced
//! events and runs one reader per subscription, pushing events into the
//! caller-supplied dispatcher. The three implementations share nothing but
//! this trait.
//!
//! # Delivery contract
//!
//! For any subscribed event the dispatcher is invoked at least once;
//! acknowledgment to the log happens only after the dispatcher's future
//! resolves. Within one subscription events are dispatched in log order,
//! though dispatches may overlap in flight. Producing after drain has started
//! fails fast with [`BrokerError::Closing`].

pub mod kafka;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use virta_core::Event;

use crate::config::TriggerBounds;
use crate::error::Result;
use crate::status::SubscriptionStatus;

/// Bound on a full drain when the broker shuts down.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Bound on waiting for a single subscription's reader to settle.
pub const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extension attribute carrying the backend position of a dispatched event,
/// set when tracking is enabled. Stream id on Redis, offset on Kafka.
pub const BACKEND_ID_ATTRIBUTE: &str = "virtabackendid";

/// Receives events read from the log. The backend considers the event
/// processed (and acknowledges it) when the returned future resolves.
pub type ConsumerDispatcher = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives subscription status transitions originated by the backend, e.g.
/// a bounded subscription completing.
pub type SubscriptionStatusChange = Arc<dyn Fn(SubscriptionStatus) + Send + Sync>;

/// Descriptor for a backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: &'static str,
}

/// The pluggable event-log abstraction.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Information about the backend implementation. Infallible.
    fn info(&self) -> BackendInfo;

    /// Connect and perform initialization tasks. Must be called before any
    /// other method except [`Backend::info`]. Errors are fatal.
    async fn init(&self, ctx: CancellationToken) -> Result<()>;

    /// Append one event to the log.
    async fn produce(&self, event: &Event) -> Result<()>;

    /// Set up a named reader that passes events to `dispatcher`.
    ///
    /// `bounds` restricts the window of the log the subscription will
    /// deliver; `None` subscribes from "now". Names are unique per backend
    /// instance: subscribing an existing name fails, and replacing one
    /// requires an explicit unsubscribe first.
    async fn subscribe(
        &self,
        name: &str,
        bounds: Option<&TriggerBounds>,
        dispatcher: ConsumerDispatcher,
        status: SubscriptionStatusChange,
    ) -> Result<()>;

    /// Remove a subscription by name, waiting (bounded by
    /// [`UNSUBSCRIBE_TIMEOUT`]) for its reader to settle. Idempotent; a
    /// missing name is a no-op.
    async fn unsubscribe(&self, name: &str);

    /// Block until `ctx` is cancelled, then drain all subscriptions bounded
    /// by [`DISCONNECT_TIMEOUT`] before releasing the client.
    async fn start(&self, ctx: CancellationToken) -> Result<()>;

    /// Liveness check against the backing store.
    async fn probe(&self) -> Result<()>;
}
